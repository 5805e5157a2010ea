use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::BackendProperty;
use serde_json::{Map, Value};

use super::Target;

pub async fn run(target: Target, json: bool) -> Result<()> {
    let backend = target.open(false).await?;

    if json {
        let props: Map<String, Value> = BackendProperty::ALL
            .iter()
            .map(|p| (p.name().to_string(), Value::String(backend.property_value(*p))))
            .collect();
        println!("{}", serde_json::to_string_pretty(&props)?);
        return Ok(());
    }

    for property in BackendProperty::ALL {
        println!(
            "{:>12}  {}",
            property.name().dimmed(),
            backend.property_value(property)
        );
    }
    Ok(())
}
