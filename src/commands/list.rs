use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::Component;
use serde_json::{Value, json};

use super::Target;
use crate::render::{Render, RenderSortKey};

#[derive(Clone, Copy)]
pub enum ListFormat {
    Lines,
    Ics,
    Json,
}

pub async fn run(target: Target, query: &str, format: ListFormat) -> Result<()> {
    let backend = target.open(false).await?;
    let objects = backend.get_object_list(query).wait().await?;

    if let ListFormat::Ics = format {
        for text in &objects {
            print!("{text}");
        }
        return Ok(());
    }

    let mut components = objects
        .iter()
        .map(|text| Component::parse(text))
        .collect::<Result<Vec<_>, _>>()?;
    components.sort_by(|a, b| a.render_sort_key().cmp(&b.render_sort_key()));

    if let ListFormat::Json = format {
        let list: Vec<Value> = components.iter().map(to_json).collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if components.is_empty() {
        println!("{}", "   No objects".dimmed());
    }
    for component in &components {
        println!("   {}", component.render());
    }
    Ok(())
}

fn to_json(component: &Component) -> Value {
    json!({
        "uid": component.uid(),
        "rid": component.rid(),
        "summary": component.summary(),
        "start": component.property_value("DTSTART"),
        "ics": component.to_ics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pimd_core::ComponentKind;

    #[test]
    fn test_json_carries_identity_and_text() {
        let mut c = Component::new(ComponentKind::Task);
        c.set_uid("t1");
        c.set_property("SUMMARY", "File taxes");

        let value = to_json(&c);
        assert_eq!(value["uid"], "t1");
        assert_eq!(value["rid"], Value::Null);
        assert_eq!(value["summary"], "File taxes");
        assert_eq!(value["start"], Value::Null);
        assert!(value["ics"].as_str().unwrap().contains("UID:t1"));
    }
}
