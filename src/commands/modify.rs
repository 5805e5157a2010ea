use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::{ObjModType, OperationFlags};

use super::create::split_objects;
use super::{Target, read_input};

pub async fn run(
    target: Target,
    file: &str,
    mod_type: ObjModType,
    flags: OperationFlags,
) -> Result<()> {
    let objects = split_objects(&read_input(file)?)?;
    if objects.is_empty() {
        anyhow::bail!("No objects found in {file}");
    }
    let count = objects.len();

    let backend = target.open(false).await?;
    backend.modify_objects(objects, mod_type, flags).wait().await?;

    println!("{} {}", "~".yellow(), format!("Modified {count}").yellow());
    Ok(())
}
