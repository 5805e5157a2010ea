use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::{ComponentKind, OperationFlags, ics};

use super::{Target, read_input};

/// Split an iCalendar file into one object per component, each carrying
/// the file's timezone definitions.
pub fn split_objects(text: &str) -> Result<Vec<String>> {
    let components = ics::parse_components(text)?;
    let (zones, objects): (Vec<_>, Vec<_>) = components
        .into_iter()
        .partition(|c| c.kind() == Some(ComponentKind::Timezone));

    Ok(objects
        .into_iter()
        .map(|object| {
            let mut parts = zones.clone();
            parts.push(object);
            ics::to_vcalendar(&parts)
        })
        .collect())
}

pub async fn run(target: Target, file: &str, flags: OperationFlags) -> Result<()> {
    let objects = split_objects(&read_input(file)?)?;
    if objects.is_empty() {
        anyhow::bail!("No objects found in {file}");
    }

    let backend = target.open(false).await?;
    let uids = backend.create_objects(objects, flags).wait().await?;

    for uid in &uids {
        println!("{} {}", "+".green(), uid);
    }
    if backend.is_online() {
        println!("{}", format!("Created {} on the remote", uids.len()).dimmed());
    } else {
        println!(
            "{}",
            format!("Created {} locally; run `pimd refresh` to upload", uids.len()).dimmed()
        );
    }
    Ok(())
}
