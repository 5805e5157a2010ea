use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::{ComponentId, ObjModType, OperationFlags};

use super::Target;

pub async fn run(
    target: Target,
    uid: String,
    rid: Option<String>,
    mod_type: ObjModType,
    flags: OperationFlags,
) -> Result<()> {
    let id = ComponentId::new(uid, rid);
    let backend = target.open(false).await?;
    backend
        .remove_objects(vec![id.clone()], mod_type, flags)
        .wait()
        .await?;

    println!("{} {}", "-".red(), id.to_string().red());
    Ok(())
}
