use anyhow::Result;

use super::Target;

pub async fn run(target: Target, uid: &str, rid: Option<&str>) -> Result<()> {
    let backend = target.open(false).await?;
    let text = backend.get_object(uid, rid).wait().await?;
    print!("{text}");
    Ok(())
}
