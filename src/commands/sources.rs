use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::GlobalConfig;

use crate::render::Render;

pub fn run() -> Result<()> {
    let config = GlobalConfig::load()?;

    if config.sources.is_empty() {
        println!(
            "No sources configured. Edit {} to add one.",
            GlobalConfig::config_path()?.display()
        );
        return Ok(());
    }

    for (uid, source) in &config.sources {
        println!("{}", (uid.as_str(), source).render());
        println!(
            "   {}",
            config.cache_dir(uid, source).display().to_string().dimmed()
        );
    }
    Ok(())
}
