pub mod create;
pub mod free_busy;
pub mod get;
pub mod list;
pub mod modify;
pub mod props;
pub mod refresh;
pub mod remove;
pub mod sources;
pub mod watch;

use std::io::Read;

use anyhow::{Context, Result};
use pimd_core::{Backend, GlobalConfig};
use tracing::debug;

/// Which source a command works on, and how.
pub struct Target {
    pub source: Option<String>,
    pub offline: bool,
}

impl Target {
    fn resolve_source(&self, config: &GlobalConfig) -> Result<String> {
        let available = || config.sources.keys().cloned().collect::<Vec<_>>().join(", ");

        match &self.source {
            Some(uid) => {
                if !config.sources.contains_key(uid) {
                    anyhow::bail!("Source '{}' not found. Available: {}", uid, available());
                }
                Ok(uid.clone())
            }
            None => match config.sources.len() {
                0 => anyhow::bail!(
                    "No sources configured.\n\n\
                    Add one to {}:\n  \
                    [sources.work]\n  \
                    kind = \"event\"\n\n  \
                    [sources.work.remote]\n  \
                    provider = \"caldav\"",
                    GlobalConfig::config_path()?.display()
                ),
                1 => Ok(config.sources.keys().next().cloned().unwrap_or_default()),
                _ => anyhow::bail!("Several sources configured; pick one with --source ({})", available()),
            },
        }
    }

    /// Build and open the backend. The open-time background refresh is
    /// skipped unless `refresh_on_open` is set; one-shot commands read the
    /// cache as it is.
    pub async fn open(&self, refresh_on_open: bool) -> Result<Backend> {
        let mut config = GlobalConfig::load()?;
        let uid = self.resolve_source(&config)?;
        if let Some(source) = config.sources.get_mut(&uid) {
            source.refresh_on_open &= refresh_on_open;
        }

        let backend = config.open_source(&uid)?;
        backend.set_online(!self.offline);
        debug!(source = %uid, offline = self.offline, "opening source");

        backend
            .open()
            .wait()
            .await
            .with_context(|| format!("Could not open source '{uid}'"))?;
        Ok(backend)
    }

    pub fn refresh_interval(&self) -> Result<Option<std::time::Duration>> {
        let config = GlobalConfig::load()?;
        let uid = self.resolve_source(&config)?;
        Ok(config.source(&uid)?.refresh_interval())
    }
}

/// Read iCalendar text from a file, or stdin for "-".
pub fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Could not read {file}"))
    }
}
