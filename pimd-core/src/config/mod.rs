//! Configuration for pimd.
//!
//! A single file at `~/.config/pimd/config.toml` holds the global settings
//! and one `[sources.<uid>]` table per configured source.

mod source;

pub use source::{RemoteSection, SourceConfig};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Backend, BackendSettings, DEFAULT_MAX_WORKERS};
use crate::cache::FileCache;
use crate::error::{BackendError, BackendResult};
use crate::meta::{MetaSettings, MetaSyncEngine};
use crate::notify::{DEFAULT_THRESHOLD, NotifySettings};
use crate::provider::ProviderConnector;

static DEFAULT_CACHE_ROOT: &str = "~/.cache/pimd";
const DEFAULT_NOTIFY_DEBOUNCE_MS: u64 = 333;

fn default_cache_root() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_ROOT)
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_notify_debounce_ms() -> u64 {
    DEFAULT_NOTIFY_DEBOUNCE_MS
}

fn default_notify_threshold() -> usize {
    DEFAULT_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Worker count for sources that are not `serial`.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_notify_debounce_ms")]
    pub notify_debounce_ms: u64,

    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: usize,

    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            cache_root: default_cache_root(),
            max_workers: DEFAULT_MAX_WORKERS,
            notify_debounce_ms: DEFAULT_NOTIFY_DEBOUNCE_MS,
            notify_threshold: DEFAULT_THRESHOLD,
            sources: BTreeMap::new(),
        }
    }
}

impl GlobalConfig {
    pub fn config_path() -> BackendResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| BackendError::Config("Could not determine config directory".into()))?
            .join("pimd");

        Ok(config_dir.join("config.toml"))
    }

    /// Load the user's config, writing a commented default first if none
    /// exists.
    pub fn load() -> BackendResult<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> BackendResult<Self> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BackendError::Config(e.to_string()))
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> BackendResult<()> {
        let contents = format!(
            "\
# pimd configuration

# Where source caches and attachments are kept:
# cache_root = \"{DEFAULT_CACHE_ROOT}\"

# Parallel operations per source:
# max_workers = {DEFAULT_MAX_WORKERS}

# View change batching:
# notify_debounce_ms = {DEFAULT_NOTIFY_DEBOUNCE_MS}
# notify_threshold = {DEFAULT_THRESHOLD}

# One table per source:
# [sources.work]
# kind = \"event\"
# conflict_resolution = \"fail\"
# refresh_interval_secs = 600
#
# [sources.work.remote]
# provider = \"caldav\"
# url = \"https://dav.example.com/calendars/me/work/\"
"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| BackendError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }

    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.cache_root.to_string_lossy()).into_owned())
    }

    pub fn source(&self, uid: &str) -> BackendResult<&SourceConfig> {
        let source = self
            .sources
            .get(uid)
            .ok_or_else(|| BackendError::Config(format!("Unknown source '{uid}'")))?;
        if !source.kind.is_backend_kind() {
            return Err(BackendError::Config(format!(
                "Source '{uid}' has kind '{}'; expected event, task or memo",
                source.kind
            )));
        }
        Ok(source)
    }

    /// `<cache_root>/<kind>/<uid>`
    pub fn cache_dir(&self, uid: &str, source: &SourceConfig) -> PathBuf {
        self.cache_root().join(source.kind.as_str()).join(uid)
    }

    pub fn notify_settings(&self) -> NotifySettings {
        NotifySettings {
            debounce: Duration::from_millis(self.notify_debounce_ms),
            threshold: self.notify_threshold.max(1),
        }
    }

    pub fn backend_settings(&self, uid: &str) -> BackendResult<BackendSettings> {
        let source = self.source(uid)?;
        let mut settings = BackendSettings::new(uid, source.kind, self.cache_dir(uid, source));
        settings.writable = source.writable;
        settings.serial = source.serial;
        settings.max_workers = self.max_workers;
        settings.notify = self.notify_settings();
        Ok(settings)
    }

    /// Build the backend for a configured source: a file cache under the
    /// source's cache directory, synced through its provider. Must be
    /// called from within a tokio runtime; the backend is not opened yet.
    pub fn open_source(&self, uid: &str) -> BackendResult<Backend> {
        let source = self.source(uid)?;
        let remote = source
            .remote
            .as_ref()
            .ok_or_else(|| BackendError::Config(format!("Source '{uid}' has no [remote]")))?;

        let settings = self.backend_settings(uid)?;
        debug!(source = %uid, cache_dir = %settings.cache_dir.display(), "building backend");

        let cache = Arc::new(FileCache::open(&settings.cache_dir)?);
        let connector = Arc::new(ProviderConnector::new(
            remote.provider(),
            remote.remote_config(),
        ));

        let mut meta = MetaSettings::new(source.kind);
        meta.conflict_resolution = source.conflict_resolution;
        meta.refresh_on_open = source.refresh_on_open;

        let engine = MetaSyncEngine::new(connector, cache, meta);
        Backend::new(settings, Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConflictResolution;
    use crate::component::ComponentKind;

    fn write_config(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_defaults_when_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig::load_from(&dir.path().join("config.toml")).unwrap();

        assert_eq!(config.cache_root, PathBuf::from("~/.cache/pimd"));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.notify_debounce_ms, 333);
        assert_eq!(config.notify_threshold, 50);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_default_config_file_parses_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        GlobalConfig::create_default_config(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# cache_root = \"~/.cache/pimd\""));

        let config = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(config.max_workers, 4);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_sources_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
cache_root = "/var/cache/pimd"
max_workers = 8
notify_debounce_ms = 100

[sources.work]
kind = "event"
serial = true
conflict_resolution = "overwrite"

[sources.work.remote]
provider = "caldav"
url = "https://dav.example.com/work/"

[sources.notes]
kind = "memo"
writable = false
"#,
        );

        let config = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(config.sources.len(), 2);

        let work = config.source("work").unwrap();
        assert_eq!(work.conflict_resolution, ConflictResolution::Overwrite);

        let settings = config.backend_settings("work").unwrap();
        assert_eq!(settings.kind, ComponentKind::Event);
        assert_eq!(settings.cache_dir, PathBuf::from("/var/cache/pimd/event/work"));
        assert!(settings.serial);
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.notify.debounce, Duration::from_millis(100));
        assert_eq!(settings.notify.threshold, 50);

        let notes = config.backend_settings("notes").unwrap();
        assert!(!notes.writable);
        assert_eq!(notes.cache_dir, PathBuf::from("/var/cache/pimd/memo/notes"));
    }

    #[test]
    fn test_auxiliary_kind_is_not_a_source() {
        let mut config = GlobalConfig::default();
        config
            .sources
            .insert("zones".into(), toml::from_str("kind = \"timezone\"").unwrap());
        assert!(matches!(config.source("zones"), Err(BackendError::Config(_))));
    }

    #[test]
    fn test_unknown_source() {
        let config = GlobalConfig::default();
        assert!(matches!(
            config.source("nope"),
            Err(BackendError::Config(msg)) if msg.contains("nope")
        ));
    }

    #[tokio::test]
    async fn test_open_source_needs_a_remote() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GlobalConfig {
            cache_root: dir.path().to_path_buf(),
            ..GlobalConfig::default()
        };
        config.sources.insert(
            "local".into(),
            toml::from_str("kind = \"event\"").unwrap(),
        );

        assert!(matches!(
            config.open_source("local"),
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_source_builds_unopened_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GlobalConfig {
            cache_root: dir.path().to_path_buf(),
            ..GlobalConfig::default()
        };
        config.sources.insert(
            "work".into(),
            toml::from_str("kind = \"task\"\n[remote]\nprovider = \"fake\"\n").unwrap(),
        );

        let backend = config.open_source("work").unwrap();
        assert_eq!(backend.source_uid(), "work");
        assert_eq!(backend.kind(), ComponentKind::Task);
        assert!(!backend.is_opened());
        assert!(dir.path().join("task").join("work").is_dir());
    }
}
