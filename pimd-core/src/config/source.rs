//! Per-source configuration: one `[sources.<uid>]` table.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ConflictResolution;
use crate::component::ComponentKind;
use crate::provider::{Provider, protocol::RemoteConfig};

fn default_writable() -> bool {
    true
}

fn default_refresh_on_open() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: ComponentKind,

    #[serde(default = "default_writable")]
    pub writable: bool,

    /// Run every operation of this source on a single worker.
    #[serde(default)]
    pub serial: bool,

    #[serde(default)]
    pub conflict_resolution: ConflictResolution,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_secs: Option<u64>,

    /// Sync with the remote in the background as soon as the source opens.
    #[serde(default = "default_refresh_on_open")]
    pub refresh_on_open: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSection>,
}

impl SourceConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// The provider that reaches this source's remote, plus whatever
/// parameters that provider expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    pub provider: String,

    /// Explicit provider executable; otherwise `pimd-provider-<provider>`
    /// is looked up in `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,

    #[serde(flatten)]
    pub params: BTreeMap<String, toml::Value>,
}

impl RemoteSection {
    pub fn provider(&self) -> Provider {
        let provider = Provider::from_name(&self.provider);
        match &self.binary {
            Some(path) => {
                let path = shellexpand::tilde(&path.to_string_lossy()).into_owned();
                provider.with_binary(path)
            }
            None => provider,
        }
    }

    /// Provider parameters in the JSON form sent with every request.
    pub fn remote_config(&self) -> RemoteConfig {
        self.params
            .iter()
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_params_are_kept_for_the_provider() {
        let source: SourceConfig = toml::from_str(
            r#"
kind = "task"
conflict_resolution = "keep_server"

[remote]
provider = "caldav"
url = "https://dav.example.com/tasks/"
verify_tls = false
"#,
        )
        .unwrap();

        assert_eq!(source.kind, ComponentKind::Task);
        assert!(source.writable);
        assert!(!source.serial);
        assert!(source.refresh_on_open);
        assert_eq!(source.conflict_resolution, ConflictResolution::KeepServer);

        let remote = source.remote.unwrap();
        assert_eq!(remote.provider().name(), "caldav");

        let params = remote.remote_config();
        assert_eq!(params.len(), 2);
        assert_eq!(params["url"], json!("https://dav.example.com/tasks/"));
        assert_eq!(params["verify_tls"], json!(false));
    }

    #[test]
    fn test_zero_refresh_interval_disables_timer() {
        let source: SourceConfig =
            toml::from_str("kind = \"event\"\nrefresh_interval_secs = 0\n").unwrap();
        assert_eq!(source.refresh_interval(), None);

        let source: SourceConfig =
            toml::from_str("kind = \"event\"\nrefresh_interval_secs = 600\n").unwrap();
        assert_eq!(source.refresh_interval(), Some(Duration::from_secs(600)));
    }
}
