//! JSON protocol spoken with provider binaries over stdin/stdout.
//!
//! One [`Request`] line goes in, one [`Response`] comes out. Components
//! travel as iCalendar text.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::backend::ConflictResolution;
use crate::cache::ObjectDescriptor;
use crate::error::ErrorKind;

pub type RemoteConfig = serde_json::Map<String, serde_json::Value>;

pub trait ProviderCommand: Serialize {
    type Response: DeserializeOwned;
    fn command() -> Command;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Connect,
    Disconnect,
    ListExisting,
    LoadComponent,
    SaveComponent,
    RemoveComponent,
    GetFreeBusy,
}

/// Request sent from the engine to a provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response sent from a provider to the engine.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success {
        data: T,
    },
    Error {
        error: String,
        /// Lets the engine tell conflicts and offline remotes apart from
        /// plain failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

impl<T: Serialize> Response<T> {
    pub fn success(data: T) -> serde_json::Result<String> {
        serde_json::to_string(&Response::Success { data })
    }
}

impl Response<()> {
    pub fn error(msg: &str, kind: Option<ErrorKind>) -> serde_json::Result<String> {
        serde_json::to_string(&Response::<()>::Error {
            error: msg.to_string(),
            kind,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Connect {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
}

impl ProviderCommand for Connect {
    type Response = ();
    fn command() -> Command {
        Command::Connect
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Disconnect {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
}

impl ProviderCommand for Disconnect {
    type Response = ();
    fn command() -> Command {
        Command::Disconnect
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExisting {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListExistingResponse {
    #[serde(default)]
    pub sync_tag: Option<String>,
    pub objects: Vec<ObjectDescriptor>,
}

impl ProviderCommand for ListExisting {
    type Response = ListExistingResponse;
    fn command() -> Command {
        Command::ListExisting
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadComponent {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadComponentResponse {
    /// VCALENDAR with the master, detached instances and timezones.
    pub ics: String,
    pub revision: String,
    #[serde(default)]
    pub extra: Option<String>,
}

impl ProviderCommand for LoadComponent {
    type Response = LoadComponentResponse;
    fn command() -> Command {
        Command::LoadComponent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveComponent {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
    pub overwrite_existing: bool,
    pub conflict: ConflictResolution,
    pub ics: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_revision: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveComponentResponse {
    #[serde(default)]
    pub uid: Option<String>,
    pub revision: String,
    #[serde(default)]
    pub extra: Option<String>,
}

impl ProviderCommand for SaveComponent {
    type Response = SaveComponentResponse;
    fn command() -> Command {
        Command::SaveComponent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveComponent {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
    pub conflict: ConflictResolution,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_revision: Option<String>,
}

impl ProviderCommand for RemoveComponent {
    type Response = ();
    fn command() -> Command {
        Command::RemoveComponent
    }
}

/// Free/busy for a time range; times are UTC `YYYYMMDDTHHMMSSZ`.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetFreeBusy {
    #[serde(flatten)]
    pub remote_config: RemoteConfig,
    pub users: Vec<String>,
    pub start: String,
    pub end: String,
}

impl ProviderCommand for GetFreeBusy {
    type Response = Vec<String>;
    fn command() -> Command {
        Command::GetFreeBusy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_config_is_flattened_into_params() {
        let mut remote_config = RemoteConfig::new();
        remote_config.insert("url".into(), json!("https://dav.example.com/cal/"));
        let cmd = RemoveComponent {
            remote_config,
            conflict: ConflictResolution::KeepServer,
            uid: "abc".into(),
            extra: None,
            expected_revision: Some("\"etag-1\"".into()),
        };

        let request = Request {
            command: RemoveComponent::command(),
            params: serde_json::to_value(cmd).unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "command": "remove_component",
                "params": {
                    "url": "https://dav.example.com/cal/",
                    "conflict": "keep_server",
                    "uid": "abc",
                    "expected_revision": "\"etag-1\"",
                }
            })
        );
    }

    #[test]
    fn test_error_response_carries_kind() {
        let text = r#"{"status":"error","error":"etag mismatch","kind":"out_of_sync"}"#;
        let response: Response<()> = serde_json::from_str(text).unwrap();
        match response {
            Response::Error { error, kind } => {
                assert_eq!(error, "etag mismatch");
                assert_eq!(kind, Some(ErrorKind::OutOfSync));
            }
            Response::Success { .. } => panic!("expected error"),
        }

        let bare: Response<()> =
            serde_json::from_str(r#"{"status":"error","error":"boom"}"#).unwrap();
        assert!(matches!(bare, Response::Error { kind: None, .. }));
    }

    #[test]
    fn test_success_helper() {
        let text = Response::success(vec!["BEGIN:VFREEBUSY"]).unwrap();
        let parsed: Response<Vec<String>> = serde_json::from_str(&text).unwrap();
        assert!(matches!(parsed, Response::Success { data } if data.len() == 1));
    }
}
