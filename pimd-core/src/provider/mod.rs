//! Connector backed by a provider subprocess.
//!
//! Each call runs the external binary `pimd-provider-<name>`, writes one
//! JSON request to its stdin and reads one JSON response from its stdout.
//! Any executable that speaks the protocol can be a provider; it manages
//! its own credentials and receives the source's `[remote]` table as
//! parameters.

pub mod protocol;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::backend::OpContext;
use crate::error::{BackendError, BackendResult};
use crate::ics;
use crate::meta::{
    Connector, ExistingObjects, LoadedComponent, RemoveRequest, SaveRequest, SavedComponent,
};
use protocol::{
    Command, Connect, Disconnect, GetFreeBusy, ListExisting, LoadComponent, ProviderCommand,
    RemoteConfig, RemoveComponent, Request, Response, SaveComponent,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const BINARY_PREFIX: &str = "pimd-provider-";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Provider {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    binary: Option<PathBuf>,
}

impl Provider {
    pub fn from_name(name: &str) -> Self {
        Provider {
            name: name.to_string(),
            binary: None,
        }
    }

    /// Use an explicit executable instead of searching `PATH`.
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = Some(path.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn binary_path(&self) -> BackendResult<PathBuf> {
        if let Some(path) = &self.binary {
            return Ok(path.clone());
        }
        let binary_name = format!("{BINARY_PREFIX}{}", self.name);
        which::which(&binary_name).map_err(|_| BackendError::ProviderNotInstalled(binary_name))
    }

    /// Call a typed command, giving up after `limit`.
    pub async fn call<C: ProviderCommand>(
        &self,
        cmd: C,
        limit: Duration,
    ) -> BackendResult<C::Response> {
        timeout(limit, self.call_raw(C::command(), cmd))
            .await
            .map_err(|_| BackendError::ProviderTimeout(limit.as_secs()))?
    }

    async fn call_raw<P: Serialize, R: DeserializeOwned>(
        &self,
        command: Command,
        params: P,
    ) -> BackendResult<R> {
        let params = serde_json::to_value(params)?;
        let request_json = serde_json::to_string(&Request { command, params })?;

        let binary_path = self.binary_path()?;
        trace!(provider = %self.name, ?command, "calling provider");

        let mut child = TokioCommand::new(&binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::Provider(format!("Failed to spawn {}: {e}", binary_path.display()))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Provider("Provider stdin unavailable".into()))?;
        stdin
            .write_all(format!("{request_json}\n").as_bytes())
            .await?;
        drop(stdin);

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(BackendError::Provider(format!(
                "Provider exited with status: {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let response_str = String::from_utf8_lossy(&output.stdout);
        if response_str.trim().is_empty() {
            return Err(BackendError::Provider("Provider returned no response".into()));
        }

        let response: Response<R> = serde_json::from_str(&response_str)
            .map_err(|e| BackendError::Provider(format!("Failed to parse response: {e}")))?;

        match response {
            Response::Success { data } => Ok(data),
            Response::Error { error, kind } => Err(match kind {
                Some(kind) => BackendError::from_kind(kind, error),
                None => BackendError::Provider(error),
            }),
        }
    }
}

/// [`Connector`] that forwards every primitive to a provider binary.
pub struct ProviderConnector {
    provider: Provider,
    remote_config: RemoteConfig,
    timeout: Duration,
}

impl ProviderConnector {
    pub fn new(provider: Provider, remote_config: RemoteConfig) -> Self {
        ProviderConnector {
            provider,
            remote_config,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn call<C: ProviderCommand + Send>(
        &self,
        ctx: &OpContext,
        cmd: C,
    ) -> BackendResult<C::Response>
    where
        C::Response: Send,
    {
        ctx.run(self.provider.call(cmd, self.timeout)).await
    }
}

#[async_trait]
impl Connector for ProviderConnector {
    async fn connect(&self, ctx: &OpContext) -> BackendResult<()> {
        self.call(
            ctx,
            Connect {
                remote_config: self.remote_config.clone(),
            },
        )
        .await?;
        debug!(provider = %self.provider.name, "provider connected");
        Ok(())
    }

    async fn disconnect(&self, ctx: &OpContext) -> BackendResult<()> {
        self.call(
            ctx,
            Disconnect {
                remote_config: self.remote_config.clone(),
            },
        )
        .await
    }

    async fn list_existing(&self, ctx: &OpContext) -> BackendResult<ExistingObjects> {
        let listing = self
            .call(
                ctx,
                ListExisting {
                    remote_config: self.remote_config.clone(),
                },
            )
            .await?;
        Ok(ExistingObjects {
            sync_tag: listing.sync_tag,
            objects: listing.objects,
        })
    }

    async fn load_component(
        &self,
        ctx: &OpContext,
        uid: &str,
        extra: Option<&str>,
    ) -> BackendResult<LoadedComponent> {
        let loaded = self
            .call(
                ctx,
                LoadComponent {
                    remote_config: self.remote_config.clone(),
                    uid: uid.to_string(),
                    extra: extra.map(str::to_string),
                },
            )
            .await?;
        Ok(LoadedComponent {
            components: ics::parse_components(&loaded.ics)?,
            revision: loaded.revision,
            extra: loaded.extra,
        })
    }

    async fn save_component(
        &self,
        ctx: &OpContext,
        request: SaveRequest,
    ) -> BackendResult<SavedComponent> {
        let saved = self
            .call(
                ctx,
                SaveComponent {
                    remote_config: self.remote_config.clone(),
                    overwrite_existing: request.overwrite_existing,
                    conflict: request.conflict,
                    ics: ics::to_vcalendar(&request.instances),
                    extra: request.extra,
                    expected_revision: request.expected_revision,
                },
            )
            .await?;
        Ok(SavedComponent {
            uid: saved.uid,
            revision: saved.revision,
            extra: saved.extra,
        })
    }

    async fn remove_component(
        &self,
        ctx: &OpContext,
        request: RemoveRequest,
    ) -> BackendResult<()> {
        self.call(
            ctx,
            RemoveComponent {
                remote_config: self.remote_config.clone(),
                conflict: request.conflict,
                uid: request.uid,
                extra: request.extra,
                expected_revision: request.expected_revision,
            },
        )
        .await
    }

    async fn get_free_busy(
        &self,
        ctx: &OpContext,
        users: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BackendResult<Vec<crate::component::Component>> {
        let blocks = self
            .call(
                ctx,
                GetFreeBusy {
                    remote_config: self.remote_config.clone(),
                    users: users.to_vec(),
                    start: ics::format_utc(start),
                    end: ics::format_utc(end),
                },
            )
            .await?;

        let mut components = Vec::new();
        for block in blocks {
            components.extend(ics::parse_components(&block)?);
        }
        Ok(components)
    }
}
