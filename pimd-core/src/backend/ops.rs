//! The operation interface a concrete backend implements.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::OpContext;
use crate::component::{Component, ComponentId};
use crate::error::{BackendError, BackendResult};
use crate::notify::View;
use crate::query::Query;

/// Which part of a recurring series a modify or remove applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjModType {
    /// The given instance; for a master, the master itself.
    #[default]
    This,
    ThisAndPrior,
    ThisAndFuture,
    All,
    /// Like `This`, but fails instead of falling back to the master when no
    /// detached instance exists.
    OnlyThis,
}

impl FromStr for ObjModType {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "this" => Ok(ObjModType::This),
            "this-and-prior" => Ok(ObjModType::ThisAndPrior),
            "this-and-future" => Ok(ObjModType::ThisAndFuture),
            "all" => Ok(ObjModType::All),
            "only-this" => Ok(ObjModType::OnlyThis),
            other => Err(BackendError::InvalidArgument(format!(
                "Unknown recurrence modifier '{other}'"
            ))),
        }
    }
}

/// What to do when a write finds the remote object changed since the cache
/// last saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Surface the conflict as [`BackendError::OutOfSync`].
    #[default]
    Fail,
    /// Write again, unconditionally.
    Overwrite,
    /// Drop the local change and re-fetch the remote object into the cache.
    KeepServer,
    /// Let the connector merge both versions.
    Merge,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::Fail => "fail",
            ConflictResolution::Overwrite => "overwrite",
            ConflictResolution::KeepServer => "keep_server",
            ConflictResolution::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fail" => Ok(ConflictResolution::Fail),
            "overwrite" => Ok(ConflictResolution::Overwrite),
            "keep_server" => Ok(ConflictResolution::KeepServer),
            "merge" => Ok(ConflictResolution::Merge),
            other => Err(BackendError::InvalidArgument(format!(
                "Unknown conflict resolution '{other}'"
            ))),
        }
    }
}

/// Per-call options for write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationFlags {
    /// Overrides the source's configured conflict policy for this call.
    pub conflict: Option<ConflictResolution>,
}

impl OperationFlags {
    pub fn with_conflict(conflict: ConflictResolution) -> Self {
        OperationFlags {
            conflict: Some(conflict),
        }
    }
}

/// Old and new snapshot of a modified object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedObject {
    pub old: Option<Component>,
    pub new: Component,
}

/// Outcome of removing one object. `new` holds the master left behind when
/// only part of a recurring series was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedObject {
    pub id: ComponentId,
    pub old: Option<Component>,
    pub new: Option<Component>,
}

/// Operations a concrete backend provides. [`Backend`](super::Backend)
/// wraps these with the open check, the read-only check, dispatch and
/// change notification, so implementations only deal with data.
#[async_trait]
pub trait BackendOps: Send + Sync + 'static {
    /// Capability names reported through the `capabilities` property.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn open(&self, ctx: &OpContext) -> BackendResult<()>;

    async fn refresh(&self, _ctx: &OpContext) -> BackendResult<()> {
        Err(BackendError::NotSupported("refresh".into()))
    }

    /// The master and any detached instances for `id.uid`, or exactly the
    /// one instance when `id.rid` is set.
    async fn get_object(&self, ctx: &OpContext, id: &ComponentId) -> BackendResult<Vec<Component>>;

    async fn get_object_list(&self, ctx: &OpContext, query: &Query)
    -> BackendResult<Vec<Component>>;

    /// Returns the stored components, in input order.
    async fn create_objects(
        &self,
        ctx: &OpContext,
        objects: Vec<Component>,
        flags: OperationFlags,
    ) -> BackendResult<Vec<Component>>;

    async fn modify_objects(
        &self,
        ctx: &OpContext,
        objects: Vec<Component>,
        mod_type: ObjModType,
        flags: OperationFlags,
    ) -> BackendResult<Vec<ModifiedObject>>;

    async fn remove_objects(
        &self,
        ctx: &OpContext,
        ids: Vec<ComponentId>,
        mod_type: ObjModType,
        flags: OperationFlags,
    ) -> BackendResult<Vec<RemovedObject>>;

    async fn get_free_busy(
        &self,
        _ctx: &OpContext,
        _users: &[String],
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> BackendResult<Vec<Component>> {
        Err(BackendError::NotSupported("free/busy".into()))
    }

    async fn discard_alarm(
        &self,
        _ctx: &OpContext,
        _id: &ComponentId,
        _alarm_uid: &str,
        _flags: OperationFlags,
    ) -> BackendResult<()> {
        Err(BackendError::NotSupported("discard alarm".into()))
    }

    async fn add_timezone(&self, ctx: &OpContext, zone: Component) -> BackendResult<()> {
        ctx.timezones().add(&zone)?;
        Ok(())
    }

    async fn get_timezone(&self, ctx: &OpContext, tzid: &str) -> BackendResult<Component> {
        ctx.timezones()
            .get(tzid)
            .ok_or_else(|| BackendError::ObjectNotFound(format!("timezone {tzid}")))
    }

    /// Deliver the existing objects matching the view's query.
    async fn start_view(&self, ctx: &OpContext, view: &View) -> BackendResult<()>;

    fn stop_view(&self, _view: &View) {}

    /// Called (as a custom operation) after the backend's online state flips.
    async fn online_changed(&self, _ctx: &OpContext, _online: bool) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mod_type_from_str() {
        assert_eq!("this-and-future".parse::<ObjModType>().unwrap(), ObjModType::ThisAndFuture);
        assert_eq!("ONLY_THIS".parse::<ObjModType>().unwrap(), ObjModType::OnlyThis);
        assert!("sometimes".parse::<ObjModType>().is_err());
    }

    #[test]
    fn test_conflict_resolution_accepts_both_separators() {
        assert_eq!(
            "keep-server".parse::<ConflictResolution>().unwrap(),
            ConflictResolution::KeepServer
        );
        assert_eq!(
            "keep_server".parse::<ConflictResolution>().unwrap(),
            ConflictResolution::KeepServer
        );
        assert_eq!(ConflictResolution::KeepServer.to_string(), "keep_server");
    }
}
