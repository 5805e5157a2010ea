//! The protocol-side collaborator of the sync engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::diff::{RemoteChanges, compute_changes};
use crate::backend::{ConflictResolution, OpContext};
use crate::cache::ObjectDescriptor;
use crate::component::Component;
use crate::error::{BackendError, BackendResult};

/// Everything the remote currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingObjects {
    pub sync_tag: Option<String>,
    pub objects: Vec<ObjectDescriptor>,
}

/// One remote object: the master and its detached instances, possibly
/// with the timezone definitions they reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedComponent {
    pub components: Vec<Component>,
    pub revision: String,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    /// Replace an existing remote object instead of creating one.
    pub overwrite_existing: bool,
    pub conflict: ConflictResolution,
    /// Master first, then detached instances, attachments inlined.
    pub instances: Vec<Component>,
    pub extra: Option<String>,
    /// Revision the cache last saw; the remote compares it under
    /// [`ConflictResolution::Fail`].
    pub expected_revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedComponent {
    /// Set when the remote assigned a different uid.
    pub uid: Option<String>,
    pub revision: String,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveRequest {
    pub conflict: ConflictResolution,
    pub uid: String,
    pub extra: Option<String>,
    pub expected_revision: Option<String>,
}

/// Minimal remote access from which the sync engine builds a complete,
/// offline-capable backend.
///
/// Calls may be dropped mid-flight when the operation is cancelled.
/// Unreachable remotes report [`BackendError::RepositoryOffline`]; a write
/// against a changed object reports [`BackendError::OutOfSync`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, ctx: &OpContext) -> BackendResult<()>;

    /// Must succeed when already disconnected.
    async fn disconnect(&self, ctx: &OpContext) -> BackendResult<()>;

    async fn list_existing(&self, ctx: &OpContext) -> BackendResult<ExistingObjects>;

    /// Changes since `last_sync_tag`. The default lists everything and
    /// diffs it against `local`; connectors with incremental sync override
    /// this.
    async fn get_changes(
        &self,
        ctx: &OpContext,
        _last_sync_tag: Option<&str>,
        local: &[ObjectDescriptor],
    ) -> BackendResult<RemoteChanges> {
        let existing = self.list_existing(ctx).await?;
        let mut changes = compute_changes(local, &existing.objects);
        changes.sync_tag = existing.sync_tag;
        Ok(changes)
    }

    async fn load_component(
        &self,
        ctx: &OpContext,
        uid: &str,
        extra: Option<&str>,
    ) -> BackendResult<LoadedComponent>;

    async fn save_component(
        &self,
        ctx: &OpContext,
        request: SaveRequest,
    ) -> BackendResult<SavedComponent>;

    async fn remove_component(&self, ctx: &OpContext, request: RemoveRequest)
    -> BackendResult<()>;

    async fn get_free_busy(
        &self,
        _ctx: &OpContext,
        _users: &[String],
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> BackendResult<Vec<Component>> {
        Err(BackendError::NotSupported("free/busy".into()))
    }
}
