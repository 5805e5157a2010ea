//! Offline-capable backend built from a [`Connector`] and an [`ObjectCache`].
//!
//! Reads are served from the cache. Writes go to the remote first and land
//! in the cache with the remote's revision; while the remote is unreachable
//! they land in the cache marked as local changes and are uploaded by the
//! next refresh. Refresh diffs the remote listing against the cache.

mod attachments;
mod connector;
mod diff;
mod recurrence;

pub use attachments::{inline_attachments, remove_attachments, store_attachments};
pub use connector::{
    Connector, ExistingObjects, LoadedComponent, RemoveRequest, SaveRequest, SavedComponent,
};
pub use diff::{RemoteChanges, compute_changes};

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    Backend, BackendOps, ConflictResolution, ModifiedObject, ObjModType, OpContext,
    OperationFlags, RemovedObject,
};
use crate::cache::{CachedObject, ObjectCache, OfflineState};
use crate::component::{Component, ComponentId, ComponentKind, Property};
use crate::error::{BackendError, BackendResult};
use crate::ics;
use crate::notify::View;
use crate::query::Query;

/// Cache key holding the connector's last sync tag.
pub const SYNC_TAG_KEY: &str = "pimd::sync-tag";

#[derive(Debug, Clone)]
pub struct MetaSettings {
    pub kind: ComponentKind,
    /// Policy for writes that find the remote object changed, unless the
    /// operation's flags say otherwise.
    pub conflict_resolution: ConflictResolution,
    /// Queue a refresh right after a successful open.
    pub refresh_on_open: bool,
}

impl MetaSettings {
    pub fn new(kind: ComponentKind) -> Self {
        MetaSettings {
            kind,
            conflict_resolution: ConflictResolution::default(),
            refresh_on_open: true,
        }
    }
}

pub struct MetaSyncEngine {
    connector: Arc<dyn Connector>,
    cache: Arc<dyn ObjectCache>,
    settings: MetaSettings,
    connected: AsyncMutex<bool>,
}

/// Cache contents for one uid before and after re-fetching it.
struct Reloaded {
    old: Vec<CachedObject>,
    new: Vec<Component>,
}

enum SaveOutcome {
    Saved(SavedComponent),
    /// The conflict was resolved by taking the remote version.
    KeptServer(Reloaded),
}

enum WriteOutcome {
    Stored(Vec<Component>),
    KeptServer(Reloaded),
}

enum Removal {
    Whole,
    Partial {
        instances: Vec<Component>,
        old: Component,
        master: Option<Component>,
    },
}

impl MetaSyncEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Arc<dyn ObjectCache>,
        settings: MetaSettings,
    ) -> Self {
        MetaSyncEngine {
            connector,
            cache,
            settings,
            connected: AsyncMutex::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<dyn ObjectCache> {
        &self.cache
    }

    fn policy(&self, flags: OperationFlags) -> ConflictResolution {
        flags.conflict.unwrap_or(self.settings.conflict_resolution)
    }

    /// Connect unless already connected. `false` means the backend works
    /// offline, either by choice or because the remote is unreachable.
    async fn ensure_connected(&self, ctx: &OpContext) -> BackendResult<bool> {
        if !ctx.backend().is_online() {
            return Ok(false);
        }
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(true);
        }
        match ctx.run(self.connector.connect(ctx)).await {
            Ok(()) => {
                debug!(source = %ctx.backend().source_uid(), "connected");
                *connected = true;
                Ok(true)
            }
            Err(BackendError::RepositoryOffline) => {
                debug!(source = %ctx.backend().source_uid(), "remote unreachable, working offline");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn disconnect(&self, ctx: &OpContext) -> BackendResult<()> {
        let mut connected = self.connected.lock().await;
        if *connected {
            *connected = false;
            ctx.run(self.connector.disconnect(ctx)).await?;
            debug!(source = %ctx.backend().source_uid(), "disconnected");
        }
        Ok(())
    }

    async fn lost_connection(&self) {
        *self.connected.lock().await = false;
    }

    /// Replace everything cached under `uid` with `instances`.
    fn store_instances(
        &self,
        uid: &str,
        instances: &[Component],
        revision: &str,
        extra: Option<String>,
        state: OfflineState,
    ) -> BackendResult<()> {
        let objects = instances
            .iter()
            .map(|component| CachedObject {
                component: component.clone(),
                revision: revision.to_string(),
                extra: extra.clone(),
                state,
            })
            .collect();
        self.cache.replace_uid(uid, objects)?;
        Ok(())
    }

    fn remove_cached(&self, uid: &str) -> BackendResult<Vec<CachedObject>> {
        self.cache.replace_uid(uid, Vec::new())
    }

    /// Drop every trace of `uid`, attachment files included.
    fn purge(&self, uid: &str) -> BackendResult<Vec<CachedObject>> {
        let removed = self.remove_cached(uid)?;
        remove_attachments(self.cache.cache_dir(), uid)?;
        Ok(removed)
    }

    /// Store instances the remote accepted, following a uid it may have
    /// reassigned.
    fn store_saved(
        &self,
        uid: &str,
        mut instances: Vec<Component>,
        saved: SavedComponent,
    ) -> BackendResult<Vec<Component>> {
        let final_uid = match saved.uid {
            Some(new_uid) if new_uid != uid => {
                debug!(old = uid, new = %new_uid, "remote assigned a new uid");
                // Attachment files stay where they are; the instances still
                // point at them.
                self.remove_cached(uid)?;
                for component in &mut instances {
                    component.set_uid(new_uid.as_str());
                }
                new_uid
            }
            _ => uid.to_string(),
        };
        self.store_instances(
            &final_uid,
            &instances,
            &saved.revision,
            saved.extra,
            OfflineState::Synced,
        )?;
        Ok(instances)
    }

    /// Fetch `uid` from the remote and make the cache match it.
    async fn load_into_cache(
        &self,
        ctx: &OpContext,
        uid: &str,
        extra: Option<&str>,
    ) -> BackendResult<Reloaded> {
        let loaded = ctx
            .run(self.connector.load_component(ctx, uid, extra))
            .await?;

        let mut instances = Vec::new();
        for mut component in loaded.components {
            match component.kind() {
                Some(ComponentKind::Timezone) => {
                    ctx.timezones().add(&component)?;
                }
                Some(kind) if kind == self.settings.kind => {
                    store_attachments(self.cache.cache_dir(), &mut component)?;
                    instances.push(component);
                }
                _ => warn!(uid, name = %component.name, "ignoring unexpected component"),
            }
        }
        sort_series(&mut instances);

        let old = self.cache.get_by_uid(uid)?;
        if instances.is_empty() {
            self.purge(uid)?;
        } else {
            self.store_instances(
                uid,
                &instances,
                &loaded.revision,
                loaded.extra,
                OfflineState::Synced,
            )?;
        }
        Ok(Reloaded {
            old,
            new: instances,
        })
    }

    fn notify_reloaded(&self, backend: &Backend, reloaded: Reloaded) {
        let Reloaded { old, new } = reloaded;
        for component in &new {
            let previous = old
                .iter()
                .find(|o| !o.is_deleted() && o.component.id() == component.id());
            match previous {
                Some(previous) => backend
                    .notify_component_modified(Some(previous.component.clone()), component.clone()),
                None => backend.notify_component_created(component.clone()),
            }
        }
        let kept: HashSet<ComponentId> = new.iter().filter_map(Component::id).collect();
        for object in old {
            if object.is_deleted() {
                continue;
            }
            if let Some(id) = object.component.id().filter(|id| !kept.contains(id)) {
                backend.notify_component_removed(id, Some(object.component), None);
            }
        }
    }

    /// Save to the remote, applying `policy` when the remote reports a
    /// conflicting change.
    #[allow(clippy::too_many_arguments)]
    async fn save_remote(
        &self,
        ctx: &OpContext,
        uid: &str,
        instances: &[Component],
        overwrite_existing: bool,
        extra: Option<String>,
        expected_revision: Option<String>,
        policy: ConflictResolution,
    ) -> BackendResult<SaveOutcome> {
        let mut wire = instances.to_vec();
        for component in &mut wire {
            inline_attachments(component)?;
        }
        let mut request = SaveRequest {
            overwrite_existing,
            conflict: ConflictResolution::Fail,
            instances: wire,
            extra: extra.clone(),
            expected_revision,
        };

        let message = match ctx
            .run(self.connector.save_component(ctx, request.clone()))
            .await
        {
            Err(BackendError::OutOfSync(message)) => message,
            other => return other.map(SaveOutcome::Saved),
        };

        warn!(uid, policy = %policy, "remote object changed since last sync");
        match policy {
            ConflictResolution::Fail => Err(BackendError::OutOfSync(message)),
            ConflictResolution::KeepServer => {
                let reloaded = self.load_into_cache(ctx, uid, extra.as_deref()).await?;
                Ok(SaveOutcome::KeptServer(reloaded))
            }
            ConflictResolution::Overwrite | ConflictResolution::Merge => {
                request.conflict = policy;
                ctx.run(self.connector.save_component(ctx, request))
                    .await
                    .map(SaveOutcome::Saved)
            }
        }
    }

    /// Write a whole series, to the remote when reachable, else as a local
    /// change. `base` is the cache entry the edit started from.
    async fn write_series(
        &self,
        ctx: &OpContext,
        uid: &str,
        instances: Vec<Component>,
        base: &CachedObject,
        policy: ConflictResolution,
    ) -> BackendResult<WriteOutcome> {
        let unsent = base.state == OfflineState::LocallyCreated;

        if self.ensure_connected(ctx).await? {
            let expected = (!unsent).then(|| base.revision.clone());
            match self
                .save_remote(
                    ctx,
                    uid,
                    &instances,
                    !unsent,
                    base.extra.clone(),
                    expected,
                    policy,
                )
                .await
            {
                Ok(SaveOutcome::Saved(saved)) => {
                    return self.store_saved(uid, instances, saved).map(WriteOutcome::Stored);
                }
                Ok(SaveOutcome::KeptServer(reloaded)) => {
                    return Ok(WriteOutcome::KeptServer(reloaded));
                }
                Err(BackendError::RepositoryOffline) => self.lost_connection().await,
                Err(e) => return Err(e),
            }
        }

        let state = if unsent {
            OfflineState::LocallyCreated
        } else {
            OfflineState::LocallyModified
        };
        debug!(uid, ?state, "storing local change");
        self.store_instances(uid, &instances, &base.revision, base.extra.clone(), state)?;
        Ok(WriteOutcome::Stored(instances))
    }

    /// Remove a whole object. `false` when the conflict policy kept the
    /// remote version instead.
    async fn remove_series(
        &self,
        ctx: &OpContext,
        uid: &str,
        base: &CachedObject,
        policy: ConflictResolution,
    ) -> BackendResult<bool> {
        if base.state == OfflineState::LocallyCreated {
            self.purge(uid)?;
            return Ok(true);
        }

        if self.ensure_connected(ctx).await? {
            let request = RemoveRequest {
                conflict: ConflictResolution::Fail,
                uid: uid.to_string(),
                extra: base.extra.clone(),
                expected_revision: Some(base.revision.clone()),
            };
            match self.remove_remote(ctx, request, policy).await {
                Ok(true) => {
                    self.purge(uid)?;
                    return Ok(true);
                }
                Ok(false) => return Ok(false),
                Err(BackendError::RepositoryOffline) => self.lost_connection().await,
                Err(e) => return Err(e),
            }
        }

        debug!(uid, "marking object deleted locally");
        for mut object in self.cache.get_by_uid(uid)? {
            object.state = OfflineState::LocallyDeleted;
            self.cache.put(object)?;
        }
        Ok(true)
    }

    async fn remove_remote(
        &self,
        ctx: &OpContext,
        mut request: RemoveRequest,
        policy: ConflictResolution,
    ) -> BackendResult<bool> {
        let message = match ctx
            .run(self.connector.remove_component(ctx, request.clone()))
            .await
        {
            Ok(()) | Err(BackendError::ObjectNotFound(_)) => return Ok(true),
            Err(BackendError::OutOfSync(message)) => message,
            Err(e) => return Err(e),
        };

        warn!(uid = %request.uid, policy = %policy, "remote object changed since last sync");
        match policy {
            ConflictResolution::Fail => Err(BackendError::OutOfSync(message)),
            ConflictResolution::KeepServer => {
                let reloaded = self
                    .load_into_cache(ctx, &request.uid, request.extra.as_deref())
                    .await?;
                self.notify_reloaded(ctx.backend(), reloaded);
                Ok(false)
            }
            ConflictResolution::Overwrite | ConflictResolution::Merge => {
                request.conflict = policy;
                match ctx
                    .run(self.connector.remove_component(ctx, request))
                    .await
                {
                    Ok(()) | Err(BackendError::ObjectNotFound(_)) => Ok(true),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Push every change made while offline.
    async fn upload_offline_changes(&self, ctx: &OpContext) -> BackendResult<()> {
        let uids: BTreeSet<String> = self
            .cache
            .offline_changes()?
            .iter()
            .filter_map(|o| o.component.uid().map(str::to_string))
            .collect();
        if uids.is_empty() {
            return Ok(());
        }
        info!(source = %ctx.backend().source_uid(), count = uids.len(), "uploading offline changes");

        let policy = self.settings.conflict_resolution;
        for uid in uids {
            ctx.check_cancelled()?;
            let (deleted, visible): (Vec<_>, Vec<_>) = self
                .cache
                .get_by_uid(&uid)?
                .into_iter()
                .partition(CachedObject::is_deleted);

            let Some(base) = visible.first().or(deleted.first()).cloned() else {
                continue;
            };

            if visible.is_empty() {
                if base.state == OfflineState::LocallyCreated {
                    self.purge(&uid)?;
                    continue;
                }
                let request = RemoveRequest {
                    conflict: ConflictResolution::Fail,
                    uid: uid.clone(),
                    extra: base.extra.clone(),
                    expected_revision: Some(base.revision.clone()),
                };
                if self.remove_remote(ctx, request, policy).await? {
                    self.purge(&uid)?;
                }
                continue;
            }

            let unsent = base.state == OfflineState::LocallyCreated;
            let instances: Vec<Component> = visible.into_iter().map(|o| o.component).collect();
            let outcome = self
                .save_remote(
                    ctx,
                    &uid,
                    &instances,
                    !unsent,
                    base.extra.clone(),
                    (!unsent).then(|| base.revision.clone()),
                    policy,
                )
                .await?;
            match outcome {
                SaveOutcome::Saved(saved) => {
                    let stored = self.store_saved(&uid, instances.clone(), saved)?;
                    if stored.first().and_then(Component::uid) != Some(uid.as_str()) {
                        for old in instances {
                            if let Some(id) = old.id() {
                                ctx.backend().notify_component_removed(id, Some(old), None);
                            }
                        }
                        for new in stored {
                            ctx.backend().notify_component_created(new);
                        }
                    }
                }
                SaveOutcome::KeptServer(reloaded) => self.notify_reloaded(ctx.backend(), reloaded),
            }
        }
        Ok(())
    }

    async fn apply_changes(&self, ctx: &OpContext, changes: &RemoteChanges) -> BackendResult<()> {
        let backend = ctx.backend();

        for descriptor in &changes.removed {
            ctx.check_cancelled()?;
            let id = descriptor.id();
            let gone: Vec<CachedObject> = if id.is_instance() {
                self.cache.remove(&id)?.into_iter().collect()
            } else {
                self.purge(&id.uid)?
            };
            for object in gone {
                if object.is_deleted() {
                    continue;
                }
                if let Ok(id) = object.id() {
                    backend.notify_component_removed(id, Some(object.component), None);
                }
            }
        }

        let mut loaded = HashSet::new();
        for descriptor in changes.modified.iter().chain(&changes.created) {
            ctx.check_cancelled()?;
            if !loaded.insert(descriptor.uid.as_str()) {
                continue;
            }
            match self
                .load_into_cache(ctx, &descriptor.uid, descriptor.extra.as_deref())
                .await
            {
                Ok(reloaded) => self.notify_reloaded(backend, reloaded),
                Err(BackendError::ObjectNotFound(_)) => {
                    debug!(uid = %descriptor.uid, "object vanished before it could be loaded");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn free_busy_from_cache(
        &self,
        users: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BackendResult<Vec<Component>> {
        let mut busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = self
            .cache
            .search(&Query::all())?
            .iter()
            .filter(|c| occupies_time(c))
            .filter_map(busy_period)
            .filter(|(s, e)| *s < end && *e > start)
            .map(|(s, e)| (s.max(start), e.min(end)))
            .collect();
        busy.sort();

        let owners: Vec<Option<&String>> = if users.is_empty() {
            vec![None]
        } else {
            users.iter().map(Some).collect()
        };

        Ok(owners
            .into_iter()
            .map(|user| {
                let mut fb = Component::new(ComponentKind::FreeBusy);
                fb.set_property("DTSTAMP", ics::format_utc(Utc::now()));
                fb.set_property("DTSTART", ics::format_utc(start));
                fb.set_property("DTEND", ics::format_utc(end));
                if let Some(user) = user {
                    let address = if user.to_ascii_lowercase().starts_with("mailto:") {
                        user.clone()
                    } else {
                        format!("mailto:{user}")
                    };
                    fb.add_property(Property::new("ATTENDEE", address));
                }
                for (s, e) in &busy {
                    fb.add_property(
                        Property::new(
                            "FREEBUSY",
                            format!("{}/{}", ics::format_utc(*s), ics::format_utc(*e)),
                        )
                        .with_param("FBTYPE", "BUSY"),
                    );
                }
                fb
            })
            .collect())
    }
}

/// Master first, then detached instances by recurrence id.
fn sort_series(instances: &mut [Component]) {
    instances.sort_by(|a, b| {
        match (a.property("RECURRENCE-ID"), b.property("RECURRENCE-ID")) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => recurrence::compare_instances(a, b),
        }
    });
}

/// Keep SEQUENCE increasing across an edit.
fn advance_sequence(new: &mut Component, old: Option<&Component>) {
    if let Some(old) = old {
        if new.sequence() <= old.sequence() {
            new.set_property("SEQUENCE", (old.sequence() + 1).to_string());
        }
    }
}

/// Apply a modification to the cached series of one uid. Returns the new
/// series, the previous version of the edited instance and the edited
/// instance itself.
fn apply_modification(
    mut instances: Vec<Component>,
    mut new: Component,
    mod_type: ObjModType,
) -> BackendResult<(Vec<Component>, Option<Component>, Component)> {
    new.set_last_modified(Utc::now());
    let master_pos = instances.iter().position(|c| !c.is_instance());

    match (mod_type, new.property("RECURRENCE-ID").cloned()) {
        (ObjModType::ThisAndPrior, _) => {
            return Err(BackendError::NotSupported(
                "modifying this and prior instances".into(),
            ));
        }
        (_, None) => {
            let old = master_pos.map(|i| instances.remove(i));
            advance_sequence(&mut new, old.as_ref());
            instances.push(new.clone());
            sort_series(&mut instances);
            Ok((instances, old, new))
        }
        (ObjModType::All, Some(_)) => {
            // The instance's content applies to the series; timing stays
            // with the master.
            let Some(master_pos) = master_pos else {
                return Err(BackendError::ObjectNotFound(format!(
                    "{} has no master to modify",
                    new.uid().unwrap_or_default()
                )));
            };
            let old = instances.remove(master_pos);
            new.remove_properties("RECURRENCE-ID");
            for name in ["DTSTART", "DTEND", "DUE", "DURATION", "RRULE", "RDATE", "EXDATE"] {
                new.remove_properties(name);
                for property in old.properties_named(name) {
                    new.add_property(property.clone());
                }
            }
            advance_sequence(&mut new, Some(&old));
            instances.push(new.clone());
            sort_series(&mut instances);
            Ok((instances, Some(old), new))
        }
        (ObjModType::This | ObjModType::OnlyThis, Some(rid)) => {
            let old = take_instance(&mut instances, &rid.value);
            let previous = old
                .as_ref()
                .or_else(|| instances.iter().find(|c| !c.is_instance()));
            advance_sequence(&mut new, previous);
            instances.push(new.clone());
            sort_series(&mut instances);
            Ok((instances, old, new))
        }
        (ObjModType::ThisAndFuture, Some(rid)) => {
            let old = take_instance(&mut instances, &rid.value);
            instances.retain(|c| {
                c.property("RECURRENCE-ID")
                    .is_none_or(|other| recurrence::compare_instances(other, &rid) == Ordering::Less)
            });
            if let Some(property) = new.property_mut("RECURRENCE-ID") {
                property.set_param("RANGE", "THISANDFUTURE");
            }
            advance_sequence(&mut new, old.as_ref());
            instances.push(new.clone());
            sort_series(&mut instances);
            Ok((instances, old, new))
        }
    }
}

fn take_instance(instances: &mut Vec<Component>, rid: &str) -> Option<Component> {
    let pos = instances.iter().position(|c| c.rid() == Some(rid))?;
    Some(instances.remove(pos))
}

/// Work out what removing `id` leaves of the series.
fn plan_removal(
    mut instances: Vec<Component>,
    id: &ComponentId,
    mod_type: ObjModType,
) -> BackendResult<Removal> {
    let Some(rid) = id.rid.as_deref() else {
        return Ok(Removal::Whole);
    };

    let rid_property = match mod_type {
        ObjModType::All => return Ok(Removal::Whole),
        ObjModType::ThisAndPrior => {
            return Err(BackendError::NotSupported(
                "removing this and prior instances".into(),
            ));
        }
        _ => instances
            .iter()
            .find(|c| c.rid() == Some(rid))
            .and_then(|c| c.property("RECURRENCE-ID").cloned())
            .unwrap_or_else(|| Property::new("RECURRENCE-ID", rid)),
    };

    let detached = take_instance(&mut instances, rid);
    if mod_type == ObjModType::OnlyThis && detached.is_none() {
        return Err(BackendError::ObjectNotFound(id.to_string()));
    }

    let old_master = instances.iter().find(|c| !c.is_instance()).cloned();

    if mod_type == ObjModType::ThisAndFuture {
        instances.retain(|c| {
            c.property("RECURRENCE-ID").is_none_or(|other| {
                recurrence::compare_instances(other, &rid_property) == Ordering::Less
            })
        });
    }

    let master = match instances.iter_mut().find(|c| !c.is_instance()) {
        Some(master) => {
            match mod_type {
                ObjModType::This => recurrence::exclude_instance(master, &rid_property),
                ObjModType::ThisAndFuture => recurrence::end_series_before(master, &rid_property),
                _ => {}
            }
            master.bump_sequence();
            master.set_last_modified(Utc::now());
            Some(master.clone())
        }
        None if detached.is_none() => return Err(BackendError::ObjectNotFound(id.to_string())),
        None => None,
    };

    if instances.is_empty() {
        return Ok(Removal::Whole);
    }
    let old = match (detached, old_master) {
        (Some(detached), _) => detached,
        (None, Some(master)) => master,
        (None, None) => return Err(BackendError::ObjectNotFound(id.to_string())),
    };
    Ok(Removal::Partial {
        instances,
        old,
        master,
    })
}

fn occupies_time(component: &Component) -> bool {
    let transparent = component
        .property_value("TRANSP")
        .is_some_and(|t| t.eq_ignore_ascii_case("TRANSPARENT"));
    let cancelled = component
        .property_value("STATUS")
        .is_some_and(|s| s.eq_ignore_ascii_case("CANCELLED"));
    component.kind() == Some(ComponentKind::Event) && !transparent && !cancelled
}

fn busy_period(component: &Component) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let dtstart = component.property("DTSTART")?;
    let start = ics::parse_date_time(dtstart)?;
    let end = match component.property("DTEND").and_then(ics::parse_date_time) {
        Some(end) => end,
        None if dtstart.value.trim().len() == 8 => start + Duration::days(1),
        None => start,
    };
    (end > start).then_some((start, end))
}

#[async_trait]
impl BackendOps for MetaSyncEngine {
    fn capabilities(&self) -> Vec<String> {
        ["refresh-supported", "offline", "remove-only-this"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn open(&self, ctx: &OpContext) -> BackendResult<()> {
        let online = self.ensure_connected(ctx).await?;
        info!(
            source = %ctx.backend().source_uid(),
            online,
            cached = self.cache.list_all()?.len(),
            "cache ready"
        );
        if online && self.settings.refresh_on_open {
            let _ = ctx.backend().schedule_refresh();
        }
        Ok(())
    }

    async fn refresh(&self, ctx: &OpContext) -> BackendResult<()> {
        if !self.ensure_connected(ctx).await? {
            debug!(source = %ctx.backend().source_uid(), "offline, nothing to refresh");
            return Ok(());
        }

        self.upload_offline_changes(ctx).await?;

        loop {
            ctx.check_cancelled()?;
            let last_tag = self.cache.get_key(SYNC_TAG_KEY)?;
            let local = self.cache.list_descriptors()?;
            let changes = ctx
                .run(self.connector.get_changes(ctx, last_tag.as_deref(), &local))
                .await?;
            debug!(
                source = %ctx.backend().source_uid(),
                created = changes.created.len(),
                modified = changes.modified.len(),
                removed = changes.removed.len(),
                repeat = changes.may_need_repeat,
                "remote changes"
            );

            self.apply_changes(ctx, &changes).await?;
            self.cache.set_key(SYNC_TAG_KEY, changes.sync_tag.as_deref())?;

            if !changes.may_need_repeat {
                break;
            }
        }
        info!(source = %ctx.backend().source_uid(), "refresh finished");
        Ok(())
    }

    async fn get_object(&self, ctx: &OpContext, id: &ComponentId) -> BackendResult<Vec<Component>> {
        let mut instances = self.cache.visible_by_uid(&id.uid)?;

        if instances.is_empty() && self.ensure_connected(ctx).await? {
            match self.load_into_cache(ctx, &id.uid, None).await {
                Ok(reloaded) => {
                    self.notify_reloaded(ctx.backend(), reloaded);
                    instances = self.cache.visible_by_uid(&id.uid)?;
                }
                Err(BackendError::ObjectNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(instances
            .into_iter()
            .map(|o| o.component)
            .filter(|c| id.rid.is_none() || c.rid() == id.rid.as_deref())
            .collect())
    }

    async fn get_object_list(
        &self,
        _ctx: &OpContext,
        query: &Query,
    ) -> BackendResult<Vec<Component>> {
        self.cache.search(query)
    }

    async fn create_objects(
        &self,
        ctx: &OpContext,
        objects: Vec<Component>,
        flags: OperationFlags,
    ) -> BackendResult<Vec<Component>> {
        let policy = self.policy(flags);
        let mut created = Vec::with_capacity(objects.len());

        for mut component in objects {
            ctx.check_cancelled()?;
            let uid = match component.uid() {
                Some(uid) => uid.to_string(),
                None => {
                    let uid = Uuid::new_v4().to_string();
                    component.set_uid(uid.as_str());
                    uid
                }
            };
            if !self.cache.visible_by_uid(&uid)?.is_empty() {
                return Err(BackendError::ObjectIdAlreadyExists(uid));
            }

            let now = Utc::now();
            if component.property("CREATED").is_none() {
                component.set_created(now);
            }
            component.set_last_modified(now);

            let base = CachedObject {
                component: component.clone(),
                revision: String::new(),
                extra: None,
                state: OfflineState::LocallyCreated,
            };
            match self
                .write_series(ctx, &uid, vec![component], &base, policy)
                .await?
            {
                WriteOutcome::Stored(stored) => created.extend(stored.into_iter().take(1)),
                WriteOutcome::KeptServer(reloaded) => {
                    created.extend(reloaded.new.into_iter().filter(|c| !c.is_instance()));
                }
            }
        }
        Ok(created)
    }

    async fn modify_objects(
        &self,
        ctx: &OpContext,
        objects: Vec<Component>,
        mod_type: ObjModType,
        flags: OperationFlags,
    ) -> BackendResult<Vec<ModifiedObject>> {
        let policy = self.policy(flags);
        let mut modified = Vec::with_capacity(objects.len());

        for component in objects {
            ctx.check_cancelled()?;
            let uid = component
                .uid()
                .ok_or_else(|| BackendError::InvalidObject("Component has no UID".into()))?
                .to_string();
            let current = self.cache.visible_by_uid(&uid)?;
            let Some(base) = current.first().cloned() else {
                return Err(BackendError::ObjectNotFound(uid));
            };

            let series = current.into_iter().map(|o| o.component).collect();
            let (instances, old, new) = apply_modification(series, component, mod_type)?;

            match self.write_series(ctx, &uid, instances, &base, policy).await? {
                WriteOutcome::Stored(stored) => {
                    let new = stored
                        .into_iter()
                        .find(|c| c.rid() == new.rid())
                        .unwrap_or(new);
                    modified.push(ModifiedObject { old, new });
                }
                WriteOutcome::KeptServer(reloaded) => {
                    self.notify_reloaded(ctx.backend(), reloaded);
                }
            }
        }
        Ok(modified)
    }

    async fn remove_objects(
        &self,
        ctx: &OpContext,
        ids: Vec<ComponentId>,
        mod_type: ObjModType,
        flags: OperationFlags,
    ) -> BackendResult<Vec<RemovedObject>> {
        let policy = self.policy(flags);
        let mut removed = Vec::new();

        for id in ids {
            ctx.check_cancelled()?;
            let current = self.cache.visible_by_uid(&id.uid)?;
            let Some(base) = current.first().cloned() else {
                return Err(BackendError::ObjectNotFound(id.to_string()));
            };
            let series: Vec<Component> = current.into_iter().map(|o| o.component).collect();

            match plan_removal(series.clone(), &id, mod_type)? {
                Removal::Whole => {
                    if self.remove_series(ctx, &id.uid, &base, policy).await? {
                        removed.extend(series.into_iter().filter_map(|c| {
                            c.id().map(|id| RemovedObject {
                                id,
                                old: Some(c),
                                new: None,
                            })
                        }));
                    }
                }
                Removal::Partial {
                    instances,
                    old,
                    master,
                } => match self.write_series(ctx, &id.uid, instances, &base, policy).await? {
                    WriteOutcome::Stored(_) => removed.push(RemovedObject {
                        id,
                        old: Some(old),
                        new: master,
                    }),
                    WriteOutcome::KeptServer(reloaded) => {
                        self.notify_reloaded(ctx.backend(), reloaded);
                    }
                },
            }
        }
        Ok(removed)
    }

    async fn get_free_busy(
        &self,
        ctx: &OpContext,
        users: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BackendResult<Vec<Component>> {
        if self.settings.kind != ComponentKind::Event {
            return Err(BackendError::NotSupported(format!(
                "free/busy on {} sources",
                self.settings.kind
            )));
        }

        if self.ensure_connected(ctx).await? {
            match ctx
                .run(self.connector.get_free_busy(ctx, users, start, end))
                .await
            {
                Ok(blocks) => return Ok(blocks),
                Err(BackendError::NotSupported(_)) => {}
                Err(BackendError::RepositoryOffline) => self.lost_connection().await,
                Err(e) => return Err(e),
            }
        }
        self.free_busy_from_cache(users, start, end)
    }

    async fn start_view(&self, ctx: &OpContext, view: &View) -> BackendResult<()> {
        for component in self.cache.search(view.query())? {
            ctx.check_cancelled()?;
            view.notify_added(component);
        }
        Ok(())
    }

    async fn online_changed(&self, ctx: &OpContext, online: bool) -> BackendResult<()> {
        if online {
            self.refresh(ctx).await
        } else {
            self.disconnect(ctx).await
        }
    }
}
