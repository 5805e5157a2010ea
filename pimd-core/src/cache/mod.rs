//! Local object cache used by the meta-sync engine.
//!
//! The cache stores components keyed by `(uid, rid)` together with the
//! remote revision they were last synced at and their offline state. Each
//! implementation serializes its own mutations.

mod file;
mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

use std::collections::HashSet;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentId};
use crate::error::{BackendError, BackendResult};
use crate::query::Query;

/// Identity and version of one stored object, as used for diffing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub revision: String,
    /// Connector-private data (e.g. an href) carried alongside the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl ObjectDescriptor {
    pub fn new(uid: impl Into<String>, rid: Option<String>, revision: impl Into<String>) -> Self {
        ObjectDescriptor {
            uid: uid.into(),
            rid: rid.filter(|r| !r.is_empty()),
            revision: revision.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    pub fn id(&self) -> ComponentId {
        ComponentId::new(self.uid.clone(), self.rid.clone())
    }
}

/// Whether a cached object matches the remote, or carries a local change
/// still waiting to be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineState {
    #[default]
    Synced,
    LocallyCreated,
    LocallyModified,
    LocallyDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedObject {
    pub component: Component,
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default)]
    pub state: OfflineState,
}

impl CachedObject {
    pub fn synced(component: Component, revision: impl Into<String>, extra: Option<String>) -> Self {
        CachedObject {
            component,
            revision: revision.into(),
            extra,
            state: OfflineState::Synced,
        }
    }

    pub fn id(&self) -> BackendResult<ComponentId> {
        self.component
            .id()
            .ok_or_else(|| BackendError::InvalidObject("Cached component has no UID".into()))
    }

    pub fn is_deleted(&self) -> bool {
        self.state == OfflineState::LocallyDeleted
    }

    pub fn descriptor(&self) -> BackendResult<ObjectDescriptor> {
        let id = self.id()?;
        Ok(ObjectDescriptor {
            uid: id.uid,
            rid: id.rid,
            revision: self.revision.clone(),
            extra: self.extra.clone(),
        })
    }
}

pub trait ObjectCache: Send + Sync + 'static {
    /// Private directory for files that belong to this cache, such as
    /// materialized attachments.
    fn cache_dir(&self) -> &Path;

    fn get(&self, id: &ComponentId) -> BackendResult<Option<CachedObject>>;

    /// Every stored instance of `uid`, master first, including locally
    /// deleted ones.
    fn get_by_uid(&self, uid: &str) -> BackendResult<Vec<CachedObject>>;

    /// Insert or replace the object stored under the component's id.
    fn put(&self, object: CachedObject) -> BackendResult<()>;

    fn remove(&self, id: &ComponentId) -> BackendResult<Option<CachedObject>>;

    /// Replace every stored instance of `uid` with `objects` and return the
    /// stored instances that were dropped, master first.
    fn replace_uid(
        &self,
        uid: &str,
        objects: Vec<CachedObject>,
    ) -> BackendResult<Vec<CachedObject>> {
        let keep = instance_ids(uid, &objects)?;
        let mut dropped = Vec::new();
        for stale in self.get_by_uid(uid)? {
            let id = stale.id()?;
            if !keep.contains(&id) {
                dropped.extend(self.remove(&id)?);
            }
        }
        for object in objects {
            self.put(object)?;
        }
        Ok(dropped)
    }

    /// Every stored object, ordered by id.
    fn list_all(&self) -> BackendResult<Vec<CachedObject>>;

    fn get_key(&self, key: &str) -> BackendResult<Option<String>>;

    /// Store a key, or delete it with `None`.
    fn set_key(&self, key: &str, value: Option<&str>) -> BackendResult<()>;

    fn clear(&self) -> BackendResult<()>;

    /// Descriptors to diff against a remote listing. Objects created
    /// offline and not yet uploaded are left out, since the remote cannot
    /// know them.
    fn list_descriptors(&self) -> BackendResult<Vec<ObjectDescriptor>> {
        self.list_all()?
            .iter()
            .filter(|o| o.state != OfflineState::LocallyCreated)
            .map(CachedObject::descriptor)
            .collect()
    }

    /// Objects carrying a local change not yet uploaded.
    fn offline_changes(&self) -> BackendResult<Vec<CachedObject>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|o| o.state != OfflineState::Synced)
            .collect())
    }

    /// Visible (not locally deleted) components matching `query`.
    fn search(&self, query: &Query) -> BackendResult<Vec<Component>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|o| !o.is_deleted() && query.matches(&o.component))
            .map(|o| o.component)
            .collect())
    }

    /// Visible instances of `uid`, master first.
    fn visible_by_uid(&self, uid: &str) -> BackendResult<Vec<CachedObject>> {
        Ok(self
            .get_by_uid(uid)?
            .into_iter()
            .filter(|o| !o.is_deleted())
            .collect())
    }
}

/// Encode an arbitrary string (uid, rid) as a single filesystem-safe path
/// segment. Distinct inputs never collide.
pub fn encode_path_segment(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(value.as_bytes())
}

/// Ids of `objects`, which must all be instances of `uid`.
fn instance_ids(uid: &str, objects: &[CachedObject]) -> BackendResult<HashSet<ComponentId>> {
    objects
        .iter()
        .map(|object| {
            let id = object.id()?;
            if id.uid != uid {
                return Err(BackendError::InvalidObject(format!(
                    "{id} is not an instance of {uid}"
                )));
            }
            Ok(id)
        })
        .collect()
}

fn sort_instances(instances: &mut [CachedObject]) {
    instances.sort_by(|a, b| a.component.rid().cmp(&b.component.rid()));
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segments_do_not_collide() {
        let a = encode_path_segment("a.b");
        let b = encode_path_segment("a-b");
        assert_ne!(a, b);
        assert!(!encode_path_segment("../../etc/passwd").contains('/'));
    }

    #[test]
    fn test_descriptor_drops_empty_rid() {
        let d = ObjectDescriptor::new("1", Some(String::new()), "A");
        assert_eq!(d.id(), ComponentId::master("1"));
    }
}
