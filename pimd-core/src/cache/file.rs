//! File-backed cache.
//!
//! Layout inside the cache directory:
//!
//! ```text
//! objects/<uid>[.<rid>].ics   one component per file (segments base64url-encoded)
//! index.json                  revision, extra and offline state per object
//! keys.json                   free-form keys (sync tag, ...)
//! ```
//!
//! Everything is mirrored in memory and written through on each change.
//! Files are written to a temporary name and renamed into place. Memory
//! only changes for good once the index has been written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    CachedObject, ObjectCache, OfflineState, encode_path_segment, instance_ids, sort_instances,
};
use crate::component::{Component, ComponentId};
use crate::error::{BackendError, BackendResult};

const OBJECTS_DIR: &str = "objects";
const INDEX_FILE: &str = "index.json";
const KEYS_FILE: &str = "keys.json";

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rid: Option<String>,
    revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra: Option<String>,
    #[serde(default)]
    state: OfflineState,
    file: String,
}

#[derive(Default)]
struct FileState {
    objects: BTreeMap<ComponentId, CachedObject>,
    keys: BTreeMap<String, String>,
}

pub struct FileCache {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl FileCache {
    /// Open (creating if needed) the cache stored in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> BackendResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(OBJECTS_DIR))?;

        let mut state = FileState::default();

        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            let entries: Vec<IndexEntry> = serde_json::from_str(&content)?;
            for entry in entries {
                match load_object(&dir, entry) {
                    Ok((id, object)) => {
                        state.objects.insert(id, object);
                    }
                    Err(e) => warn!(error = %e, "skipping unreadable cache entry"),
                }
            }
        }

        let keys_path = dir.join(KEYS_FILE);
        if keys_path.exists() {
            let content = std::fs::read_to_string(&keys_path)?;
            state.keys = serde_json::from_str(&content)?;
        }

        debug!(dir = %dir.display(), objects = state.objects.len(), "file cache opened");
        Ok(FileCache {
            dir,
            state: Mutex::new(state),
        })
    }

    fn object_path(&self, file: &str) -> PathBuf {
        self.dir.join(OBJECTS_DIR).join(file)
    }

    fn write_index(&self, objects: &BTreeMap<ComponentId, CachedObject>) -> BackendResult<()> {
        let entries: Vec<IndexEntry> = objects
            .iter()
            .map(|(id, object)| IndexEntry {
                uid: id.uid.clone(),
                rid: id.rid.clone(),
                revision: object.revision.clone(),
                extra: object.extra.clone(),
                state: object.state,
                file: object_file_name(id),
            })
            .collect();
        let content = serde_json::to_string_pretty(&entries)?;
        write_atomic(&self.dir.join(INDEX_FILE), &content)
    }

    fn write_keys(&self, state: &FileState) -> BackendResult<()> {
        let content = serde_json::to_string_pretty(&state.keys)?;
        write_atomic(&self.dir.join(KEYS_FILE), &content)
    }

    fn write_object(&self, id: &ComponentId, object: &CachedObject) -> BackendResult<()> {
        write_atomic(
            &self.object_path(&object_file_name(id)),
            &object.component.to_ics(),
        )
    }

    /// Delete an object file no longer listed in the index. A leftover file
    /// is never read back, so failures are only logged.
    fn discard_object_file(&self, id: &ComponentId) {
        let path = self.object_path(&object_file_name(id));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "could not delete cache file");
            }
        }
    }

    /// Persist the index for the objects now in memory, rolling back on
    /// failure. Returns `previous` once the index is written.
    fn commit(
        &self,
        state: &mut FileState,
        written: &[ComponentId],
        previous: Vec<(ComponentId, CachedObject)>,
    ) -> BackendResult<Vec<(ComponentId, CachedObject)>> {
        match self.write_index(&state.objects) {
            Ok(()) => Ok(previous),
            Err(e) => {
                warn!(error = %e, "cache index not written, rolling back");
                self.rollback(state, written, previous);
                Err(e)
            }
        }
    }

    /// Drop the objects in `written` and put `previous` back, restoring
    /// their files as far as possible.
    fn rollback(
        &self,
        state: &mut FileState,
        written: &[ComponentId],
        previous: Vec<(ComponentId, CachedObject)>,
    ) {
        for id in written {
            state.objects.remove(id);
            self.discard_object_file(id);
        }
        for (id, object) in previous {
            if let Err(e) = self.write_object(&id, &object) {
                warn!(%id, error = %e, "could not restore cache file");
            }
            state.objects.insert(id, object);
        }
    }
}

fn object_file_name(id: &ComponentId) -> String {
    match &id.rid {
        // '.' is outside the base64url alphabet, so it separates unambiguously
        Some(rid) => format!(
            "{}.{}.ics",
            encode_path_segment(&id.uid),
            encode_path_segment(rid)
        ),
        None => format!("{}.ics", encode_path_segment(&id.uid)),
    }
}

fn load_object(dir: &Path, entry: IndexEntry) -> BackendResult<(ComponentId, CachedObject)> {
    let text = std::fs::read_to_string(dir.join(OBJECTS_DIR).join(&entry.file))?;
    let component = Component::parse(&text)?;
    let id = ComponentId::new(entry.uid, entry.rid);
    if component.id().as_ref() != Some(&id) {
        return Err(BackendError::InvalidObject(format!(
            "Cache file {} does not hold {id}",
            entry.file
        )));
    }
    Ok((
        id,
        CachedObject {
            component,
            revision: entry.revision,
            extra: entry.extra,
            state: entry.state,
        },
    ))
}

fn write_atomic(path: &Path, content: &str) -> BackendResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    std::fs::write(&temp, content)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

impl ObjectCache for FileCache {
    fn cache_dir(&self) -> &Path {
        &self.dir
    }

    fn get(&self, id: &ComponentId) -> BackendResult<Option<CachedObject>> {
        Ok(self.state.lock().objects.get(id).cloned())
    }

    fn get_by_uid(&self, uid: &str) -> BackendResult<Vec<CachedObject>> {
        let mut instances: Vec<_> = self
            .state
            .lock()
            .objects
            .iter()
            .filter(|(id, _)| id.uid == uid)
            .map(|(_, object)| object.clone())
            .collect();
        sort_instances(&mut instances);
        Ok(instances)
    }

    fn put(&self, object: CachedObject) -> BackendResult<()> {
        let id = object.id()?;
        let mut state = self.state.lock();

        self.write_object(&id, &object)?;
        let previous = state.objects.insert(id.clone(), object);
        self.commit(
            &mut state,
            &[id.clone()],
            previous.map(|p| (id, p)).into_iter().collect(),
        )?;
        Ok(())
    }

    fn remove(&self, id: &ComponentId) -> BackendResult<Option<CachedObject>> {
        let mut state = self.state.lock();
        let Some(removed) = state.objects.remove(id) else {
            return Ok(None);
        };

        let mut removed = self.commit(&mut state, &[], vec![(id.clone(), removed)])?;
        self.discard_object_file(id);
        Ok(removed.pop().map(|(_, object)| object))
    }

    /// All instances of `uid` are swapped under one index write.
    fn replace_uid(
        &self,
        uid: &str,
        objects: Vec<CachedObject>,
    ) -> BackendResult<Vec<CachedObject>> {
        let keep = instance_ids(uid, &objects)?;
        let objects = objects
            .into_iter()
            .map(|object| object.id().map(|id| (id, object)))
            .collect::<BackendResult<Vec<_>>>()?;
        let mut state = self.state.lock();

        let stale: Vec<ComponentId> = state
            .objects
            .keys()
            .filter(|id| id.uid == uid)
            .cloned()
            .collect();
        let previous: Vec<(ComponentId, CachedObject)> = stale
            .into_iter()
            .filter_map(|id| state.objects.remove(&id).map(|object| (id, object)))
            .collect();

        let mut written = Vec::with_capacity(objects.len());
        for (id, object) in objects {
            if let Err(e) = self.write_object(&id, &object) {
                self.rollback(&mut state, &written, previous);
                return Err(e);
            }
            state.objects.insert(id.clone(), object);
            written.push(id);
        }

        let mut dropped = Vec::new();
        for (id, object) in self.commit(&mut state, &written, previous)? {
            if !keep.contains(&id) {
                self.discard_object_file(&id);
                dropped.push(object);
            }
        }
        sort_instances(&mut dropped);
        Ok(dropped)
    }

    fn list_all(&self) -> BackendResult<Vec<CachedObject>> {
        Ok(self.state.lock().objects.values().cloned().collect())
    }

    fn get_key(&self, key: &str) -> BackendResult<Option<String>> {
        Ok(self.state.lock().keys.get(key).cloned())
    }

    fn set_key(&self, key: &str, value: Option<&str>) -> BackendResult<()> {
        let mut state = self.state.lock();
        match value {
            Some(value) => {
                state.keys.insert(key.to_string(), value.to_string());
            }
            None => {
                state.keys.remove(key);
            }
        }
        self.write_keys(&state)
    }

    fn clear(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        let objects_dir = self.dir.join(OBJECTS_DIR);
        if objects_dir.exists() {
            std::fs::remove_dir_all(&objects_dir)?;
        }
        std::fs::create_dir_all(&objects_dir)?;
        *state = FileState::default();
        self.write_index(&state.objects)?;
        self.write_keys(&state)
    }
}
