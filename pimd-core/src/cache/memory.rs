//! In-memory cache, for tests and short-lived backends.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{CachedObject, ObjectCache, sort_instances};
use crate::component::ComponentId;
use crate::error::BackendResult;

pub struct MemoryCache {
    cache_dir: PathBuf,
    objects: Mutex<BTreeMap<ComponentId, CachedObject>>,
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    /// `cache_dir` is only used for attachment files.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        MemoryCache {
            cache_dir: cache_dir.into(),
            objects: Mutex::new(BTreeMap::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl ObjectCache for MemoryCache {
    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn get(&self, id: &ComponentId) -> BackendResult<Option<CachedObject>> {
        Ok(self.objects.lock().get(id).cloned())
    }

    fn get_by_uid(&self, uid: &str) -> BackendResult<Vec<CachedObject>> {
        let mut instances: Vec<_> = self
            .objects
            .lock()
            .iter()
            .filter(|(id, _)| id.uid == uid)
            .map(|(_, object)| object.clone())
            .collect();
        sort_instances(&mut instances);
        Ok(instances)
    }

    fn put(&self, object: CachedObject) -> BackendResult<()> {
        let id = object.id()?;
        self.objects.lock().insert(id, object);
        Ok(())
    }

    fn remove(&self, id: &ComponentId) -> BackendResult<Option<CachedObject>> {
        Ok(self.objects.lock().remove(id))
    }

    fn list_all(&self) -> BackendResult<Vec<CachedObject>> {
        Ok(self.objects.lock().values().cloned().collect())
    }

    fn get_key(&self, key: &str) -> BackendResult<Option<String>> {
        Ok(self.keys.lock().get(key).cloned())
    }

    fn set_key(&self, key: &str, value: Option<&str>) -> BackendResult<()> {
        let mut keys = self.keys.lock();
        match value {
            Some(value) => {
                keys.insert(key.to_string(), value.to_string());
            }
            None => {
                keys.remove(key);
            }
        }
        Ok(())
    }

    fn clear(&self) -> BackendResult<()> {
        self.objects.lock().clear();
        self.keys.lock().clear();
        Ok(())
    }
}
