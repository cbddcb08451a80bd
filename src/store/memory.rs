use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;

use super::{kind_of, ObjectKey, ObjectStore};
use crate::error::{Error, Result};
use crate::labels;

/// In-memory object store with the same optimistic-concurrency contract as
/// the API server: every write assigns a fresh `resourceVersion` and a write
/// carrying a stale one fails with `ConcurrentModification`.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    revision: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `obj` unconditionally, as a foreign controller would.
    pub fn put(&self, obj: DynamicObject) -> DynamicObject {
        let key = ObjectKey::of(&obj);
        let mut objects = self.lock();
        let stored = self.stamp(obj, objects.get(&key));
        objects.insert(key, stored.clone());
        stored
    }

    /// Every stored object, ordered by identity.
    pub fn snapshot(&self) -> Vec<DynamicObject> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectKey, DynamicObject>> {
        // A panic while holding the lock leaves the map itself intact.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Assign server-managed metadata to an object about to be stored.
    fn stamp(&self, mut obj: DynamicObject, previous: Option<&DynamicObject>) -> DynamicObject {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(revision.to_string());
        obj.metadata.uid = previous
            .and_then(|p| p.metadata.uid.clone())
            .or_else(|| Some(format!("uid-{revision}")));
        obj.metadata.generation = Some(previous.and_then(|p| p.metadata.generation).unwrap_or(0) + 1);
        obj
    }

    fn check_version(current: &DynamicObject, obj: &DynamicObject, key: &ObjectKey) -> Result<()> {
        match &obj.metadata.resource_version {
            Some(expected) if current.metadata.resource_version.as_ref() != Some(expected) => {
                Err(Error::ConcurrentModification(key.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn list(
        &self,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .lock()
            .values()
            .filter(|o| kind_of(o) == kind)
            .filter(|o| o.metadata.namespace.as_deref() == Some(namespace))
            .filter(|o| labels::matches(o.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(Error::ConcurrentModification(key.to_string()));
        }
        let mut obj = obj.clone();
        obj.metadata.resource_version = None;
        let stored = self.stamp(obj, None);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::ResourceMissing(key.to_string()))?;
        Self::check_version(current, obj, &key)?;

        let mut merged = serde_json::to_value(current)?;
        let mut patch = serde_json::to_value(obj)?;
        if let Some(meta) = patch.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("resourceVersion");
        }
        json_patch::merge(&mut merged, &patch);
        let merged: DynamicObject = serde_json::from_value(merged)?;

        let stored = self.stamp(merged, Some(current));
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::ResourceMissing(key.to_string()))?;
        Self::check_version(current, obj, &key)?;
        let stored = self.stamp(obj.clone(), Some(current));
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::ResourceMissing(key.to_string()))
    }
}
