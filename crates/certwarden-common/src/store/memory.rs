//! In-process store with API-server write semantics
//!
//! Behaves like the API server for the properties reconcilers depend on:
//! resourceVersion checks on update, status being writable only through
//! `update_status`, and a watch event for every successful write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use super::{ObjectKey, ResourceStore, StoreError, WatchEvent, WATCH_CHANNEL_CAPACITY};

/// In-memory [`ResourceStore`]
pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<ObjectKey, K>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> Default for MemoryStore<K>
where
    K: Clone,
{
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `objects`, bypassing version checks
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::default();
        for mut obj in objects {
            let Some(key) = ObjectKey::of(&obj) else {
                continue;
            };
            obj.meta_mut().resource_version = Some(store.next_version());
            store.objects.write().insert(key, obj);
        }
        store
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key_of(obj: &K) -> Result<ObjectKey, StoreError> {
        ObjectKey::of(obj).ok_or_else(|| StoreError::invalid("object has no name"))
    }

    fn notify(&self, event: WatchEvent<K>) {
        // No receivers is fine; nothing is watching yet.
        let _ = self.events.send(event);
    }

    /// Replace the `status` of `target` with the one from `source`
    fn copy_status(target: &K, source: &K) -> Result<K, StoreError> {
        let mut target_value = serde_json::to_value(target)?;
        let source_value = serde_json::to_value(source)?;
        if let Some(obj) = target_value.as_object_mut() {
            match source_value.get("status") {
                Some(status) => obj.insert("status".to_string(), status.clone()),
                None => obj.remove("status"),
            };
        }
        Ok(serde_json::from_value(target_value)?)
    }

    fn check_version(current: &K, incoming: &K, key: &ObjectKey) -> Result<(), StoreError> {
        match incoming.meta().resource_version.as_deref() {
            Some(rv) if Some(rv) != current.meta().resource_version.as_deref() => {
                Err(StoreError::conflict(key))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<K> {
        self.objects.read().get(key).cloned()
    }

    fn list(&self, namespace: Option<&str>) -> Vec<K> {
        self.objects
            .read()
            .iter()
            .filter(|(key, _)| namespace.is_none() || key.namespace() == namespace)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let mut created = obj.clone();
        {
            let mut objects = self.objects.write();
            if objects.contains_key(&key) {
                return Err(StoreError::already_exists(&key));
            }
            let meta = created.meta_mut();
            meta.resource_version = Some(self.next_version());
            meta.uid = Some(format!("uid-{}", key));
            meta.creation_timestamp = Some(Time(Utc::now()));
            objects.insert(key, created.clone());
        }
        self.notify(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let updated = {
            let mut objects = self.objects.write();
            let current = objects.get(&key).ok_or_else(|| StoreError::not_found(&key))?;
            Self::check_version(current, obj, &key)?;
            let mut updated = Self::copy_status(obj, current)?;
            updated.meta_mut().resource_version = Some(self.next_version());
            objects.insert(key, updated.clone());
            updated
        };
        self.notify(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let updated = {
            let mut objects = self.objects.write();
            let current = objects.get(&key).ok_or_else(|| StoreError::not_found(&key))?;
            Self::check_version(current, obj, &key)?;
            let mut updated = Self::copy_status(current, obj)?;
            updated.meta_mut().resource_version = Some(self.next_version());
            objects.insert(key, updated.clone());
            updated
        };
        self.notify(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let removed = self
            .objects
            .write()
            .remove(key)
            .ok_or_else(|| StoreError::not_found(key))?;
        self.notify(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }
}
