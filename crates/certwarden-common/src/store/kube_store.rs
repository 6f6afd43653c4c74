//! [`ResourceStore`] backed by the Kubernetes API and a reflector cache

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ObjectKey, ResourceStore, StoreError, WatchEvent, WATCH_CHANNEL_CAPACITY};
use crate::FIELD_MANAGER;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

type ApiFor<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// Store serving reads from a reflector and writing through `kube::Api`
pub struct KubeStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    client: Client,
    api_for: ApiFor<K>,
    reader: Store<K>,
    writer: Mutex<Option<reflector::store::Writer<K>>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn with_api(client: Client, api_for: ApiFor<K>) -> Self {
        let (reader, writer) = reflector::store();
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            client,
            api_for,
            reader,
            writer: Mutex::new(Some(writer)),
            events,
        }
    }

    /// Store for a namespaced kind, watching all namespaces
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        let api_client = client.clone();
        let api_for: ApiFor<K> = Arc::new(move |ns| match ns {
            Some(ns) => Api::namespaced(api_client.clone(), ns),
            None => Api::all(api_client.clone()),
        });
        Self::with_api(client, api_for)
    }

    /// Store for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self
    where
        K: Resource<Scope = ClusterResourceScope>,
    {
        let api_client = client.clone();
        let api_for: ApiFor<K> = Arc::new(move |_| Api::all(api_client.clone()));
        Self::with_api(client, api_for)
    }

    /// Wait until the initial list has populated the cache
    pub async fn wait_until_ready(&self) -> Result<(), StoreError> {
        self.reader
            .wait_until_ready()
            .await
            .map_err(|e| StoreError::transport(e.to_string()))
    }

    /// Feed the cache and broadcast watch events until `shutdown` fires
    ///
    /// Only the first call drives the watch; later calls return immediately.
    pub async fn run_watch(&self, shutdown: CancellationToken) {
        let Some(writer) = self.writer.lock().take() else {
            warn!(kind = %K::kind(&()), "watch already running");
            return;
        };

        let api: Api<K> = Api::all(self.client.clone());
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let events = self.events.clone();
        let stream = reflector::reflector(writer, watcher::watcher(api, config))
            .default_backoff();
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Event::Apply(obj))) | Some(Ok(Event::InitApply(obj))) => {
                    let _ = events.send(WatchEvent::Applied(obj));
                }
                Some(Ok(Event::Delete(obj))) => {
                    let _ = events.send(WatchEvent::Deleted(obj));
                }
                Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
                Some(Err(e)) => {
                    warn!(kind = %K::kind(&()), error = %e, "watch stream error");
                }
                None => break,
            }
        }
        debug!(kind = %K::kind(&()), "watch stopped");
    }

    fn key_of(obj: &K) -> Result<ObjectKey, StoreError> {
        ObjectKey::of(obj).ok_or_else(|| StoreError::invalid("object has no name"))
    }
}

/// Map a kube error onto the store taxonomy
fn map_kube_error(err: kube::Error, key: &ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::not_found(key),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::already_exists(key)
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::conflict(key),
        kube::Error::Api(resp) if resp.code == 422 || resp.code == 400 => {
            StoreError::invalid(resp.message)
        }
        other => StoreError::transport(other.to_string()),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<K> {
        let mut obj_ref = ObjectRef::<K>::new(&key.name);
        if let Some(ns) = key.namespace() {
            obj_ref = obj_ref.within(ns);
        }
        self.reader.get(&obj_ref).map(|obj| (*obj).clone())
    }

    fn list(&self, namespace: Option<&str>) -> Vec<K> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| namespace.is_none() || obj.meta().namespace.as_deref() == namespace)
            .map(|obj| (*obj).clone())
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        (self.api_for)(key.namespace())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(e, &key))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        (self.api_for)(key.namespace())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(e, &key))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let value = serde_json::to_value(obj)?;
        // Carrying resourceVersion turns the merge patch into a compare-and-swap.
        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status"),
        });
        (self.api_for)(key.namespace())
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, &key))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        (self.api_for)(key.namespace())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, key))
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} happened", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn kube_errors_map_to_store_errors() {
        let key = ObjectKey::namespaced("default", "web");
        assert!(map_kube_error(api_error(404, "NotFound"), &key).is_not_found());
        assert!(map_kube_error(api_error(409, "AlreadyExists"), &key).is_already_exists());
        assert_eq!(
            map_kube_error(api_error(409, "Conflict"), &key),
            StoreError::conflict(&key)
        );
        assert!(matches!(
            map_kube_error(api_error(422, "Invalid"), &key),
            StoreError::Invalid { .. }
        ));
        assert!(matches!(
            map_kube_error(api_error(500, "InternalError"), &key),
            StoreError::Transport { .. }
        ));
    }
}
