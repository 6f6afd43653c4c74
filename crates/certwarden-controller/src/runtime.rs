//! Reconciler runtime
//!
//! A [`Controller`] pairs one [`Reconciler`] with its own [`WorkQueue`],
//! the watches that feed it, and a fixed pool of workers. Workers share
//! nothing but the queue, so a slow pass only ever blocks its own worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::metrics::{self, ErrorType};
use certwarden_common::store::{ObjectKey, ResourceStore, WatchEvent};
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::ReconcileError;
use crate::queue::WorkQueue;

/// Longest a single reconcile pass may run before it counts as a transient failure
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(120);

/// What to do with a key after a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Requested delay before the next pass, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// One step of forward progress for one resource key
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Controller name, used in logs and metrics
    fn name(&self) -> &str;

    /// Reconcile the resource at `key`
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

/// Turns watch events into queue keys
pub trait EventSource: Send + Sync {
    /// Feed `queue` until `shutdown` fires
    fn start(&self, queue: Arc<WorkQueue<ObjectKey>>, shutdown: CancellationToken)
        -> JoinHandle<()>;
}

type Mapper<K> = Arc<dyn Fn(&K) -> Vec<ObjectKey> + Send + Sync>;

/// Watch of a store, mapping each changed object to the keys it affects
pub struct StoreWatch<K>
where
    K: Clone + Send + Sync + 'static,
{
    store: Arc<dyn ResourceStore<K>>,
    mapper: Mapper<K>,
}

impl<K> StoreWatch<K>
where
    K: Clone + Send + Sync + 'static,
{
    /// Watch `store`, enqueueing whatever `mapper` returns for each event
    pub fn new(
        store: Arc<dyn ResourceStore<K>>,
        mapper: impl Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            mapper: Arc::new(mapper),
        }
    }

    /// Watch of the primary resource: each object maps to its own key
    pub fn primary(store: Arc<dyn ResourceStore<K>>) -> Self
    where
        K: kube::Resource,
    {
        Self::new(store, |obj: &K| ObjectKey::of(obj).into_iter().collect())
    }

    fn resync(store: &dyn ResourceStore<K>, mapper: &Mapper<K>, queue: &WorkQueue<ObjectKey>) {
        for obj in store.list(None) {
            for key in mapper(&obj) {
                queue.add(key);
            }
        }
    }
}

impl<K> EventSource for StoreWatch<K>
where
    K: Clone + Send + Sync + 'static,
{
    fn start(
        &self,
        queue: Arc<WorkQueue<ObjectKey>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let mapper = self.mapper.clone();
        // Subscribe before listing so nothing written in between is missed.
        let mut events = store.subscribe();
        Self::resync(store.as_ref(), &mapper, &queue);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(WatchEvent::Applied(obj) | WatchEvent::Deleted(obj)) => {
                        for key in mapper(&obj) {
                            queue.add(key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch consumer lagged, resyncing from cache");
                        Self::resync(store.as_ref(), &mapper, &queue);
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }
}

/// A reconciler with its queue, watches and workers
pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    sources: Vec<Box<dyn EventSource>>,
    workers: usize,
}

impl Controller {
    /// Controller running `reconciler` on `workers` workers
    pub fn new(reconciler: Arc<dyn Reconciler>, workers: usize) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::default()),
            sources: Vec::new(),
            workers: workers.max(1),
        }
    }

    /// Add a watch feeding the queue
    pub fn watches(mut self, source: impl EventSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Controller name
    pub fn name(&self) -> &str {
        self.reconciler.name()
    }

    /// The controller's queue
    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Run until `shutdown` fires; in-progress passes are abandoned
    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.reconciler.name().to_string();
        info!(controller = %name, workers = self.workers, "Starting controller");

        let watches: Vec<JoinHandle<()>> = self
            .sources
            .iter()
            .map(|source| source.start(self.queue.clone(), shutdown.clone()))
            .collect();

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|_| {
                let queue = self.queue.clone();
                let reconciler = self.reconciler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker(reconciler, queue, shutdown).await })
            })
            .collect();

        shutdown.cancelled().await;
        self.queue.shutdown();
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(controller = %name, error = %e, "Worker task failed");
            }
        }
        for watch in watches {
            watch.abort();
        }
        info!(controller = %name, "Controller stopped");
    }
}

async fn worker(
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    shutdown: CancellationToken,
) {
    while let Some(key) = queue.get().await {
        process(reconciler.as_ref(), &queue, &key, &shutdown).await;
        queue.done(&key);
    }
}

/// Run one pass for `key` and requeue it according to the outcome
///
/// The pass is bounded by [`RECONCILE_TIMEOUT`] and abandoned as soon as
/// `shutdown` fires.
pub async fn process(
    reconciler: &dyn Reconciler,
    queue: &WorkQueue<ObjectKey>,
    key: &ObjectKey,
    shutdown: &CancellationToken,
) {
    let name = reconciler.name();
    let span = info_span!("reconcile", controller = %name, key = %key);
    metrics::record_sync_call(name);

    let pass = tokio::time::timeout(RECONCILE_TIMEOUT, reconciler.reconcile(key)).instrument(span.clone());
    let result = tokio::select! {
        _ = shutdown.cancelled() => {
            let _entered = span.enter();
            info!("Shutting down, abandoning reconcile pass");
            return;
        }
        outcome = pass => match outcome {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::transient(format!(
                "reconcile timed out after {:?}",
                RECONCILE_TIMEOUT
            ))),
        },
    };

    let _entered = span.enter();
    match result {
        Ok(action) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                debug!(requeue_after = ?delay, "Reconciled, requeueing");
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) if e.is_retryable() => {
            metrics::record_reconcile_error(name, ErrorType::Transient);
            let attempt = queue.num_requeues(key) + 1;
            warn!(error = %e, attempt, "Reconcile failed, retrying with backoff");
            queue.add_rate_limited(key.clone());
        }
        Err(e @ ReconcileError::Internal { .. }) => {
            metrics::record_reconcile_error(name, ErrorType::Permanent);
            error!(error = %e, "Reconcile hit an inconsistent state, dropping key");
            queue.forget(key);
        }
        Err(e) => {
            metrics::record_reconcile_error(name, ErrorType::Permanent);
            warn!(error = %e, "Reconcile failed permanently, waiting for a change");
            queue.forget(key);
        }
    }
}
