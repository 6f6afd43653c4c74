//! Declarative store access
//!
//! Controllers read exclusively from a watch-fed cache and write through to
//! the API server. Cached objects are handed out as owned clones, so a
//! worker may mutate what it read without affecting other readers. Writes
//! are not reflected in the cache until the corresponding watch event
//! arrives; reconcilers must tolerate reading slightly stale state.

mod kube_store;
mod memory;

use std::fmt;

use async_trait::async_trait;
use kube::Resource;
use thiserror::Error;
use tokio::sync::broadcast;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Capacity of the per-store watch event channel
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Identity of a stored object (namespace + name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, None for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object, None if it has no name
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }

    /// Namespace as a borrowed str
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::namespaced(ns, name))
            }
            None if !s.is_empty() => Ok(Self::cluster(s)),
            _ => Err(StoreError::invalid(format!("malformed object key '{}'", s))),
        }
    }
}

/// A change observed by the watch path
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// Object was created or updated
    Applied(K),
    /// Object was deleted
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The object carried by the event
    pub fn object(&self) -> &K {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Errors returned by store writes
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist
    #[error("{key} not found")]
    NotFound {
        /// Key of the missing object
        key: String,
    },

    /// Optimistic concurrency failure; re-read and retry
    #[error("conflict writing {key}: object has been modified")]
    Conflict {
        /// Key of the contended object
        key: String,
    },

    /// Create of an object that already exists
    #[error("{key} already exists")]
    AlreadyExists {
        /// Key of the existing object
        key: String,
    },

    /// Object could not be encoded or is malformed
    #[error("invalid object: {message}")]
    Invalid {
        /// What is wrong with it
        message: String,
    },

    /// Network or API server failure
    #[error("transport error: {message}")]
    Transport {
        /// Underlying error text
        message: String,
    },
}

impl StoreError {
    /// Object not found
    pub fn not_found(key: impl fmt::Display) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    /// Optimistic concurrency conflict
    pub fn conflict(key: impl fmt::Display) -> Self {
        Self::Conflict {
            key: key.to_string(),
        }
    }

    /// Object already exists
    pub fn already_exists(key: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            key: key.to_string(),
        }
    }

    /// Malformed object
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid {
            message: msg.into(),
        }
    }

    /// Transport failure
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Whether retrying can succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Transport { .. })
    }

    /// Whether this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is an AlreadyExists error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid(e.to_string())
    }
}

/// Read/write access to one resource kind
///
/// `get` and `list` never touch the network. Every write goes to the
/// backing API and is observed by readers only after the watch delivers it.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Cached object by key
    fn get(&self, key: &ObjectKey) -> Option<K>;

    /// Cached objects, optionally restricted to one namespace
    fn list(&self, namespace: Option<&str>) -> Vec<K>;

    /// Create a new object
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace an object's metadata and spec; fails with Conflict on a stale resourceVersion
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace an object's status; fails with Conflict on a stale resourceVersion
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Delete an object
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Stream of watch events
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<K>>;
}
