//! Controllers for certwarden
//!
//! A [`Controller`] pairs one [`Reconciler`] with a rate-limited
//! [`WorkQueue`] fed by store watches. The certwarden controllers live in
//! [`controllers`] and are registered by name in a [`ControllerRegistry`].

#![deny(missing_docs)]

pub mod context;
pub mod controllers;
pub mod error;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod scheduler;

pub use context::{ControllerContext, DEFAULT_WORKERS};
pub use controllers::default_registry;
pub use error::ReconcileError;
pub use queue::WorkQueue;
pub use registry::{ControllerRegistry, RegistryError};
pub use runtime::{Action, Controller, EventSource, Reconciler, StoreWatch};
pub use scheduler::{effective_renew_before, time_until_renew, RenewBefore};
