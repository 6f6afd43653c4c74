//! Named controller factories
//!
//! Controllers are registered by name at startup. The operator builds either
//! all of them or the subset enabled on the command line, then runs them
//! until shutdown.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::ControllerContext;
use crate::runtime::Controller;

/// Builds a controller from the shared context
pub type ControllerFactory =
    Box<dyn Fn(&ControllerContext) -> Result<Controller, RegistryError> + Send + Sync>;

/// Registry failures
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A controller with this name was already registered
    #[error("controller {0} is already registered")]
    Duplicate(String),

    /// An enabled controller name is not registered
    #[error("unknown controller {0}")]
    Unknown(String),

    /// A factory could not build its controller
    #[error("failed to build controller {name}: {message}")]
    Build {
        /// Controller name
        name: String,
        /// What went wrong
        message: String,
    },
}

/// Ordered set of named controller factories
#[derive(Default)]
pub struct ControllerRegistry {
    factories: Vec<(String, ControllerFactory)>,
}

impl ControllerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`; names must be unique
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&ControllerContext) -> Result<Controller, RegistryError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.iter().any(|(n, _)| *n == name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.factories.push((name, Box::new(factory)));
        Ok(())
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Build the controllers named in `enabled`, or all of them when `None`
    pub fn build(
        &self,
        ctx: &ControllerContext,
        enabled: Option<&[String]>,
    ) -> Result<Vec<Controller>, RegistryError> {
        if let Some(enabled) = enabled {
            if let Some(unknown) = enabled.iter().find(|e| !self.names().contains(&e.as_str())) {
                return Err(RegistryError::Unknown(unknown.clone()));
            }
        }
        self.factories
            .iter()
            .filter(|(name, _)| enabled.is_none_or(|e| e.contains(name)))
            .map(|(_, factory)| factory(ctx))
            .collect()
    }

    /// Build the enabled controllers and run them until `shutdown` fires
    pub async fn run(
        &self,
        ctx: &ControllerContext,
        enabled: Option<&[String]>,
        shutdown: CancellationToken,
    ) -> Result<(), RegistryError> {
        let controllers = self.build(ctx, enabled)?;
        info!(count = controllers.len(), "Starting controllers");

        let handles: Vec<_> = controllers
            .into_iter()
            .map(|controller| {
                let name = controller.name().to_string();
                (name, tokio::spawn(controller.run(shutdown.clone())))
            })
            .collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(controller = %name, error = %e, "Controller task failed");
            }
        }
        info!("All controllers stopped");
        Ok(())
    }
}
