//! Issuer backends for certwarden
//!
//! Every Issuer or ClusterIssuer resolves to exactly one [`IssuerBackend`],
//! chosen once by [`IssuerFactory`] from the configured backend block.
//! Backends never block for a whole remote exchange: anything that needs
//! more time is reported as an error and picked up on a later pass.

#![deny(missing_docs)]

pub mod acme;
pub mod ca;
pub mod context;
pub mod error;
pub mod factory;
pub mod options;
pub mod secrets;
pub mod selfsigned;
pub mod vault;
pub mod venafi;

use async_trait::async_trait;
use certwarden_common::crd::{CertificateRequest, IssuerStatus};

#[cfg(test)]
use mockall::automock;

pub use context::IssuerContext;
pub use error::IssuerError;
pub use factory::{BackendFactory, IssuerFactory};
pub use options::{IssuerOptions, DEFAULT_RENEW_BEFORE};

/// A signed certificate returned by a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueResponse {
    /// PEM certificate chain, leaf first
    pub certificate: String,
    /// PEM CA certificate, when the backend knows it
    pub ca: Option<String>,
}

/// The capability every backend provides
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IssuerBackend: Send + Sync {
    /// Make sure the backend is usable; idempotent
    ///
    /// Backends may record what they learned (such as an ACME account URL)
    /// in `status`; the caller persists it.
    async fn setup(&self, status: &mut IssuerStatus) -> Result<(), IssuerError>;

    /// Sign a request
    ///
    /// `Ok(Some)` is a signed certificate. `Ok(None)` means the request can
    /// never succeed and must not be retried. `Err` is retried.
    async fn sign(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<IssueResponse>, IssuerError>;
}
