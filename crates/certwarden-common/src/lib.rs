//! Common types for certwarden: CRDs, errors, store access and observability

#![deny(missing_docs)]

pub mod crd;
pub mod duration;
pub mod error;
pub mod events;
pub mod metrics;
pub mod store;
pub mod telemetry;

pub use duration::Duration;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every certwarden resource
pub const API_GROUP: &str = "certwarden.io";

/// Default namespace holding secrets referenced by ClusterIssuers
pub const DEFAULT_CLUSTER_RESOURCE_NAMESPACE: &str = "certwarden";

/// Label placed on CertificateRequests naming the Certificate that owns them
pub const CERTIFICATE_NAME_LABEL: &str = "certwarden.io/certificate-name";

/// Annotation on a CertificateRequest naming the Secret that holds its private key
pub const PRIVATE_KEY_SECRET_ANNOTATION: &str = "certwarden.io/private-key-secret-name";

/// Annotation on a CertificateRequest recording the Certificate revision it serves
pub const CERTIFICATE_REVISION_ANNOTATION: &str = "certwarden.io/certificate-revision";

/// Field manager used for all writes made by the controller
pub const FIELD_MANAGER: &str = "certwarden-controller";

/// Secret data key holding the signed certificate chain
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Secret data key holding the private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Secret data key holding the issuing CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";
