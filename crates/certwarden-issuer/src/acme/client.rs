//! ACME client abstraction
//!
//! Every method performs one protocol step and returns. Nothing here waits
//! for the server to change state; callers persist what they learn and come
//! back on a later reconcile pass.

use async_trait::async_trait;
use certwarden_common::crd::ChallengeType;

#[cfg(test)]
use mockall::automock;

use super::error::AcmeError;

/// Status of a remote order (RFC 8555 §7.1.6)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOrderStatus {
    /// Authorizations outstanding
    Pending,
    /// All authorizations valid; may be finalized
    Ready,
    /// Finalized; certificate being issued
    Processing,
    /// Certificate available
    Valid,
    /// Order failed
    Invalid,
}

/// Status of a remote challenge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteChallengeStatus {
    /// Not yet validated
    Pending,
    /// Validation in progress
    Processing,
    /// Validation succeeded
    Valid,
    /// Validation failed
    Invalid,
}

/// A challenge offered by the server
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteChallenge {
    /// Challenge URL
    pub url: String,
    /// Token
    pub token: String,
    /// Type
    pub type_: ChallengeType,
    /// Key authorization for this account
    pub key_authorization: String,
}

/// An authorization for one identifier
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteAuthorization {
    /// Authorization URL
    pub url: String,
    /// DNS name without any wildcard prefix
    pub identifier: String,
    /// Whether `*.identifier` was ordered
    pub wildcard: bool,
    /// Whether the server already considers it valid
    pub valid: bool,
    /// Supported challenges (HTTP-01 and DNS-01 only)
    pub challenges: Vec<RemoteChallenge>,
}

/// Snapshot of a remote order
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteOrder {
    /// Order URL
    pub url: String,
    /// Finalize URL
    pub finalize_url: String,
    /// Status
    pub status: RemoteOrderStatus,
    /// Authorizations in server order
    pub authorizations: Vec<RemoteAuthorization>,
    /// Problem detail if the order is invalid
    pub error: Option<String>,
}

/// One registered ACME account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Account URL
    fn account_url(&self) -> String;

    /// Create a new order for `dns_names`
    async fn create_order(&self, dns_names: &[String]) -> Result<RemoteOrder, AcmeError>;

    /// Fetch the current state of an order
    async fn get_order(&self, order_url: &str) -> Result<RemoteOrder, AcmeError>;

    /// Tell the server a challenge is ready to be validated
    async fn accept_challenge(&self, order_url: &str, challenge_url: &str)
        -> Result<(), AcmeError>;

    /// Current status of a challenge
    async fn challenge_status(
        &self,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(RemoteChallengeStatus, Option<String>), AcmeError>;

    /// Submit the DER CSR for a ready order
    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<RemoteOrder, AcmeError>;

    /// Download the certificate chain of a valid order
    async fn certificate(&self, order_url: &str) -> Result<Option<String>, AcmeError>;
}
