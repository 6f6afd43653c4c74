//! Reconcile errors and how the runtime treats them

use certwarden_common::store::StoreError;
use certwarden_issuer::IssuerError;
use certwarden_pki::PkiError;
use thiserror::Error;

/// Why a reconcile pass did not complete
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The resource spec is malformed; dropped until the resource changes
    #[error("validation failed: {message}")]
    Validation {
        /// What is wrong
        message: String,
    },

    /// A backend refused for good; dropped until the resource changes
    #[error("terminal failure: {message}")]
    Terminal {
        /// What was refused
        message: String,
    },

    /// Network, timeout or conflict; requeued with backoff
    #[error("{message}")]
    Transient {
        /// What failed
        message: String,
    },

    /// Inconsistent internal state; logged and dropped
    #[error("internal error: {message}")]
    Internal {
        /// What was inconsistent
        message: String,
    },
}

impl ReconcileError {
    /// Malformed resource
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Permanent backend refusal
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal {
            message: msg.into(),
        }
    }

    /// Retryable failure
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    /// Broken invariant
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// Whether the key should be requeued with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid { message } => Self::internal(message),
            // NotFound and AlreadyExists on a write mean the cache was stale;
            // retrying after the next watch event converges.
            other => Self::transient(other.to_string()),
        }
    }
}

impl From<IssuerError> for ReconcileError {
    fn from(e: IssuerError) -> Self {
        match e {
            IssuerError::Validation { message } => Self::validation(message),
            other => Self::transient(other.to_string()),
        }
    }
}

impl From<PkiError> for ReconcileError {
    fn from(e: PkiError) -> Self {
        if e.is_key_spec_error() {
            Self::validation(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

impl From<certwarden_common::Error> for ReconcileError {
    fn from(e: certwarden_common::Error) -> Self {
        match e {
            certwarden_common::Error::Validation { .. } => Self::validation(e.to_string()),
            other if other.is_retryable() => Self::transient(other.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}
