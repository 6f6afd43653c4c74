//! Issuer errors
//!
//! `sign` signals a permanent failure with `Ok(None)`, so every variant here
//! except `Validation` is something the caller retries.

use certwarden_common::store::StoreError;
use certwarden_pki::PkiError;
use thiserror::Error;

use crate::acme::AcmeError;

/// Errors returned by issuer backends
#[derive(Debug, Error)]
pub enum IssuerError {
    /// Network, timeout or store failure; retry with backoff
    #[error("{message}")]
    Transient {
        /// What failed
        message: String,
    },

    /// Waiting on another resource; its watch event re-triggers the request
    #[error("pending: {message}")]
    Pending {
        /// What is being waited for
        message: String,
    },

    /// Issuer configuration is unusable until the user changes it
    #[error("invalid issuer configuration: {message}")]
    Validation {
        /// What is wrong
        message: String,
    },
}

impl IssuerError {
    /// Transient failure
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    /// Waiting on another resource
    pub fn pending(msg: impl Into<String>) -> Self {
        Self::Pending {
            message: msg.into(),
        }
    }

    /// Unusable configuration
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Whether the request should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether this is a wait for another resource
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

impl From<StoreError> for IssuerError {
    fn from(e: StoreError) -> Self {
        if e.is_retryable() || e.is_not_found() {
            Self::transient(e.to_string())
        } else {
            Self::validation(e.to_string())
        }
    }
}

impl From<PkiError> for IssuerError {
    fn from(e: PkiError) -> Self {
        Self::validation(e.to_string())
    }
}

impl From<AcmeError> for IssuerError {
    fn from(e: AcmeError) -> Self {
        if e.is_rejection() {
            Self::validation(e.to_string())
        } else {
            Self::transient(e.to_string())
        }
    }
}

impl From<reqwest::Error> for IssuerError {
    fn from(e: reqwest::Error) -> Self {
        Self::transient(format!("http request failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_retried() {
        let err: IssuerError = StoreError::not_found("certwarden/ca-key").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn bad_key_material_is_not_retried() {
        let err: IssuerError = PkiError::ParseError("garbage".to_string()).into();
        assert!(!err.is_retryable());
        assert!(matches!(err, IssuerError::Validation { .. }));
    }

    #[test]
    fn pending_is_distinct_from_transient() {
        let err = IssuerError::pending("order default/web-1-123 in progress");
        assert!(err.is_pending());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "pending: order default/web-1-123 in progress");
    }
}
