//! Error types shared by certwarden crates
//!
//! Variants carry the resource they concern so that log lines and events
//! can point at the offending object without extra bookkeeping.

use thiserror::Error;

use crate::store::StoreError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for certwarden operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Declarative store error
    #[error("store error: {source}")]
    Store {
        /// The underlying store error
        #[from]
        source: StoreError,
    },

    /// Validation error for a resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Key (namespace/name) of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.keySize")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "queue", "registry")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation can succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Store { source } => source.is_retryable(),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation_for_field("default/web", "spec.keySize", "too small");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("default/web"));
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn store_conflicts_are_retryable() {
        let err = Error::from(StoreError::conflict("default/web"));
        assert!(err.is_retryable());
    }

    #[test]
    fn store_already_exists_is_not_retryable() {
        let err = Error::from(StoreError::already_exists("default/web"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_carries_context() {
        let err = Error::internal_with_context("queue", "worker vanished");
        assert_eq!(err.to_string(), "internal error [queue]: worker vanished");
        assert!(!err.is_retryable());

        let err = Error::internal("boom");
        assert!(err.to_string().contains(UNKNOWN_CONTEXT));
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err = Error::from(parse.unwrap_err());
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
