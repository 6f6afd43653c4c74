//! PKI errors

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// RSA key below the minimum size
    #[error("weak rsa key size specified: {size}. minimum key size: {min}")]
    WeakKeySize {
        /// Requested size
        size: u32,
        /// Minimum accepted size
        min: u32,
    },

    /// RSA key above the maximum size
    #[error("rsa key size specified too big: {size}. maximum key size: {max}")]
    KeyTooLarge {
        /// Requested size
        size: u32,
        /// Maximum accepted size
        max: u32,
    },

    /// ECDSA size other than 256, 384 or 521
    #[error("unsupported ecdsa key size specified: {0}")]
    UnsupportedEcdsaSize(u32),

    /// Key type this crate does not handle
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Key could not be encoded
    #[error("key encoding failed: {0}")]
    Encoding(String),

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Private key does not belong to the CSR or certificate
    #[error("private key does not match the public key in the {0}")]
    KeyMismatch(&'static str),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    ParseError(String),
}

impl PkiError {
    /// Whether the error comes from a bad key algorithm or size request
    pub fn is_key_spec_error(&self) -> bool {
        matches!(
            self,
            Self::WeakKeySize { .. } | Self::KeyTooLarge { .. } | Self::UnsupportedEcdsaSize(_)
        )
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
