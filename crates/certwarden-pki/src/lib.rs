//! PKI primitives for certwarden
//!
//! Key generation and encoding, public key comparison, CSR construction and
//! certificate signing. Everything here is synchronous and side-effect free
//! apart from drawing randomness.

#![deny(missing_docs)]

mod csr;
mod error;
mod info;
mod key;
mod signer;

pub use csr::{build_csr, certificate_params_from_csr, DEFAULT_CERTIFICATE_DURATION};
pub use error::{PkiError, Result};
pub use info::{parse_pem, CertificateInfo, CsrInfo};
pub use key::{
    encode_private_key, generate_key, generate_private_key_for_certificate,
    parse_private_key_pem, public_key_matches_certificate, public_key_matches_csr, EcCurve,
    PrivateKey, PublicKey, DEFAULT_ECDSA_KEY_SIZE, DEFAULT_RSA_KEY_SIZE, MAX_RSA_KEY_SIZE,
    MIN_RSA_KEY_SIZE,
};
pub use signer::{self_sign_csr, sign_csr_with_ca, SignedCertificate};
