//! Local certificate signing for the CA and SelfSigned issuers

use certwarden_common::Duration;
use rcgen::Issuer;
use tracing::debug;

use crate::csr::{certificate_params_from_csr, rcgen_key_pair};
use crate::error::{PkiError, Result};
use crate::key::{
    parse_private_key_pem, public_key_matches_certificate, public_key_matches_csr, PrivateKey,
};

/// A freshly signed certificate and the CA that vouches for it
#[derive(Clone, Debug)]
pub struct SignedCertificate {
    /// PEM leaf certificate
    pub certificate: String,
    /// PEM CA certificate (the leaf itself when self-signed)
    pub ca: String,
}

/// Sign `csr_pem` with a CA keypair
///
/// The CA key must belong to the CA certificate; a mismatch is reported as
/// [`PkiError::KeyMismatch`] rather than producing an unverifiable chain.
pub fn sign_csr_with_ca(
    csr_pem: &str,
    ca_cert_pem: &str,
    ca_key_pem: &str,
    duration: Duration,
    is_ca: bool,
) -> Result<SignedCertificate> {
    let ca_private = parse_private_key_pem(ca_key_pem)?;
    if !public_key_matches_certificate(&ca_private.public_key(), ca_cert_pem)? {
        return Err(PkiError::KeyMismatch("CA certificate"));
    }

    let csr_params = certificate_params_from_csr(csr_pem, duration, is_ca)?;
    let ca_key = rcgen_key_pair(&ca_private)?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let signed = csr_params.signed_by(&issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
    })?;
    debug!(duration = %duration, is_ca, "signed certificate with CA");

    Ok(SignedCertificate {
        certificate: signed.pem(),
        ca: first_certificate(ca_cert_pem),
    })
}

/// Sign `csr_pem` with the private key it was generated from
pub fn self_sign_csr(
    csr_pem: &str,
    key: &PrivateKey,
    duration: Duration,
    is_ca: bool,
) -> Result<SignedCertificate> {
    if !public_key_matches_csr(&key.public_key(), csr_pem)? {
        return Err(PkiError::KeyMismatch("CSR"));
    }

    let csr_params = certificate_params_from_csr(csr_pem, duration, is_ca)?;
    let key_pair = rcgen_key_pair(key)?;
    let cert = csr_params.params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to self-sign certificate: {}", e))
    })?;
    debug!(duration = %duration, is_ca, "self-signed certificate");

    let pem = cert.pem();
    Ok(SignedCertificate {
        certificate: pem.clone(),
        ca: pem,
    })
}

fn first_certificate(chain: &str) -> String {
    match ::pem::parse_many(chain.as_bytes()) {
        Ok(blocks) if !blocks.is_empty() => ::pem::encode(&blocks[0]),
        _ => chain.to_string(),
    }
}
