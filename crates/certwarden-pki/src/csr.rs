//! CSR construction and the certificate parameters derived from a CSR

use certwarden_common::crd::CertificateSpec;
use certwarden_common::Duration;
use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};

use crate::error::{PkiError, Result};
use crate::key::PrivateKey;

/// Lifetime used when neither the Certificate nor the request sets one (90 days)
pub const DEFAULT_CERTIFICATE_DURATION: Duration = Duration::from_hours(2160);

/// Build a PEM CSR for `spec`, signed by `key`
///
/// The subject carries the common name and organizations; DNS names and IP
/// addresses go into the subjectAltName extension.
pub fn build_csr(spec: &CertificateSpec, key: &PrivateKey) -> Result<String> {
    let key_pair = rcgen_key_pair(key)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    if let Some(cn) = spec.common_name.as_deref().filter(|cn| !cn.is_empty()) {
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    }
    for org in &spec.organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    params.distinguished_name = dn;

    let mut sans = Vec::with_capacity(spec.dns_names.len() + spec.ip_addresses.len());
    for name in &spec.dns_names {
        let ia5 = Ia5String::try_from(name.clone()).map_err(|e| {
            PkiError::InvalidCsr(format!("invalid DNS name '{}': {}", name, e))
        })?;
        sans.push(SanType::DnsName(ia5));
    }
    for ip in &spec.ip_addresses {
        let addr = ip
            .parse::<std::net::IpAddr>()
            .map_err(|e| PkiError::InvalidCsr(format!("invalid IP address '{}': {}", ip, e)))?;
        sans.push(SanType::IpAddress(addr));
    }
    params.subject_alt_names = sans;

    let csr = params.serialize_request(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
    })?;
    csr.pem().map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
    })
}

/// Parse `csr_pem` and fill in validity, serial and usages for signing
///
/// Subject and SANs are taken from the CSR unchanged.
pub fn certificate_params_from_csr(
    csr_pem: &str,
    duration: Duration,
    is_ca: bool,
) -> Result<CertificateSigningRequestParams> {
    let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

    let lifetime = ::time::Duration::try_from(duration.as_std()).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("invalid duration {}: {}", duration, e))
    })?;
    let now = ::time::OffsetDateTime::now_utc();
    let params = &mut csr_params.params;
    params.not_before = now;
    params.not_after = now + lifetime;
    params.serial_number = Some(random_serial());

    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.extended_key_usages = vec![];
    } else {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
    }

    Ok(csr_params)
}

pub(crate) fn rcgen_key_pair(key: &PrivateKey) -> Result<KeyPair> {
    let pem = key.to_pkcs8_pem()?;
    KeyPair::from_pem(&pem)
        .map_err(|e| PkiError::ParseError(format!("failed to load key pair: {}", e)))
}

// 16 random bytes with the top bit cleared so the DER integer stays positive.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}
