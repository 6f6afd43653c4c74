//! Read-only views of certificates and CSRs

use chrono::{DateTime, Utc};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};
use crate::key::PublicKey;

/// Decode the first PEM block of `pem_data` to DER
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(block.contents().to_vec())
}

/// The parts of a certificate the controllers look at
#[derive(Clone, Debug)]
pub struct CertificateInfo {
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Subject common name, if any
    pub common_name: Option<String>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names, as text
    pub ip_addresses: Vec<String>,
    /// Basic constraints CA flag
    pub is_ca: bool,
    /// Certified public key
    pub public_key: PublicKey,
}

impl CertificateInfo {
    /// Parse the leaf (first block) of a PEM chain
    pub fn from_pem(cert_pem: &str) -> Result<Self> {
        let der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;
        let common_name = common_name(cert.subject());

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            collect_names(&san.value.general_names, &mut dns_names, &mut ip_addresses);
        }

        Ok(Self {
            not_before,
            not_after,
            common_name,
            dns_names,
            ip_addresses,
            is_ca: cert.is_ca(),
            public_key: PublicKey::from_spki(cert.public_key())?,
        })
    }

    /// Total validity period
    pub fn lifetime(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    /// Whether the certificate covers every name in `names`
    pub fn covers(&self, common_name: Option<&str>, dns_names: &[String]) -> bool {
        let cn_ok = match common_name.filter(|cn| !cn.is_empty()) {
            Some(cn) => self.common_name.as_deref() == Some(cn) || self.dns_names.iter().any(|n| n == cn),
            None => true,
        };
        cn_ok && dns_names.iter().all(|n| self.dns_names.contains(n))
    }
}

/// The parts of a CSR the issuers look at
#[derive(Clone, Debug)]
pub struct CsrInfo {
    /// Subject common name, if any
    pub common_name: Option<String>,
    /// Requested DNS names
    pub dns_names: Vec<String>,
    /// Requested IP addresses, as text
    pub ip_addresses: Vec<String>,
    /// Requested public key
    pub public_key: PublicKey,
}

impl CsrInfo {
    /// Parse a PEM CSR
    pub fn from_pem(csr_pem: &str) -> Result<Self> {
        let der = parse_pem(csr_pem)?;
        let (_, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;
        let info = &csr.certification_request_info;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    collect_names(&san.general_names, &mut dns_names, &mut ip_addresses);
                }
            }
        }

        Ok(Self {
            common_name: common_name(&info.subject),
            dns_names,
            ip_addresses,
            public_key: PublicKey::from_spki(&info.subject_pki)?,
        })
    }

    /// Common name followed by DNS names, without duplicates
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(cn) = self.common_name.as_ref().filter(|cn| !cn.is_empty()) {
            if cn.parse::<std::net::IpAddr>().is_err() {
                names.push(cn.clone());
            }
        }
        for name in &self.dns_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::ParseError(format!("timestamp {} out of range", secs)))
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn collect_names(names: &[GeneralName<'_>], dns: &mut Vec<String>, ips: &mut Vec<String>) {
    for name in names {
        match name {
            GeneralName::DNSName(n) => dns.push(n.to_string()),
            GeneralName::IPAddress(bytes) => {
                if let Some(ip) = ip_from_bytes(bytes) {
                    ips.push(ip.to_string());
                }
            }
            _ => {}
        }
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        _ => None,
    }
}
