//! Certificate CRD: the desired state of a TLS keypair stored in a Secret
//!
//! Example:
//! ```yaml
//! apiVersion: certwarden.io/v1alpha1
//! kind: Certificate
//! metadata:
//!   name: web
//!   namespace: default
//! spec:
//!   secretName: web-tls
//!   dnsNames: [web.example.com]
//!   duration: 2160h
//!   renewBefore: 360h
//!   keyAlgorithm: ecdsa
//!   keySize: 256
//!   issuerRef:
//!     name: letsencrypt
//!     kind: ClusterIssuer
//! ```

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, IssuerRef};
use crate::{Duration, Error};

/// Shortest certificate lifetime that may be requested
pub const MIN_CERTIFICATE_DURATION: Duration = Duration::from_hours(1);

/// Shortest renew-before window that may be requested
pub const MIN_RENEW_BEFORE: Duration = Duration::from_secs(5 * 60);

/// Desired certificate
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certwarden.io",
    version = "v1alpha1",
    kind = "Certificate",
    derive = "PartialEq",
    namespaced,
    status = "CertificateStatus",
    shortname = "cert",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.secretName"}"#,
    printcolumn = r#"{"name":"Issuer","type":"string","jsonPath":".spec.issuerRef.name"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.notAfter"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Secret the signed keypair is written to
    pub secret_name: String,

    /// Subject common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    /// DNS subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    /// IP subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    /// Subject organizations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,

    /// Requested lifetime; the issuer may grant a different one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// How long before expiry to renew; defaults to the controller setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<Duration>,

    /// Private key algorithm
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    /// Private key size in bits (RSA) or curve size (ECDSA); 0 picks the default
    #[serde(default)]
    pub key_size: u32,

    /// PEM encoding of the private key
    #[serde(default)]
    pub key_encoding: KeyEncoding,

    /// Request a CA certificate
    #[serde(default)]
    pub is_ca: bool,

    /// Issuer that signs this certificate
    pub issuer_ref: IssuerRef,
}

/// Private key algorithm
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// RSA
    #[default]
    Rsa,
    /// ECDSA over a NIST curve
    Ecdsa,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa => write!(f, "rsa"),
            Self::Ecdsa => write!(f, "ecdsa"),
        }
    }
}

/// Private key PEM encoding
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    /// Algorithm specific block ("RSA PRIVATE KEY" / "EC PRIVATE KEY")
    #[default]
    Pkcs1,
    /// Generic "PRIVATE KEY" block
    Pkcs8,
}

impl std::fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pkcs1 => write!(f, "pkcs1"),
            Self::Pkcs8 => write!(f, "pkcs8"),
        }
    }
}

/// Observed certificate state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// Current conditions (Ready)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Expiry of the certificate currently stored in the Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,

    /// When the last issuance attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,

    /// Number of successful issuances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,

    /// Secret holding the private key for the in-flight issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_private_key_secret_name: Option<String>,
}

impl Certificate {
    /// Structural validation of the desired state
    ///
    /// Key algorithm and size are validated by the key generator, which
    /// owns the supported ranges.
    pub fn validate(&self) -> Result<(), Error> {
        let key = format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        );
        let spec = &self.spec;

        if spec.secret_name.is_empty() {
            return Err(Error::validation_for_field(
                &key,
                "spec.secretName",
                "secretName must be set",
            ));
        }
        if spec.issuer_ref.name.is_empty() {
            return Err(Error::validation_for_field(
                &key,
                "spec.issuerRef.name",
                "issuerRef.name must be set",
            ));
        }
        if spec.common_name.as_deref().unwrap_or_default().is_empty()
            && spec.dns_names.is_empty()
            && spec.ip_addresses.is_empty()
        {
            return Err(Error::validation_for(
                &key,
                "at least one of commonName, dnsNames or ipAddresses must be set",
            ));
        }
        for ip in &spec.ip_addresses {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.ipAddresses",
                    format!("invalid IP address '{}'", ip),
                ));
            }
        }
        if let Some(duration) = spec.duration {
            if duration < MIN_CERTIFICATE_DURATION {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.duration",
                    format!(
                        "certificate duration {} must be at least {}",
                        duration, MIN_CERTIFICATE_DURATION
                    ),
                ));
            }
        }
        if let Some(renew_before) = spec.renew_before {
            if renew_before < MIN_RENEW_BEFORE {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.renewBefore",
                    format!(
                        "renewBefore {} must be at least {}",
                        renew_before, MIN_RENEW_BEFORE
                    ),
                ));
            }
        }
        Ok(())
    }

    /// All names the certificate must cover: common name first, then DNS names
    pub fn dns_identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(cn) = self.spec.common_name.as_deref().filter(|cn| !cn.is_empty()) {
            if cn.parse::<std::net::IpAddr>().is_err() {
                names.push(cn.to_string());
            }
        }
        for name in &self.spec.dns_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Current revision, zero before the first issuance
    pub fn revision(&self) -> u32 {
        self.status.as_ref().and_then(|s| s.revision).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::IssuerKind;

    fn certificate(spec: CertificateSpec) -> Certificate {
        let mut cert = Certificate::new("web", spec);
        cert.metadata.namespace = Some("default".to_string());
        cert
    }

    fn spec() -> CertificateSpec {
        CertificateSpec {
            secret_name: "web-tls".to_string(),
            common_name: None,
            dns_names: vec!["web.example.com".to_string()],
            ip_addresses: vec![],
            organization: vec![],
            duration: None,
            renew_before: None,
            key_algorithm: KeyAlgorithm::Rsa,
            key_size: 2048,
            key_encoding: KeyEncoding::Pkcs1,
            is_ca: false,
            issuer_ref: IssuerRef {
                name: "ca".to_string(),
                kind: IssuerKind::Issuer,
            },
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(certificate(spec()).validate().is_ok());
    }

    #[test]
    fn missing_names_fail_validation() {
        let mut s = spec();
        s.dns_names.clear();
        let err = certificate(s).validate().unwrap_err();
        assert!(err.to_string().contains("commonName"));
    }

    #[test]
    fn short_duration_fails_validation() {
        let mut s = spec();
        s.duration = Some(Duration::from_secs(60));
        assert!(certificate(s).validate().is_err());

        let mut s = spec();
        s.renew_before = Some(Duration::from_secs(60));
        assert!(certificate(s).validate().is_err());
    }

    #[test]
    fn bad_ip_fails_validation() {
        let mut s = spec();
        s.ip_addresses = vec!["300.1.1.1".to_string()];
        assert!(certificate(s).validate().is_err());
    }

    #[test]
    fn dns_identifiers_dedupe_common_name() {
        let mut s = spec();
        s.common_name = Some("web.example.com".to_string());
        s.dns_names.push("api.example.com".to_string());
        assert_eq!(
            certificate(s).dns_identifiers(),
            vec!["web.example.com", "api.example.com"]
        );
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let yaml = r#"
secretName: web-tls
dnsNames: [web.example.com]
duration: 2160h
issuerRef:
  name: letsencrypt
  kind: ClusterIssuer
"#;
        let spec: CertificateSpec = serde_yaml::from_str(yaml).expect("yaml should parse");
        assert_eq!(spec.key_algorithm, KeyAlgorithm::Rsa);
        assert_eq!(spec.key_encoding, KeyEncoding::Pkcs1);
        assert_eq!(spec.key_size, 0);
        assert_eq!(spec.duration, Some(Duration::from_hours(2160)));
        assert_eq!(spec.issuer_ref.kind, IssuerKind::ClusterIssuer);
    }
}
