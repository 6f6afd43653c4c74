//! Issuer and ClusterIssuer CRDs
//!
//! Both kinds share one configuration type. Exactly one backend block
//! (`acme`, `ca`, `selfSigned`, `vault`, `venafi`) must be set; the backend
//! is chosen once from that block and never re-inspected afterwards.
//!
//! Example:
//! ```yaml
//! apiVersion: certwarden.io/v1alpha1
//! kind: ClusterIssuer
//! metadata:
//!   name: letsencrypt
//! spec:
//!   acme:
//!     server: https://acme-v02.api.letsencrypt.org/directory
//!     email: ops@example.com
//!     privateKeySecretRef:
//!       name: letsencrypt-account
//!     solvers:
//!       - http01: {}
//! ```

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, IssuerKind, IssuerRef, SecretKeySelector};
use crate::Error;

/// Backend configuration shared by Issuer and ClusterIssuer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerConfig {
    /// ACME CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeIssuer>,

    /// Local signing CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaIssuer>,

    /// Self-signed certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<SelfSignedIssuer>,

    /// HashiCorp Vault PKI engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultIssuer>,

    /// Venafi TPP or Venafi Cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venafi: Option<VenafiIssuer>,
}

/// Backend variant selected by an [`IssuerConfig`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IssuerType {
    /// ACME
    Acme,
    /// Local CA
    Ca,
    /// Self-signed
    SelfSigned,
    /// Vault
    Vault,
    /// Venafi
    Venafi,
}

impl IssuerType {
    /// All backend variants, in registration order
    pub const ALL: [IssuerType; 5] = [
        IssuerType::Acme,
        IssuerType::Ca,
        IssuerType::SelfSigned,
        IssuerType::Vault,
        IssuerType::Venafi,
    ];

    /// Lowercase name used in controller names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acme => "acme",
            Self::Ca => "ca",
            Self::SelfSigned => "selfsigned",
            Self::Vault => "vault",
            Self::Venafi => "venafi",
        }
    }
}

impl std::fmt::Display for IssuerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IssuerConfig {
    /// The single configured backend
    pub fn issuer_type(&self) -> Result<IssuerType, Error> {
        let mut configured = Vec::new();
        if self.acme.is_some() {
            configured.push(IssuerType::Acme);
        }
        if self.ca.is_some() {
            configured.push(IssuerType::Ca);
        }
        if self.self_signed.is_some() {
            configured.push(IssuerType::SelfSigned);
        }
        if self.vault.is_some() {
            configured.push(IssuerType::Vault);
        }
        if self.venafi.is_some() {
            configured.push(IssuerType::Venafi);
        }
        match configured.as_slice() {
            [one] => Ok(*one),
            [] => Err(Error::validation("no issuer backend configured")),
            many => Err(Error::validation(format!(
                "exactly one issuer backend must be configured, found {}",
                many.iter()
                    .map(IssuerType::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// ACME issuer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuer {
    /// Directory URL of the ACME server
    pub server: String,

    /// Contact email for the account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Secret storing the account credentials
    pub private_key_secret_ref: SecretKeySelector,

    /// Challenge solvers, matched in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solvers: Vec<AcmeSolver>,
}

/// One way of solving challenges, optionally limited to some names
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeSolver {
    /// Restrict this solver to matching names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SolverSelector>,

    /// Solve via HTTP-01
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http01: Option<Http01Solver>,

    /// Solve via DNS-01
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns01: Option<Dns01Solver>,
}

/// Names a solver applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SolverSelector {
    /// Exact DNS names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    /// DNS zones; a name matches if it equals or is below the zone
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_zones: Vec<String>,
}

impl SolverSelector {
    /// Whether `name` is covered by this selector
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim_start_matches("*.");
        if self.dns_names.is_empty() && self.dns_zones.is_empty() {
            return true;
        }
        self.dns_names.iter().any(|n| n.trim_start_matches("*.") == name)
            || self
                .dns_zones
                .iter()
                .any(|zone| name == zone || name.ends_with(&format!(".{}", zone)))
    }
}

/// HTTP-01 solver served by the controller's built-in responder
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Http01Solver {
    /// Base URL used for the local self-check instead of `http://<domain>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_check_base_url: Option<String>,
}

/// DNS-01 solver
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dns01Solver {
    /// Webhook that manages TXT records
    pub webhook: Dns01Webhook,

    /// Nameservers used for the self-check (host:port)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
}

/// Webhook DNS provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dns01Webhook {
    /// Endpoint receiving POST (present) and DELETE (clean up) requests
    pub url: String,

    /// Secret holding a bearer token for the webhook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeySelector>,
}

/// CA issuer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    /// Secret with `tls.crt` and `tls.key` of the signing CA
    pub secret_name: String,
}

/// Self-signed issuer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedIssuer {}

/// Vault issuer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultIssuer {
    /// Vault address, e.g. https://vault.example.com:8200
    pub server: String,

    /// Signing path, e.g. pki/sign/web
    pub path: String,

    /// Authentication method
    pub auth: VaultAuth,
}

/// Vault authentication; exactly one method must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuth {
    /// Static token read from a Secret (key defaults to `token`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretKeySelector>,

    /// AppRole login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_role: Option<VaultAppRole>,
}

/// Vault AppRole credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAppRole {
    /// Mount path of the AppRole backend (defaults to `approle`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Role ID
    pub role_id: String,

    /// Secret holding the secret ID (key defaults to `secretId`)
    pub secret_ref: SecretKeySelector,
}

/// Venafi issuer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VenafiIssuer {
    /// Policy zone requests are placed in
    pub zone: String,

    /// Trust Protection Platform connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpp: Option<VenafiTpp>,

    /// Venafi Cloud connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<VenafiCloud>,
}

/// Venafi TPP connection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VenafiTpp {
    /// Base URL, e.g. https://tpp.example.com
    pub url: String,

    /// Secret holding an OAuth access token (key defaults to `access-token`)
    pub credentials_ref: SecretKeySelector,
}

/// Venafi Cloud connection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VenafiCloud {
    /// API base URL (defaults to https://api.venafi.cloud)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Secret holding the API key (key defaults to `api-key`)
    pub api_token_secret_ref: SecretKeySelector,
}

/// Observed issuer state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStatus {
    /// Ready condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// ACME account state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeIssuerStatus>,
}

/// ACME account registration state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerStatus {
    /// Account URL returned by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Email the account was last registered with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_registered_email: Option<String>,
}

/// Namespaced issuer
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certwarden.io",
    version = "v1alpha1",
    kind = "Issuer",
    derive = "PartialEq",
    namespaced,
    status = "IssuerStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    /// Backend configuration
    #[serde(flatten)]
    pub config: IssuerConfig,
}

/// Cluster-scoped issuer; its secrets live in the cluster resource namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certwarden.io",
    version = "v1alpha1",
    kind = "ClusterIssuer",
    derive = "PartialEq",
    status = "IssuerStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssuerSpec {
    /// Backend configuration
    #[serde(flatten)]
    pub config: IssuerConfig,
}

/// Either issuer kind, behind one interface
#[derive(Clone, Debug, PartialEq)]
pub enum GenericIssuer {
    /// Namespaced issuer
    Issuer(Issuer),
    /// Cluster-scoped issuer
    ClusterIssuer(ClusterIssuer),
}

impl GenericIssuer {
    /// Issuer name
    pub fn name(&self) -> String {
        match self {
            Self::Issuer(i) => i.name_any(),
            Self::ClusterIssuer(i) => i.name_any(),
        }
    }

    /// Namespace, None for ClusterIssuers
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Issuer(i) => i.namespace(),
            Self::ClusterIssuer(_) => None,
        }
    }

    /// Issuer or ClusterIssuer
    pub fn kind(&self) -> IssuerKind {
        match self {
            Self::Issuer(_) => IssuerKind::Issuer,
            Self::ClusterIssuer(_) => IssuerKind::ClusterIssuer,
        }
    }

    /// Backend configuration
    pub fn config(&self) -> &IssuerConfig {
        match self {
            Self::Issuer(i) => &i.spec.config,
            Self::ClusterIssuer(i) => &i.spec.config,
        }
    }

    /// Current status
    pub fn status(&self) -> Option<&IssuerStatus> {
        match self {
            Self::Issuer(i) => i.status.as_ref(),
            Self::ClusterIssuer(i) => i.status.as_ref(),
        }
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut IssuerStatus {
        match self {
            Self::Issuer(i) => i.status.get_or_insert_with(Default::default),
            Self::ClusterIssuer(i) => i.status.get_or_insert_with(Default::default),
        }
    }

    /// Reference to this issuer as seen from a Certificate
    pub fn reference(&self) -> IssuerRef {
        IssuerRef {
            name: self.name(),
            kind: self.kind(),
        }
    }

    /// Kubernetes object reference for events
    pub fn object_ref(&self) -> k8s_openapi::api::core::v1::ObjectReference {
        use kube::Resource;
        match self {
            Self::Issuer(i) => i.object_ref(&()),
            Self::ClusterIssuer(i) => i.object_ref(&()),
        }
    }

    /// Backend variant
    pub fn issuer_type(&self) -> Result<IssuerType, Error> {
        self.config().issuer_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_backend_required() {
        let config = IssuerConfig::default();
        assert!(config.issuer_type().is_err());

        let config = IssuerConfig {
            self_signed: Some(SelfSignedIssuer {}),
            ..Default::default()
        };
        assert_eq!(config.issuer_type().expect("issuer type should resolve"), IssuerType::SelfSigned);

        let config = IssuerConfig {
            self_signed: Some(SelfSignedIssuer {}),
            ca: Some(CaIssuer {
                secret_name: "ca".to_string(),
            }),
            ..Default::default()
        };
        let err = config.issuer_type().unwrap_err();
        assert!(err.to_string().contains("ca, selfsigned"));
    }

    #[test]
    fn flattened_config_deserializes() {
        let yaml = r#"
acme:
  server: https://acme.example.com/directory
  privateKeySecretRef:
    name: account
  solvers:
    - selector:
        dnsZones: [example.com]
      dns01:
        webhook:
          url: http://dns-hook/records
    - http01: {}
"#;
        let spec: ClusterIssuerSpec = serde_yaml::from_str(yaml).expect("yaml should parse");
        let acme = spec.config.acme.expect("acme config should be set");
        assert_eq!(acme.solvers.len(), 2);
        assert!(acme.solvers[0].dns01.is_some());
        assert!(acme.solvers[1].http01.is_some());
    }

    #[test]
    fn selector_matching() {
        let selector = SolverSelector {
            dns_names: vec!["exact.test".to_string()],
            dns_zones: vec!["example.com".to_string()],
        };
        assert!(selector.matches("example.com"));
        assert!(selector.matches("www.example.com"));
        assert!(selector.matches("*.example.com"));
        assert!(selector.matches("exact.test"));
        assert!(!selector.matches("badexample.com"));
        assert!(SolverSelector::default().matches("anything.org"));
    }

    #[test]
    fn generic_issuer_reports_kind_and_scope() {
        let mut issuer = Issuer::new("ca", IssuerSpec::default());
        issuer.metadata.namespace = Some("team".to_string());
        let generic = GenericIssuer::Issuer(issuer);
        assert_eq!(generic.kind(), IssuerKind::Issuer);
        assert_eq!(generic.namespace().as_deref(), Some("team"));

        let generic =
            GenericIssuer::ClusterIssuer(ClusterIssuer::new("le", ClusterIssuerSpec::default()));
        assert_eq!(generic.kind(), IssuerKind::ClusterIssuer);
        assert!(generic.namespace().is_none());
        assert_eq!(generic.reference().name, "le");
    }
}
