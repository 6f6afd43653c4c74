//! ACME Order CRD
//!
//! One Order per CertificateRequest handled by an ACME issuer. The status
//! persists every step of the protocol so that any reconcile pass can
//! resume where the previous one stopped.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::challenge::ChallengeType;
use super::types::IssuerRef;

/// An ACME order for the names in one CSR
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certwarden.io",
    version = "v1alpha1",
    kind = "Order",
    derive = "PartialEq",
    namespaced,
    status = "OrderStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Issuer","type":"string","jsonPath":".spec.issuerRef.name"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    /// PEM-encoded CSR submitted at finalization
    pub csr: String,

    /// ACME issuer handling the order
    pub issuer_ref: IssuerRef,

    /// Subject common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    /// Names to authorize
    pub dns_names: Vec<String>,
}

/// Protocol position of an Order
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Remote order created; challenges are being solved
    Pending,
    /// All challenges accepted; ready to finalize
    Ready,
    /// Finalized; waiting for the certificate
    Processing,
    /// Certificate downloaded
    Valid,
    /// Rejected by the ACME server
    Invalid,
    /// Failed locally in a way retries cannot fix
    Errored,
}

impl OrderState {
    /// Whether the order will not change any more
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid | Self::Errored)
    }

    /// Whether the order ended without a certificate
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Invalid | Self::Errored)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Observed order state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    /// Remote order URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Remote finalize URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_url: Option<String>,

    /// One entry per identifier, in the order the server returned them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorizations: Vec<AcmeAuthorization>,

    /// PEM certificate chain once valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// Current state; unset until the remote order exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OrderState>,

    /// Why the order is in its current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the order failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<DateTime<Utc>>,
}

/// Authorization for one identifier of an order
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeAuthorization {
    /// Authorization URL
    pub url: String,

    /// DNS name being authorized (without the wildcard prefix)
    pub identifier: String,

    /// Whether the order requested `*.identifier`
    #[serde(default)]
    pub wildcard: bool,

    /// Challenges offered by the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub challenges: Vec<AcmeChallenge>,
}

/// A challenge offered for an authorization
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeChallenge {
    /// Challenge URL
    pub url: String,

    /// Token from the server
    pub token: String,

    /// Challenge type
    #[serde(rename = "type")]
    pub type_: ChallengeType,
}

impl Order {
    /// Current state, None before the remote order is created
    pub fn state(&self) -> Option<OrderState> {
        self.status.as_ref().and_then(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_states() {
        assert!(!OrderState::Pending.is_final());
        assert!(!OrderState::Processing.is_final());
        assert!(OrderState::Valid.is_final());
        assert!(OrderState::Invalid.is_failure());
        assert!(OrderState::Errored.is_failure());
        assert!(!OrderState::Valid.is_failure());
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&OrderState::Processing).expect("serialization should succeed"),
            "\"processing\""
        );
        assert_eq!(OrderState::Errored.to_string(), "errored");
    }
}
