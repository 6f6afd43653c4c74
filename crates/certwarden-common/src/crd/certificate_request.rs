//! CertificateRequest CRD: one CSR submission for one issuance attempt
//!
//! Created by the certificates controller; the per-issuer controllers fill
//! in the status. A request is terminal once it is Ready, Failed or Denied.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    find_condition, is_condition_true, Condition, ConditionStatus, IssuerRef, CONDITION_DENIED,
    CONDITION_FAILED, CONDITION_READY,
};
use crate::Duration;

/// A request to sign one CSR
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certwarden.io",
    version = "v1alpha1",
    kind = "CertificateRequest",
    derive = "PartialEq",
    namespaced,
    status = "CertificateRequestStatus",
    shortname = "cr",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Issuer","type":"string","jsonPath":".spec.issuerRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM-encoded PKCS#10 certificate signing request
    pub csr: String,

    /// Issuer that should sign the request
    pub issuer_ref: IssuerRef,

    /// Requested lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// Request a CA certificate
    #[serde(default)]
    pub is_ca: bool,
}

/// Outcome of a CertificateRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    /// Ready / Failed / Denied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// PEM-encoded signed certificate chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// PEM-encoded CA certificate, when the issuer reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,

    /// When the request failed permanently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<DateTime<Utc>>,
}

/// Lifecycle position of a CertificateRequest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Still waiting for the issuer
    InFlight,
    /// Signed certificate available
    Ready,
    /// Issuer gave up
    Failed,
    /// Request was denied before signing
    Denied,
}

impl RequestState {
    /// Whether no further processing will happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

impl CertificateRequest {
    /// Where the request is in its lifecycle
    pub fn state(&self) -> RequestState {
        let Some(status) = &self.status else {
            return RequestState::InFlight;
        };
        if is_condition_true(&status.conditions, CONDITION_DENIED) {
            RequestState::Denied
        } else if is_condition_true(&status.conditions, CONDITION_FAILED) {
            RequestState::Failed
        } else if is_condition_true(&status.conditions, CONDITION_READY)
            && status.certificate.is_some()
        {
            RequestState::Ready
        } else if find_condition(&status.conditions, CONDITION_READY).is_some_and(|c| {
            c.status == ConditionStatus::False && c.reason == REASON_FAILED
        }) {
            RequestState::Failed
        } else {
            RequestState::InFlight
        }
    }
}

/// Ready condition reason for a request still being worked on
pub const REASON_PENDING: &str = "Pending";

/// Ready condition reason for a signed request
pub const REASON_ISSUED: &str = "Issued";

/// Ready condition reason for a permanently failed request
pub const REASON_FAILED: &str = "Failed";
