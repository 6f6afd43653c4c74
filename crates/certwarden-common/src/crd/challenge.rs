//! ACME Challenge CRD
//!
//! One Challenge per identifier of an Order. The state only ever moves
//! forward: pending, presented, self-checked, then accepted or rejected.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::issuer::AcmeSolver;
use super::types::IssuerRef;

/// Proof-of-control task for one DNS name
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certwarden.io",
    version = "v1alpha1",
    kind = "Challenge",
    derive = "PartialEq",
    namespaced,
    status = "ChallengeStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.dnsName"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSpec {
    /// Challenge URL at the ACME server
    pub url: String,

    /// Authorization URL the challenge belongs to
    pub authz_url: String,

    /// Name being validated (without the wildcard prefix)
    pub dns_name: String,

    /// Whether the order requested `*.dnsName`
    #[serde(default)]
    pub wildcard: bool,

    /// Challenge type
    #[serde(rename = "type")]
    pub type_: ChallengeType,

    /// Token from the ACME server
    pub token: String,

    /// Key authorization that must be published
    pub key: String,

    /// Solver configuration used to present the challenge
    pub solver: AcmeSolver,

    /// ACME issuer the challenge belongs to
    pub issuer_ref: IssuerRef,
}

/// ACME challenge type
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    /// Token served at /.well-known/acme-challenge/<token>
    #[serde(rename = "http-01")]
    Http01,
    /// TXT record at _acme-challenge.<domain>
    #[serde(rename = "dns-01")]
    Dns01,
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http01 => write!(f, "http-01"),
            Self::Dns01 => write!(f, "dns-01"),
        }
    }
}

/// Progress of a challenge
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeState {
    /// Nothing published yet
    #[default]
    Pending,
    /// Proof published through the solver
    Presented,
    /// Proof verified locally
    SelfChecked,
    /// ACME server validated the proof
    Accepted,
    /// ACME server refused the proof
    Rejected,
}

impl ChallengeState {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Presented => 1,
            Self::SelfChecked => 2,
            Self::Accepted | Self::Rejected => 3,
        }
    }

    /// Whether the ACME server has decided
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }

    /// Whether moving to `next` goes strictly forward
    pub fn can_transition_to(&self, next: ChallengeState) -> bool {
        !self.is_final() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for ChallengeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Presented => "presented",
            Self::SelfChecked => "self-checked",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Refused backward or sideways state change
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal challenge transition from {from} to {to}")]
pub struct TransitionError {
    /// State before the attempted move
    pub from: ChallengeState,
    /// Requested state
    pub to: ChallengeState,
}

/// Observed challenge state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStatus {
    /// Current state
    #[serde(default)]
    pub state: ChallengeState,

    /// Whether the solver currently has the proof published
    #[serde(default)]
    pub presented: bool,

    /// Why the challenge is in its current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChallengeStatus {
    /// Move to `next`, refusing anything but a forward step
    pub fn advance(&mut self, next: ChallengeState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

impl Challenge {
    /// Current state, pending if no status was written yet
    pub fn state(&self) -> ChallengeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_then_backward_move_fails() {
        let mut status = ChallengeStatus::default();
        status.advance(ChallengeState::Presented).expect("transition should succeed");
        status.advance(ChallengeState::SelfChecked).expect("transition should succeed");
        status.advance(ChallengeState::Accepted).expect("transition should succeed");

        let err = status.advance(ChallengeState::Presented).unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: ChallengeState::Accepted,
                to: ChallengeState::Presented,
            }
        );
        assert_eq!(status.state, ChallengeState::Accepted);
    }

    #[test]
    fn final_states_cannot_flip() {
        let mut status = ChallengeStatus {
            state: ChallengeState::Rejected,
            ..Default::default()
        };
        assert!(status.advance(ChallengeState::Accepted).is_err());
    }

    #[test]
    fn self_loops_are_refused() {
        let mut status = ChallengeStatus {
            state: ChallengeState::Presented,
            ..Default::default()
        };
        assert!(status.advance(ChallengeState::Presented).is_err());
    }

    #[test]
    fn rejection_allowed_from_any_open_state() {
        for from in [
            ChallengeState::Pending,
            ChallengeState::Presented,
            ChallengeState::SelfChecked,
        ] {
            assert!(from.can_transition_to(ChallengeState::Rejected), "{from}");
        }
    }

    #[test]
    fn type_uses_acme_names() {
        assert_eq!(
            serde_json::to_string(&ChallengeType::Dns01).expect("serialization should succeed"),
            "\"dns-01\""
        );
        assert_eq!(
            serde_json::to_string(&ChallengeState::SelfChecked).expect("serialization should succeed"),
            "\"self-checked\""
        );
    }
}
