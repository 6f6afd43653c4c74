//! Kubernetes Event recording for certwarden controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers and issuer backends can emit Events visible via
//! `kubectl describe certificate`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Issued")
    /// * `action` - What action was taken (e.g. "Sign")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// A published event as captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was published on
    pub object: String,
    /// Whether the event was a warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory, for assertions in tests
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Snapshot of everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Whether an event with this reason has been published
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events.lock().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Certificate lifecycle
    /// A new CertificateRequest was created for a Certificate
    pub const ISSUING: &str = "Issuing";
    /// A signed certificate was stored in the target Secret
    pub const ISSUED: &str = "Issued";
    /// Issuance failed permanently
    pub const FAILED: &str = "Failed";
    /// Resource spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Private key generation failed
    pub const KEY_GENERATION_FAILED: &str = "KeyGenerationFailed";
    /// Certificate renewal was clamped because renewBefore exceeds the lifetime
    pub const RENEW_BEFORE_CLAMPED: &str = "RenewBeforeClamped";

    // Issuer lifecycle
    /// Issuer backend could not be initialised
    pub const ERR_INIT_ISSUER: &str = "ErrInitIssuer";
    /// Issuer backend setup succeeded
    pub const ISSUER_READY: &str = "IssuerReady";
    /// Remote backend has not finished issuing yet
    pub const PENDING: &str = "Pending";
    /// Certificate retrieved from a remote backend
    pub const RETRIEVED: &str = "Retrieved";

    // ACME
    /// ACME Order resource created
    pub const ORDER_CREATED: &str = "OrderCreated";
    /// ACME Order reached a terminal invalid state
    pub const ORDER_FAILED: &str = "OrderFailed";
    /// Challenge proof was published
    pub const PRESENTED: &str = "Presented";
    /// Local self-check of a presented challenge failed
    pub const SELF_CHECK_FAILED: &str = "SelfCheckFailed";
    /// ACME server accepted the challenge
    pub const CHALLENGE_ACCEPTED: &str = "ChallengeAccepted";
    /// ACME server rejected the challenge
    pub const CHALLENGE_REJECTED: &str = "ChallengeRejected";
}

/// Well-known event action strings.
pub mod actions {
    /// Reconciling a resource
    pub const RECONCILE: &str = "Reconcile";
    /// Signing a CertificateRequest
    pub const SIGN: &str = "Sign";
    /// Setting up an issuer
    pub const SETUP: &str = "Setup";
    /// Presenting a challenge
    pub const PRESENT: &str = "Present";
}
