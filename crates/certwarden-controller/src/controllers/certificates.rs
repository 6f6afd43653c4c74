//! Certificate controller
//!
//! Keeps the Secret named by `spec.secretName` holding a valid keypair for
//! the Certificate. When the Secret is missing, stale or due for renewal a
//! new private key is staged in `<secretName>-next-key` and a
//! CertificateRequest `<name>-<revision>` is created for it. Once the
//! request is signed the certificate and staged key are copied into the
//! target Secret together.
//!
//! At most one request per Certificate is in flight at a time, and a failed
//! request blocks new attempts for [`FAILURE_BACKOFF`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::crd::{
    set_condition, Certificate, CertificateRequest, CertificateRequestSpec, CertificateStatus,
    Condition, ConditionStatus, IssuerKind, RequestState, CONDITION_READY,
};
use certwarden_common::events::{actions, reasons};
use certwarden_common::metrics;
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_common::{
    CA_CERT_KEY, CERTIFICATE_NAME_LABEL, CERTIFICATE_REVISION_ANNOTATION,
    PRIVATE_KEY_SECRET_ANNOTATION, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use certwarden_issuer::secrets::value_of;
use certwarden_pki::{
    build_csr, encode_private_key, generate_private_key_for_certificate, parse_private_key_pem,
    CertificateInfo, CsrInfo, PrivateKey,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::{labelled_certificate, referencing_issuer};
use crate::context::ControllerContext;
use crate::error::ReconcileError;
use crate::runtime::{Action, Controller, Reconciler, StoreWatch};
use crate::scheduler::{effective_renew_before, time_until_renew};

/// Controller name
pub const CONTROLLER_NAME: &str = "certificates";

/// Minimum time between a failed request and the next attempt
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Condition set while a new certificate is being requested
pub const CONDITION_ISSUING: &str = "Issuing";

const REASON_READY: &str = "Ready";
const REASON_ISSUER_NOT_FOUND: &str = "IssuerNotFound";
const REASON_DOES_NOT_EXIST: &str = "DoesNotExist";

/// Type of the Secret holding the issued keypair
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Name of the Secret staging the private key for the next issuance
pub fn next_key_secret_name(cert: &Certificate) -> String {
    format!("{}-next-key", cert.spec.secret_name)
}

/// Name of the request for `revision`
pub fn request_name(cert: &Certificate, revision: u32) -> String {
    format!("{}-{}", cert.name_any(), revision)
}

/// What the target Secret says about the Certificate
enum Evaluation {
    /// Valid, matching and not yet due
    Current {
        info: CertificateInfo,
        certificate_pem: String,
        renew_in: chrono::Duration,
        clamped: bool,
    },
    /// Needs a new certificate, with the reason why
    Reissue(String),
}

/// Reconciles Certificates
pub struct CertificateReconciler {
    ctx: ControllerContext,
}

impl CertificateReconciler {
    /// Reconciler over `ctx`
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Controller watching Certificates and everything they depend on
    pub fn controller(ctx: &ControllerContext) -> Controller {
        Controller::new(Arc::new(Self::new(ctx.clone())), ctx.workers)
            .watches(StoreWatch::primary(ctx.certificates.clone()))
            .watches(StoreWatch::new(
                ctx.requests().clone(),
                labelled_certificate::<CertificateRequest>,
            ))
            .watches(StoreWatch::new(ctx.secrets().clone(), labelled_certificate::<Secret>))
            .watches(StoreWatch::new(
                ctx.issuers.clone(),
                referencing_issuer(ctx.certificates.clone(), IssuerKind::Issuer, issuer_ref_of),
            ))
            .watches(StoreWatch::new(
                ctx.cluster_issuers.clone(),
                referencing_issuer(
                    ctx.certificates.clone(),
                    IssuerKind::ClusterIssuer,
                    issuer_ref_of,
                ),
            ))
    }

    fn evaluate(&self, cert: &Certificate, now: DateTime<Utc>) -> Evaluation {
        let namespace = cert.namespace().unwrap_or_default();
        let key = ObjectKey::namespaced(&namespace, &cert.spec.secret_name);
        let Some(secret) = self.ctx.secrets().get(&key) else {
            return Evaluation::Reissue(format!("secret {} does not exist", key));
        };
        let (Some(certificate_pem), Some(key_pem)) = (
            value_of(&secret, TLS_CERT_KEY),
            value_of(&secret, TLS_PRIVATE_KEY_KEY),
        ) else {
            return Evaluation::Reissue(format!("secret {} is missing {} or {}", key, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY));
        };

        let private_key = match parse_private_key_pem(&key_pem) {
            Ok(k) => k,
            Err(e) => return Evaluation::Reissue(format!("stored private key is invalid: {}", e)),
        };
        if !private_key.matches_spec(&cert.spec) {
            return Evaluation::Reissue(format!(
                "stored private key does not match keyAlgorithm {} and keySize {}",
                cert.spec.key_algorithm, cert.spec.key_size
            ));
        }
        let info = match CertificateInfo::from_pem(&certificate_pem) {
            Ok(info) => info,
            Err(e) => return Evaluation::Reissue(format!("stored certificate is invalid: {}", e)),
        };
        if !private_key.public_key().matches(&info.public_key) {
            return Evaluation::Reissue("stored certificate does not match the private key".to_string());
        }
        if !info.covers(cert.spec.common_name.as_deref(), &cert.spec.dns_names) {
            return Evaluation::Reissue("stored certificate does not cover every requested name".to_string());
        }

        let default_renew_before = self.ctx.options().renew_before_expiry_duration;
        let renew_in = time_until_renew(info.not_before, info.not_after, &cert.spec, default_renew_before, now);
        if self.ctx.options().certificate_needs_renew(renew_in) {
            return Evaluation::Reissue(format!("certificate expiring at {} is due for renewal", info.not_after));
        }
        let clamped = effective_renew_before(info.lifetime(), &cert.spec, default_renew_before).clamped;
        Evaluation::Current {
            info,
            certificate_pem,
            renew_in,
            clamped,
        }
    }

    async fn up_to_date(
        &self,
        cert: &Certificate,
        info: CertificateInfo,
        certificate_pem: String,
        renew_in: chrono::Duration,
        clamped: bool,
    ) -> Result<Action, ReconcileError> {
        let namespace = cert.namespace().unwrap_or_default();
        let mut status = cert.status.clone().unwrap_or_default();
        let first_seen = status.not_after != Some(info.not_after);

        // A request signed on an earlier pass whose revision bump was lost.
        let next = request_name(cert, cert.revision() + 1);
        if let Some(request) = self.ctx.requests().get(&ObjectKey::namespaced(&namespace, &next)) {
            let issued = request.status.as_ref().and_then(|s| s.certificate.as_deref());
            if request.state() == RequestState::Ready && issued == Some(certificate_pem.as_str()) {
                status.revision = Some(cert.revision() + 1);
                status.next_private_key_secret_name = None;
                self.delete_next_key(cert).await?;
                self.delete_previous_requests(cert, cert.revision() + 1).await?;
            }
        }

        status.not_after = Some(info.not_after);
        set_condition(
            &mut status.conditions,
            Condition::ready(
                ConditionStatus::True,
                REASON_READY,
                "Certificate is up to date and has not expired",
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_ISSUING, ConditionStatus::False, REASON_READY, "No issuance in progress"),
        );
        self.write_status(cert, status).await?;
        metrics::update_certificate_expiry(&namespace, &cert.name_any(), info.not_after);

        if first_seen && clamped {
            info!(
                certificate = %cert.name_any(),
                lifetime_secs = info.lifetime().num_seconds(),
                "renewBefore exceeds the certificate lifetime, renewing at two thirds of it instead"
            );
            self.event(
                cert,
                EventType::Normal,
                reasons::RENEW_BEFORE_CLAMPED,
                format!(
                    "renewBefore is longer than the issued certificate lives ({}s); renewing one third before expiry",
                    info.lifetime().num_seconds()
                ),
            )
            .await;
        }

        debug!(renew_in_secs = renew_in.num_seconds(), "Certificate is current");
        Ok(Action::requeue(renew_in.to_std().unwrap_or(Duration::ZERO)))
    }

    async fn issue(
        &self,
        cert: &Certificate,
        why: String,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let revision = cert.revision() + 1;
        let name = request_name(cert, revision);

        let owned = self.owned_requests(cert);

        // Requests for other revisions can never complete this one.
        for superseded in owned
            .iter()
            .filter(|r| r.name_any() != name && !r.state().is_terminal())
        {
            info!(request = %superseded.name_any(), "Deleting superseded CertificateRequest");
            self.delete_request(superseded).await?;
        }

        let Some(request) = owned.into_iter().find(|r| r.name_any() == name) else {
            return self.create_request(cert, &name, revision, why, now).await;
        };

        let state = request.state();
        if !request_matches_spec(&request, cert) {
            info!(request = %name, "CertificateRequest no longer matches the Certificate, replacing it");
            self.delete_request(&request).await?;
            if matches!(state, RequestState::Failed | RequestState::Denied) {
                // The failure belongs to a spec that no longer applies.
                self.clear_failure(cert).await?;
            }
            return Ok(Action::await_change());
        }
        match state {
            RequestState::InFlight => {
                debug!(request = %name, "Waiting for CertificateRequest");
                Ok(Action::await_change())
            }
            RequestState::Ready => self.complete(cert, &request, revision, now).await,
            RequestState::Failed | RequestState::Denied => self.failed(cert, &request, now).await,
        }
    }

    async fn create_request(
        &self,
        cert: &Certificate,
        name: &str,
        revision: u32,
        why: String,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        if let Some(retry_at) = retry_after_failure(cert) {
            if now < retry_at {
                debug!(%retry_at, "Last issuance failed, backing off");
                return Ok(Action::requeue((retry_at - now).to_std().unwrap_or(FAILURE_BACKOFF)));
            }
        }

        let private_key = self.ensure_next_key(cert).await?;
        let csr = build_csr(&cert.spec, &private_key)?;

        let namespace = cert.namespace().unwrap_or_default();
        let mut request = CertificateRequest::new(
            name,
            CertificateRequestSpec {
                csr,
                issuer_ref: cert.spec.issuer_ref.clone(),
                duration: cert.spec.duration,
                is_ca: cert.spec.is_ca,
            },
        );
        request.metadata.namespace = Some(namespace);
        request.metadata.labels = Some(BTreeMap::from([(
            CERTIFICATE_NAME_LABEL.to_string(),
            cert.name_any(),
        )]));
        request.metadata.annotations = Some(BTreeMap::from([
            (
                PRIVATE_KEY_SECRET_ANNOTATION.to_string(),
                next_key_secret_name(cert),
            ),
            (CERTIFICATE_REVISION_ANNOTATION.to_string(), revision.to_string()),
        ]));
        request.metadata.owner_references = cert.controller_owner_ref(&()).map(|r| vec![r]);

        match self.ctx.requests().create(&request).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        }
        info!(request = %name, reason = %why, "Created CertificateRequest");

        let mut status = cert.status.clone().unwrap_or_default();
        status.next_private_key_secret_name = Some(next_key_secret_name(cert));
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_ISSUING, ConditionStatus::True, reasons::ISSUING, why.clone()),
        );
        if !status.conditions.iter().any(|c| c.type_ == CONDITION_READY) {
            set_condition(
                &mut status.conditions,
                Condition::ready(ConditionStatus::False, REASON_DOES_NOT_EXIST, why.clone()),
            );
        }
        self.write_status(cert, status).await?;
        self.event(
            cert,
            EventType::Normal,
            reasons::ISSUING,
            format!("Requesting certificate as {}: {}", name, why),
        )
        .await;
        Ok(Action::await_change())
    }

    /// CertificateRequests labelled as belonging to `cert`
    fn owned_requests(&self, cert: &Certificate) -> Vec<CertificateRequest> {
        let cert_name = cert.name_any();
        self.ctx
            .requests()
            .list(cert.namespace().as_deref())
            .into_iter()
            .filter(|r| r.labels().get(CERTIFICATE_NAME_LABEL) == Some(&cert_name))
            .collect()
    }

    async fn clear_failure(&self, cert: &Certificate) -> Result<(), ReconcileError> {
        let mut status = cert.status.clone().unwrap_or_default();
        if status.last_failure_time.take().is_none() {
            return Ok(());
        }
        debug!("Spec changed since the last failure, lifting the back-off");
        self.write_status(cert, status).await
    }

    /// Delete terminal requests of revisions before `revision`
    async fn delete_previous_requests(&self, cert: &Certificate, revision: u32) -> Result<(), ReconcileError> {
        for previous in self.owned_requests(cert).iter().filter(|r| {
            r.state().is_terminal() && request_revision(r).is_some_and(|rev| rev < revision)
        }) {
            debug!(request = %previous.name_any(), "Deleting CertificateRequest of an earlier revision");
            self.delete_request(previous).await?;
        }
        Ok(())
    }

    /// Private key staged for the next issuance, generated when missing or
    /// no longer matching the Certificate
    async fn ensure_next_key(&self, cert: &Certificate) -> Result<PrivateKey, ReconcileError> {
        let namespace = cert.namespace().unwrap_or_default();
        let key = ObjectKey::namespaced(&namespace, next_key_secret_name(cert));
        let existing = self.ctx.secrets().get(&key);

        if let Some(pem) = existing.as_ref().and_then(|s| value_of(s, TLS_PRIVATE_KEY_KEY)) {
            match parse_private_key_pem(&pem) {
                Ok(k) if k.matches_spec(&cert.spec) => return Ok(k),
                _ => debug!(secret = %key, "Staged private key is unusable, generating a new one"),
            }
        }

        let private_key = match generate_private_key_for_certificate(&cert.spec) {
            Ok(k) => k,
            Err(e) => {
                self.event(cert, EventType::Warning, reasons::KEY_GENERATION_FAILED, e.to_string())
                    .await;
                if e.is_key_spec_error() {
                    let mut status = cert.status.clone().unwrap_or_default();
                    set_condition(
                        &mut status.conditions,
                        Condition::ready(ConditionStatus::False, reasons::KEY_GENERATION_FAILED, e.to_string()),
                    );
                    self.write_status(cert, status).await?;
                }
                return Err(e.into());
            }
        };
        let pem = encode_private_key(&private_key, cert.spec.key_encoding)?;
        let data = BTreeMap::from([(TLS_PRIVATE_KEY_KEY.to_string(), ByteString(pem.into_bytes()))]);

        match existing {
            Some(mut secret) => {
                secret.data = Some(data);
                self.ctx.secrets().update(&secret).await?;
            }
            None => {
                let mut secret = Secret::default();
                secret.metadata.name = Some(key.name.clone());
                secret.metadata.namespace = Some(namespace);
                secret.metadata.labels = Some(certificate_labels(cert));
                secret.metadata.owner_references = cert.controller_owner_ref(&()).map(|r| vec![r]);
                secret.data = Some(data);
                self.ctx.secrets().create(&secret).await?;
            }
        }
        info!(secret = %key, algorithm = %cert.spec.key_algorithm, "Generated private key");
        Ok(private_key)
    }

    async fn complete(
        &self,
        cert: &Certificate,
        request: &CertificateRequest,
        revision: u32,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let namespace = cert.namespace().unwrap_or_default();
        let status = request.status.clone().unwrap_or_default();
        let Some(certificate_pem) = status.certificate else {
            return Err(ReconcileError::internal("ready CertificateRequest has no certificate"));
        };

        let key_secret = request
            .annotations()
            .get(PRIVATE_KEY_SECRET_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| next_key_secret_name(cert));
        let key_pem = self
            .ctx
            .secrets()
            .get(&ObjectKey::namespaced(&namespace, &key_secret))
            .and_then(|s| value_of(&s, TLS_PRIVATE_KEY_KEY));

        let checked = match (key_pem, CertificateInfo::from_pem(&certificate_pem)) {
            (None, _) => Err(format!("staged private key {} is gone", key_secret)),
            (_, Err(e)) => Err(format!("issued certificate is invalid: {}", e)),
            (Some(key_pem), Ok(info)) => match parse_private_key_pem(&key_pem) {
                Ok(k) if !k.public_key().matches(&info.public_key) => {
                    Err("issued certificate does not match the staged private key".to_string())
                }
                Ok(_) if !info.covers(cert.spec.common_name.as_deref(), &cert.spec.dns_names) => {
                    Err("issued certificate does not cover every requested name".to_string())
                }
                Ok(_) => Ok((key_pem, info)),
                Err(e) => Err(format!("staged private key is invalid: {}", e)),
            },
        };
        let (key_pem, info) = match checked {
            Ok(v) => v,
            Err(message) => {
                warn!(request = %request.name_any(), %message, "Discarding issued certificate");
                self.event(cert, EventType::Warning, reasons::FAILED, message).await;
                self.delete_request(request).await?;
                return Ok(Action::await_change());
            }
        };

        self.write_target_secret(cert, &certificate_pem, &key_pem, status.ca.as_deref())
            .await?;

        let default_renew_before = self.ctx.options().renew_before_expiry_duration;
        let renew_in = time_until_renew(info.not_before, info.not_after, &cert.spec, default_renew_before, now);

        let mut cert_status = cert.status.clone().unwrap_or_default();
        cert_status.revision = Some(revision);
        cert_status.not_after = Some(info.not_after);
        cert_status.last_failure_time = None;
        cert_status.next_private_key_secret_name = None;
        set_condition(
            &mut cert_status.conditions,
            Condition::ready(ConditionStatus::True, REASON_READY, "Certificate is up to date and has not expired"),
        );
        set_condition(
            &mut cert_status.conditions,
            Condition::new(CONDITION_ISSUING, ConditionStatus::False, reasons::ISSUED, "Issued"),
        );
        self.write_status(cert, cert_status).await?;
        self.delete_next_key(cert).await?;
        self.delete_previous_requests(cert, revision).await?;

        metrics::update_certificate_expiry(&namespace, &cert.name_any(), info.not_after);
        info!(revision, not_after = %info.not_after, "Certificate issued");
        self.event(
            cert,
            EventType::Normal,
            reasons::ISSUED,
            format!("Certificate issued successfully (revision {})", revision),
        )
        .await;
        Ok(Action::requeue(renew_in.to_std().unwrap_or(Duration::ZERO)))
    }

    async fn write_target_secret(
        &self,
        cert: &Certificate,
        certificate_pem: &str,
        key_pem: &str,
        ca_pem: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let namespace = cert.namespace().unwrap_or_default();
        let key = ObjectKey::namespaced(&namespace, &cert.spec.secret_name);

        let mut data = BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(certificate_pem.as_bytes().to_vec())),
            (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(key_pem.as_bytes().to_vec())),
        ]);
        if let Some(ca) = ca_pem {
            data.insert(CA_CERT_KEY.to_string(), ByteString(ca.as_bytes().to_vec()));
        }

        match self.ctx.secrets().get(&key) {
            Some(mut secret) => {
                secret.data = Some(data);
                secret
                    .labels_mut()
                    .insert(CERTIFICATE_NAME_LABEL.to_string(), cert.name_any());
                self.ctx.secrets().update(&secret).await?;
            }
            None => {
                let mut secret = Secret::default();
                secret.metadata.name = Some(key.name.clone());
                secret.metadata.namespace = Some(namespace);
                secret.metadata.labels = Some(certificate_labels(cert));
                secret.type_ = Some(TLS_SECRET_TYPE.to_string());
                secret.data = Some(data);
                self.ctx.secrets().create(&secret).await?;
            }
        }
        Ok(())
    }

    async fn failed(
        &self,
        cert: &Certificate,
        request: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let failed_at = request
            .status
            .as_ref()
            .and_then(|s| s.failure_time)
            .unwrap_or(now);

        let mut status = cert.status.clone().unwrap_or_default();
        if status.last_failure_time != Some(failed_at) {
            let message = request
                .status
                .as_ref()
                .and_then(|s| s.conditions.iter().find(|c| c.type_ == CONDITION_READY))
                .map(|c| c.message.clone())
                .unwrap_or_else(|| "CertificateRequest failed".to_string());
            status.last_failure_time = Some(failed_at);
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_ISSUING, ConditionStatus::False, reasons::FAILED, message.clone()),
            );
            self.write_status(cert, status).await?;
            warn!(request = %request.name_any(), %message, "Issuance failed");
            self.event(
                cert,
                EventType::Warning,
                reasons::FAILED,
                format!("CertificateRequest {} failed: {}", request.name_any(), message),
            )
            .await;
        }

        let retry_at = failed_at + chrono::Duration::from_std(FAILURE_BACKOFF).unwrap_or_default();
        if now < retry_at {
            return Ok(Action::requeue((retry_at - now).to_std().unwrap_or(FAILURE_BACKOFF)));
        }

        // Retrying with a fresh request and a fresh key.
        self.delete_request(request).await?;
        self.delete_next_key(cert).await?;
        Ok(Action::await_change())
    }

    async fn delete_request(&self, request: &CertificateRequest) -> Result<(), ReconcileError> {
        let Some(key) = ObjectKey::of(request) else {
            return Ok(());
        };
        match self.ctx.requests().delete(&key).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn delete_next_key(&self, cert: &Certificate) -> Result<(), ReconcileError> {
        let key = ObjectKey::namespaced(cert.namespace().unwrap_or_default(), next_key_secret_name(cert));
        if self.ctx.secrets().get(&key).is_none() {
            return Ok(());
        }
        match self.ctx.secrets().delete(&key).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn set_ready(
        &self,
        cert: &Certificate,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Result<(), ReconcileError> {
        let mut cert_status = cert.status.clone().unwrap_or_default();
        set_condition(&mut cert_status.conditions, Condition::ready(status, reason, message));
        self.write_status(cert, cert_status).await
    }

    async fn write_status(&self, cert: &Certificate, status: CertificateStatus) -> Result<(), ReconcileError> {
        if cert.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = cert.clone();
        updated.status = Some(status);
        self.ctx.certificates.update_status(&updated).await?;
        Ok(())
    }

    async fn event(&self, cert: &Certificate, type_: EventType, reason: &str, note: impl Into<String>) {
        self.ctx
            .events()
            .publish(&cert.object_ref(&()), type_, reason, actions::RECONCILE, Some(note.into()))
            .await;
    }
}

#[async_trait]
impl Reconciler for CertificateReconciler {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(cert) = self.ctx.certificates.get(key) else {
            metrics::remove_certificate_expiry(key.namespace().unwrap_or_default(), &key.name);
            return Ok(Action::await_change());
        };

        if let Err(e) = cert.validate() {
            let message = e.to_string();
            self.set_ready(&cert, ConditionStatus::False, reasons::VALIDATION_FAILED, message.clone())
                .await?;
            self.event(&cert, EventType::Warning, reasons::VALIDATION_FAILED, message)
                .await;
            return Err(e.into());
        }

        let namespace = cert.namespace();
        if self
            .ctx
            .get_issuer(namespace.as_deref(), &cert.spec.issuer_ref)
            .is_none()
        {
            self.set_ready(
                &cert,
                ConditionStatus::False,
                REASON_ISSUER_NOT_FOUND,
                format!(
                    "{} {} does not exist",
                    cert.spec.issuer_ref.kind, cert.spec.issuer_ref.name
                ),
            )
            .await?;
            return Ok(Action::await_change());
        }

        let now = Utc::now();
        match self.evaluate(&cert, now) {
            Evaluation::Current {
                info,
                certificate_pem,
                renew_in,
                clamped,
            } => self.up_to_date(&cert, info, certificate_pem, renew_in, clamped).await,
            Evaluation::Reissue(why) => {
                debug!(reason = %why, "Certificate needs issuance");
                self.issue(&cert, why, now).await
            }
        }
    }
}

fn issuer_ref_of(cert: &Certificate) -> &certwarden_common::crd::IssuerRef {
    &cert.spec.issuer_ref
}

fn certificate_labels(cert: &Certificate) -> BTreeMap<String, String> {
    BTreeMap::from([(CERTIFICATE_NAME_LABEL.to_string(), cert.name_any())])
}

fn retry_after_failure(cert: &Certificate) -> Option<DateTime<Utc>> {
    let failed_at = cert.status.as_ref()?.last_failure_time?;
    Some(failed_at + chrono::Duration::from_std(FAILURE_BACKOFF).unwrap_or_default())
}

fn request_revision(request: &CertificateRequest) -> Option<u32> {
    request
        .annotations()
        .get(CERTIFICATE_REVISION_ANNOTATION)
        .and_then(|r| r.parse().ok())
}

/// Whether the request still asks for what the Certificate wants
fn request_matches_spec(request: &CertificateRequest, cert: &Certificate) -> bool {
    let Ok(csr) = CsrInfo::from_pem(&request.spec.csr) else {
        return false;
    };
    let mut wanted = cert.dns_identifiers();
    let mut requested = csr.identifiers();
    wanted.sort();
    requested.sort();
    wanted == requested
        && request.spec.issuer_ref == cert.spec.issuer_ref
        && request.spec.duration == cert.spec.duration
        && request.spec.is_ca == cert.spec.is_ca
}
