//! CertificateRequest controllers, one per issuer type
//!
//! Each controller only acts on requests whose issuer resolves to its own
//! backend type, so a request is signed by exactly one controller. Once a
//! request is Ready, Failed or Denied it is never touched again.

use std::sync::Arc;

use async_trait::async_trait;
use certwarden_common::crd::{
    is_condition_true, set_condition, CertificateRequest, CertificateRequestStatus, Condition,
    ConditionStatus, GenericIssuer, IssuerKind, IssuerRef, IssuerType, Order, CONDITION_READY,
    REASON_FAILED, REASON_ISSUED, REASON_PENDING,
};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_issuer::{IssueResponse, IssuerError};
use chrono::Utc;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::{owner_of_kind, referencing_issuer};
use crate::context::ControllerContext;
use crate::error::ReconcileError;
use crate::runtime::{Action, Controller, Reconciler, StoreWatch};

/// Name of the controller serving `issuer_type`
pub fn controller_name(issuer_type: IssuerType) -> String {
    format!("certificaterequests-issuer-{}", issuer_type.as_str())
}

/// Signs CertificateRequests through one issuer type's backend
pub struct CertificateRequestReconciler {
    ctx: ControllerContext,
    issuer_type: IssuerType,
    name: String,
}

impl CertificateRequestReconciler {
    /// Reconciler for requests against issuers of `issuer_type`
    pub fn new(ctx: ControllerContext, issuer_type: IssuerType) -> Self {
        Self {
            ctx,
            issuer_type,
            name: controller_name(issuer_type),
        }
    }

    /// Controller watching requests, their Orders and their issuers
    pub fn controller(ctx: &ControllerContext, issuer_type: IssuerType) -> Controller {
        Controller::new(Arc::new(Self::new(ctx.clone(), issuer_type)), ctx.workers)
            .watches(StoreWatch::primary(ctx.requests().clone()))
            .watches(StoreWatch::new(ctx.orders().clone(), |order: &Order| {
                owner_of_kind(order, CertificateRequest::kind(&()).as_ref())
            }))
            .watches(StoreWatch::new(
                ctx.issuers.clone(),
                referencing_issuer(ctx.requests().clone(), IssuerKind::Issuer, issuer_ref_of),
            ))
            .watches(StoreWatch::new(
                ctx.cluster_issuers.clone(),
                referencing_issuer(
                    ctx.requests().clone(),
                    IssuerKind::ClusterIssuer,
                    issuer_ref_of,
                ),
            ))
    }

    fn serves(&self, issuer: &GenericIssuer) -> bool {
        issuer.issuer_type().ok() == Some(self.issuer_type)
    }

    async fn issued(&self, request: &CertificateRequest, response: IssueResponse) -> Result<Action, ReconcileError> {
        let mut status = request.status.clone().unwrap_or_default();
        status.certificate = Some(response.certificate);
        status.ca = response.ca;
        set_condition(
            &mut status.conditions,
            Condition::ready(ConditionStatus::True, REASON_ISSUED, "Certificate fetched from issuer successfully"),
        );
        self.write_status(request, status).await?;
        info!(request = %request.name_any(), "Certificate signed");
        self.event(request, EventType::Normal, reasons::ISSUED, "Certificate fetched from issuer successfully")
            .await;
        Ok(Action::await_change())
    }

    /// Mark the request terminally Failed
    async fn failed(&self, request: &CertificateRequest, message: String) -> Result<Action, ReconcileError> {
        let mut status = request.status.clone().unwrap_or_default();
        status.failure_time = Some(Utc::now());
        set_condition(
            &mut status.conditions,
            Condition::ready(ConditionStatus::False, REASON_FAILED, message.clone()),
        );
        self.write_status(request, status).await?;
        warn!(request = %request.name_any(), %message, "CertificateRequest failed");
        Ok(Action::await_change())
    }

    async fn pending(&self, request: &CertificateRequest, message: impl Into<String>) -> Result<(), ReconcileError> {
        let mut status = request.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::ready(ConditionStatus::False, REASON_PENDING, message),
        );
        self.write_status(request, status).await
    }

    async fn write_status(
        &self,
        request: &CertificateRequest,
        status: CertificateRequestStatus,
    ) -> Result<(), ReconcileError> {
        if request.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = request.clone();
        updated.status = Some(status);
        self.ctx.requests().update_status(&updated).await?;
        Ok(())
    }

    async fn event(&self, request: &CertificateRequest, type_: EventType, reason: &str, note: impl Into<String>) {
        self.ctx
            .events()
            .publish(&request.object_ref(&()), type_, reason, actions::SIGN, Some(note.into()))
            .await;
    }
}

#[async_trait]
impl Reconciler for CertificateRequestReconciler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(request) = self.ctx.requests().get(key) else {
            return Ok(Action::await_change());
        };
        if request.state().is_terminal() {
            return Ok(Action::await_change());
        }

        let issuer_ref = &request.spec.issuer_ref;
        let Some(issuer) = self.ctx.get_issuer(key.namespace(), issuer_ref) else {
            // Every type's controller sees this; none of them owns the request yet.
            debug!(issuer = %issuer_ref.name, "Referenced issuer not found");
            return Ok(Action::await_change());
        };
        if !self.serves(&issuer) {
            return Ok(Action::await_change());
        }

        let ready = issuer
            .status()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY));
        if !ready {
            self.pending(
                &request,
                format!("Referenced {} {} is not ready", issuer_ref.kind, issuer_ref.name),
            )
            .await?;
            return Ok(Action::await_change());
        }

        let backend = self.ctx.backends.backend_for(&issuer)?;
        match backend.sign(&request).await {
            Ok(Some(response)) => self.issued(&request, response).await,
            Ok(None) => {
                self.failed(&request, "The issuer refused to sign the request".to_string())
                    .await
            }
            Err(e) if e.is_pending() => {
                debug!(error = %e, "Waiting on issuer");
                self.pending(&request, e.to_string()).await?;
                Ok(Action::await_change())
            }
            Err(e @ IssuerError::Validation { .. }) => {
                self.event(&request, EventType::Warning, reasons::FAILED, e.to_string())
                    .await;
                self.failed(&request, e.to_string()).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn issuer_ref_of(request: &CertificateRequest) -> &IssuerRef {
    &request.spec.issuer_ref
}
