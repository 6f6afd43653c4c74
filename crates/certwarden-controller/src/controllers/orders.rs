//! ACME Order controller
//!
//! Drives one Order through the protocol, one step per pass:
//!
//! ```text
//! (new) -> pending -> ready -> processing -> valid
//!             \          \          \
//!              +----------+----------+-----> invalid / errored
//! ```
//!
//! While pending, one Challenge is kept for every authorization the server
//! has not yet validated. Every remote call is made by the reconcile pass
//! that needs it and its result is persisted in the Order status before the
//! next step, so a restart resumes from the last recorded state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::crd::{
    AcmeAuthorization, AcmeChallenge, AcmeIssuer, AcmeSolver, Challenge, ChallengeSpec,
    ChallengeState, ChallengeType, Order, OrderState, OrderStatus,
};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_issuer::acme::{
    AcmeBackend, AcmeClient, AcmeError, RemoteAuthorization, RemoteOrder, RemoteOrderStatus,
};
use certwarden_issuer::IssuerError;
use certwarden_pki::parse_pem;
use chrono::Utc;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::ORDER_NAME_LABEL;
use crate::context::ControllerContext;
use crate::error::ReconcileError;
use crate::runtime::{Action, Controller, Reconciler, StoreWatch};

/// Controller name
pub const CONTROLLER_NAME: &str = "orders";

/// Delay between polls while the server is working on the Order
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Name of the Challenge for `authz_url` in `order`
pub fn challenge_name(order: &Order, authz_url: &str, type_: ChallengeType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(authz_url.as_bytes());
    hasher.update(type_.to_string().as_bytes());
    let digest = hasher.finalize();
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{}-{}", order.name_any(), hash)
}

/// First solver able to answer for `authz`
///
/// Wildcard names can only be proven over DNS-01. A solver offering both
/// types answers with HTTP-01 unless the name is a wildcard.
pub fn select_solver<'a>(
    solvers: &'a [AcmeSolver],
    authz: &RemoteAuthorization,
) -> Option<(&'a AcmeSolver, ChallengeType)> {
    solvers
        .iter()
        .filter(|s| s.selector.as_ref().is_none_or(|sel| sel.matches(&authz.identifier)))
        .find_map(|s| match (s.http01.is_some(), s.dns01.is_some()) {
            (true, _) if !authz.wildcard => Some((s, ChallengeType::Http01)),
            (_, true) => Some((s, ChallengeType::Dns01)),
            _ => None,
        })
}

/// Reconciles ACME Orders
pub struct OrderReconciler {
    ctx: ControllerContext,
}

impl OrderReconciler {
    /// Reconciler over `ctx`
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Controller watching Orders and their Challenges
    pub fn controller(ctx: &ControllerContext) -> Controller {
        Controller::new(Arc::new(Self::new(ctx.clone())), ctx.workers)
            .watches(StoreWatch::primary(ctx.orders().clone()))
            .watches(StoreWatch::new(ctx.challenges.clone(), |challenge: &Challenge| {
                match (challenge.namespace(), challenge.labels().get(ORDER_NAME_LABEL)) {
                    (Some(ns), Some(order)) => vec![ObjectKey::namespaced(ns, order)],
                    _ => Vec::new(),
                }
            }))
    }

    /// ACME configuration and account client of the Order's issuer
    async fn client(&self, order: &Order) -> Result<Option<(AcmeIssuer, Arc<dyn AcmeClient>)>, ReconcileError> {
        let Some(issuer) = self.ctx.get_issuer(order.namespace().as_deref(), &order.spec.issuer_ref) else {
            debug!(issuer = %order.spec.issuer_ref.name, "Issuer of Order not found");
            return Ok(None);
        };
        let Some(config) = issuer.config().acme.clone() else {
            return Err(ReconcileError::validation(format!(
                "issuer {} is not an ACME issuer",
                issuer.name()
            )));
        };
        let backend = AcmeBackend::new(self.ctx.issuer.clone(), issuer, config.clone());
        Ok(Some((config, backend.client().await?)))
    }

    async fn create(&self, order: &Order, client: &dyn AcmeClient) -> Result<Action, ReconcileError> {
        let result = client.create_order(&order.spec.dns_names).await;
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => return self.remote_failure(order, e).await,
        };
        info!(order = %order.name_any(), url = %remote.url, "Created ACME order");

        let mut status = OrderStatus {
            url: Some(remote.url.clone()),
            finalize_url: Some(remote.finalize_url.clone()),
            ..Default::default()
        };
        apply_remote(&mut status, &remote);
        self.write_status(order, status).await?;
        Ok(Action::await_change())
    }

    async fn pending(
        &self,
        order: &Order,
        config: &AcmeIssuer,
        client: &dyn AcmeClient,
        url: &str,
    ) -> Result<Action, ReconcileError> {
        let result = client.get_order(url).await;
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => return self.remote_failure(order, e).await,
        };
        if remote.status == RemoteOrderStatus::Ready && self.has_open_challenges(order) {
            debug!(order = %order.name_any(), "Waiting for open challenges before finalizing");
            return Ok(Action::await_change());
        }
        if remote.status != RemoteOrderStatus::Pending {
            return self.advance(order, client, &remote).await;
        }

        let namespace = order.namespace().unwrap_or_default();
        let mut waiting = 0usize;
        for authz in remote.authorizations.iter().filter(|a| !a.valid) {
            let Some((solver, type_)) = select_solver(&config.solvers, authz) else {
                let e = AcmeError::NoSolver {
                    domain: authz.identifier.clone(),
                };
                return self.fail(order, OrderState::Errored, e.to_string()).await;
            };
            let Some(offered) = authz.challenges.iter().find(|c| c.type_ == type_) else {
                let e = AcmeError::ChallengeUnavailable {
                    domain: authz.identifier.clone(),
                    challenge_type: type_.to_string(),
                };
                return self.fail(order, OrderState::Errored, e.to_string()).await;
            };

            let name = challenge_name(order, &authz.url, type_);
            match self.ctx.challenges.get(&ObjectKey::namespaced(&namespace, &name)) {
                None => {
                    let mut challenge = Challenge::new(
                        &name,
                        ChallengeSpec {
                            url: offered.url.clone(),
                            authz_url: authz.url.clone(),
                            dns_name: authz.identifier.clone(),
                            wildcard: authz.wildcard,
                            type_,
                            token: offered.token.clone(),
                            key: offered.key_authorization.clone(),
                            solver: solver.clone(),
                            issuer_ref: order.spec.issuer_ref.clone(),
                        },
                    );
                    challenge.metadata.namespace = Some(namespace.clone());
                    challenge.metadata.labels = Some(BTreeMap::from([(
                        ORDER_NAME_LABEL.to_string(),
                        order.name_any(),
                    )]));
                    challenge.metadata.owner_references = order.controller_owner_ref(&()).map(|r| vec![r]);
                    match self.ctx.challenges.create(&challenge).await {
                        Ok(_) => {
                            info!(challenge = %name, domain = %authz.identifier, %type_, "Created Challenge");
                        }
                        Err(e) if e.is_already_exists() => {}
                        Err(e) => return Err(e.into()),
                    }
                    waiting += 1;
                }
                Some(challenge) => match challenge.state() {
                    ChallengeState::Accepted => {}
                    ChallengeState::Rejected => {
                        let reason = challenge
                            .status
                            .and_then(|s| s.reason)
                            .unwrap_or_else(|| "challenge rejected".to_string());
                        return self
                            .fail(
                                order,
                                OrderState::Invalid,
                                format!("challenge for {} rejected: {}", authz.identifier, reason),
                            )
                            .await;
                    }
                    _ => waiting += 1,
                },
            }
        }

        let mut status = order.status.clone().unwrap_or_default();
        apply_remote(&mut status, &remote);
        self.write_status(order, status).await?;

        if waiting == 0 {
            // Every challenge accepted; the server flips the Order to ready
            // once it has validated them all.
            debug!(order = %order.name_any(), "Waiting for the server to validate authorizations");
            Ok(Action::requeue(POLL_INTERVAL))
        } else {
            Ok(Action::await_change())
        }
    }

    fn has_open_challenges(&self, order: &Order) -> bool {
        let name = order.name_any();
        self.ctx
            .challenges
            .list(order.namespace().as_deref())
            .iter()
            .filter(|c| c.labels().get(ORDER_NAME_LABEL) == Some(&name))
            .any(|c| !c.state().is_final())
    }

    async fn finalize(&self, order: &Order, client: &dyn AcmeClient, url: &str) -> Result<Action, ReconcileError> {
        let der = match parse_pem(&order.spec.csr) {
            Ok(der) => der,
            Err(e) => {
                return self
                    .fail(order, OrderState::Errored, format!("invalid CSR: {}", e))
                    .await
            }
        };
        let result = client.finalize(url, &der).await;
        match result {
            Ok(remote) => {
                info!(order = %order.name_any(), "Finalized ACME order");
                self.advance(order, client, &remote).await
            }
            Err(e) => self.remote_failure(order, e).await,
        }
    }

    async fn processing(&self, order: &Order, client: &dyn AcmeClient, url: &str) -> Result<Action, ReconcileError> {
        let result = client.get_order(url).await;
        match result {
            Ok(remote) => self.advance(order, client, &remote).await,
            Err(e) => self.remote_failure(order, e).await,
        }
    }

    /// Record what the server reports, downloading the certificate once valid
    async fn advance(
        &self,
        order: &Order,
        client: &dyn AcmeClient,
        remote: &RemoteOrder,
    ) -> Result<Action, ReconcileError> {
        let mut status = order.status.clone().unwrap_or_default();
        match remote.status {
            RemoteOrderStatus::Invalid => {
                let reason = remote.error.clone().unwrap_or_else(|| "order is invalid".to_string());
                return self.fail(order, OrderState::Invalid, reason).await;
            }
            RemoteOrderStatus::Valid => {
                let certificate = match client.certificate(&remote.url).await {
                    Ok(certificate) => certificate,
                    Err(e) => return self.remote_failure(order, e).await,
                };
                let Some(certificate) = certificate else {
                    return Ok(Action::requeue(POLL_INTERVAL));
                };
                status.certificate = Some(certificate);
                apply_remote(&mut status, remote);
                self.write_status(order, status).await?;
                info!(order = %order.name_any(), "ACME order is valid");
                return Ok(Action::await_change());
            }
            _ => apply_remote(&mut status, remote),
        }
        self.write_status(order, status).await?;
        match remote.status {
            RemoteOrderStatus::Processing => Ok(Action::requeue(POLL_INTERVAL)),
            _ => Ok(Action::await_change()),
        }
    }

    async fn remote_failure(&self, order: &Order, e: AcmeError) -> Result<Action, ReconcileError> {
        if e.is_rejection() {
            return self.fail(order, OrderState::Invalid, e.to_string()).await;
        }
        Err(IssuerError::from(e).into())
    }

    async fn fail(&self, order: &Order, state: OrderState, reason: String) -> Result<Action, ReconcileError> {
        let mut status = order.status.clone().unwrap_or_default();
        status.state = Some(state);
        status.reason = Some(reason.clone());
        status.failure_time = Some(Utc::now());
        self.write_status(order, status).await?;
        warn!(order = %order.name_any(), %state, %reason, "ACME order failed");
        self.ctx
            .events()
            .publish(
                &order.object_ref(&()),
                EventType::Warning,
                reasons::ORDER_FAILED,
                actions::SIGN,
                Some(reason),
            )
            .await;
        Ok(Action::await_change())
    }

    async fn write_status(&self, order: &Order, status: OrderStatus) -> Result<(), ReconcileError> {
        if order.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = order.clone();
        updated.status = Some(status);
        self.ctx.orders().update_status(&updated).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for OrderReconciler {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(order) = self.ctx.orders().get(key) else {
            return Ok(Action::await_change());
        };
        let state = order.state();
        if state.is_some_and(|s| s.is_final()) {
            return Ok(Action::await_change());
        }
        let Some((config, client)) = self.client(&order).await? else {
            return Ok(Action::await_change());
        };

        let url = order.status.as_ref().and_then(|s| s.url.clone());
        match (state, url) {
            (None, _) => self.create(&order, client.as_ref()).await,
            (Some(_), None) => Err(ReconcileError::internal("order has a state but no URL")),
            (Some(OrderState::Pending), Some(url)) => {
                self.pending(&order, &config, client.as_ref(), &url).await
            }
            (Some(OrderState::Ready), Some(url)) => self.finalize(&order, client.as_ref(), &url).await,
            (Some(_), Some(url)) => self.processing(&order, client.as_ref(), &url).await,
        }
    }
}

fn order_state(status: RemoteOrderStatus) -> OrderState {
    match status {
        RemoteOrderStatus::Pending => OrderState::Pending,
        RemoteOrderStatus::Ready => OrderState::Ready,
        RemoteOrderStatus::Processing => OrderState::Processing,
        RemoteOrderStatus::Valid => OrderState::Valid,
        RemoteOrderStatus::Invalid => OrderState::Invalid,
    }
}

fn apply_remote(status: &mut OrderStatus, remote: &RemoteOrder) {
    status.state = Some(order_state(remote.status));
    status.authorizations = remote
        .authorizations
        .iter()
        .map(|a| AcmeAuthorization {
            url: a.url.clone(),
            identifier: a.identifier.clone(),
            wildcard: a.wildcard,
            challenges: a
                .challenges
                .iter()
                .map(|c| AcmeChallenge {
                    url: c.url.clone(),
                    token: c.token.clone(),
                    type_: c.type_,
                })
                .collect(),
        })
        .collect();
}
