//! ACME Challenge controller
//!
//! Presents the proof, checks it is visible, asks the server to validate it
//! and removes it again once the server has decided. The state never moves
//! backwards; every transition goes through [`ChallengeStatus::advance`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::crd::{Challenge, ChallengeState, ChallengeStatus, ChallengeType, Order};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_issuer::acme::{AcmeBackend, AcmeClient, AcmeError, RemoteChallengeStatus};
use certwarden_issuer::IssuerError;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::ORDER_NAME_LABEL;
use crate::context::ControllerContext;
use crate::error::ReconcileError;
use crate::runtime::{Action, Controller, Reconciler, StoreWatch};

/// Controller name
pub const CONTROLLER_NAME: &str = "challenges";

/// Delay before re-running a failed self-check
pub const SELF_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Delay between polls of the server's validation
pub const VALIDATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reconciles ACME Challenges
pub struct ChallengeReconciler {
    ctx: ControllerContext,
}

impl ChallengeReconciler {
    /// Reconciler over `ctx`
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Controller watching Challenges and the Orders they belong to
    pub fn controller(ctx: &ControllerContext) -> Controller {
        let challenges = ctx.challenges.clone();
        Controller::new(Arc::new(Self::new(ctx.clone())), ctx.workers)
            .watches(StoreWatch::primary(ctx.challenges.clone()))
            .watches(StoreWatch::new(ctx.orders().clone(), move |order: &Order| {
                let name = order.name_any();
                challenges
                    .list(order.namespace().as_deref())
                    .iter()
                    .filter(|c| c.labels().get(ORDER_NAME_LABEL) == Some(&name))
                    .filter_map(ObjectKey::of)
                    .collect()
            }))
    }

    fn order(&self, challenge: &Challenge) -> Option<Order> {
        let namespace = challenge.namespace()?;
        let name = challenge.labels().get(ORDER_NAME_LABEL)?;
        self.ctx.orders().get(&ObjectKey::namespaced(namespace, name))
    }

    /// Namespace holding the issuer's Secrets, if the issuer still exists
    fn resource_namespace(&self, challenge: &Challenge) -> Option<String> {
        self.ctx
            .get_issuer(challenge.namespace().as_deref(), &challenge.spec.issuer_ref)
            .map(|issuer| self.ctx.options().resource_namespace(&issuer))
    }

    async fn client(&self, challenge: &Challenge) -> Result<Option<Arc<dyn AcmeClient>>, ReconcileError> {
        let Some(issuer) = self
            .ctx
            .get_issuer(challenge.namespace().as_deref(), &challenge.spec.issuer_ref)
        else {
            return Ok(None);
        };
        let Some(config) = issuer.config().acme.clone() else {
            return Err(ReconcileError::validation(format!(
                "issuer {} is not an ACME issuer",
                issuer.name()
            )));
        };
        let client = AcmeBackend::new(self.ctx.issuer.clone(), issuer, config).client().await?;
        Ok(Some(client))
    }

    async fn present(&self, challenge: &Challenge, status: &mut ChallengeStatus) -> Result<Action, ReconcileError> {
        let Some(namespace) = self.resource_namespace(challenge) else {
            debug!(challenge = %challenge.name_any(), "Issuer of Challenge not found");
            return Ok(Action::await_change());
        };
        self.ctx
            .solver
            .present(challenge, &namespace)
            .await
            .map_err(acme_error)?;
        advance(status, ChallengeState::Presented)?;
        status.presented = true;
        self.write_status(challenge, status.clone()).await?;
        info!(
            challenge = %challenge.name_any(),
            domain = %challenge.spec.dns_name,
            type_ = %challenge.spec.type_,
            "Presented challenge"
        );
        self.event(
            challenge,
            EventType::Normal,
            reasons::PRESENTED,
            format!("Presented {} challenge for {}", challenge.spec.type_, challenge.spec.dns_name),
        )
        .await;
        Ok(Action::await_change())
    }

    async fn self_check(
        &self,
        challenge: &Challenge,
        status: &mut ChallengeStatus,
    ) -> Result<Action, ReconcileError> {
        // The responder is in memory; a restart loses what was presented.
        let spec = &challenge.spec;
        if spec.type_ == ChallengeType::Http01
            && self.ctx.solver.http01().key_authorization(&spec.token).is_none()
        {
            self.ctx.solver.http01().present(&spec.token, &spec.key);
        }

        let passed = match self.ctx.solver.check(challenge).await {
            Ok(passed) => passed,
            Err(e) => {
                debug!(challenge = %challenge.name_any(), error = %e, "Self-check errored");
                false
            }
        };
        if !passed {
            self.event(
                challenge,
                EventType::Warning,
                reasons::SELF_CHECK_FAILED,
                format!("Proof for {} is not visible yet", spec.dns_name),
            )
            .await;
            return Ok(Action::requeue(SELF_CHECK_INTERVAL));
        }

        advance(status, ChallengeState::SelfChecked)?;
        self.write_status(challenge, status.clone()).await?;
        debug!(challenge = %challenge.name_any(), "Self-check passed");
        Ok(Action::await_change())
    }

    async fn validate(
        &self,
        challenge: &Challenge,
        order: &Order,
        status: &mut ChallengeStatus,
    ) -> Result<Action, ReconcileError> {
        let Some(order_url) = order.status.as_ref().and_then(|s| s.url.clone()) else {
            return Ok(Action::await_change());
        };
        let Some(client) = self.client(challenge).await? else {
            return Ok(Action::await_change());
        };

        let (remote, detail) = client
            .challenge_status(&order_url, &challenge.spec.url)
            .await
            .map_err(acme_error)?;
        match remote {
            RemoteChallengeStatus::Pending => {
                client
                    .accept_challenge(&order_url, &challenge.spec.url)
                    .await
                    .map_err(acme_error)?;
                debug!(challenge = %challenge.name_any(), "Asked server to validate challenge");
                Ok(Action::requeue(VALIDATION_POLL_INTERVAL))
            }
            RemoteChallengeStatus::Processing => Ok(Action::requeue(VALIDATION_POLL_INTERVAL)),
            RemoteChallengeStatus::Valid => {
                advance(status, ChallengeState::Accepted)?;
                self.cleanup(challenge, status).await?;
                self.write_status(challenge, status.clone()).await?;
                info!(challenge = %challenge.name_any(), domain = %challenge.spec.dns_name, "Challenge accepted");
                self.event(
                    challenge,
                    EventType::Normal,
                    reasons::CHALLENGE_ACCEPTED,
                    format!("Challenge for {} accepted", challenge.spec.dns_name),
                )
                .await;
                Ok(Action::await_change())
            }
            RemoteChallengeStatus::Invalid => {
                let reason = detail.unwrap_or_else(|| "challenge is invalid".to_string());
                self.reject(challenge, status, reason).await
            }
        }
    }

    async fn reject(
        &self,
        challenge: &Challenge,
        status: &mut ChallengeStatus,
        reason: String,
    ) -> Result<Action, ReconcileError> {
        advance(status, ChallengeState::Rejected)?;
        status.reason = Some(reason.clone());
        self.cleanup(challenge, status).await?;
        self.write_status(challenge, status.clone()).await?;
        warn!(challenge = %challenge.name_any(), %reason, "Challenge rejected");
        self.event(challenge, EventType::Warning, reasons::CHALLENGE_REJECTED, reason)
            .await;
        Ok(Action::await_change())
    }

    /// Remove a presented proof, leaving `presented` false once gone
    async fn cleanup(&self, challenge: &Challenge, status: &mut ChallengeStatus) -> Result<(), ReconcileError> {
        if !status.presented {
            return Ok(());
        }
        // Without the issuer there is no webhook credential to clean up with.
        let namespace = self
            .resource_namespace(challenge)
            .unwrap_or_else(|| self.ctx.options().cluster_resource_namespace.clone());
        self.ctx
            .solver
            .cleanup(challenge, &namespace)
            .await
            .map_err(acme_error)?;
        status.presented = false;
        Ok(())
    }

    async fn write_status(&self, challenge: &Challenge, status: ChallengeStatus) -> Result<(), ReconcileError> {
        if challenge.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = challenge.clone();
        updated.status = Some(status);
        self.ctx.challenges.update_status(&updated).await?;
        Ok(())
    }

    async fn event(&self, challenge: &Challenge, type_: EventType, reason: &str, note: String) {
        self.ctx
            .events()
            .publish(
                &challenge.object_ref(&()),
                type_,
                reason,
                actions::PRESENT,
                Some(note),
            )
            .await;
    }
}

#[async_trait]
impl Reconciler for ChallengeReconciler {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(challenge) = self.ctx.challenges.get(key) else {
            return Ok(Action::await_change());
        };
        let mut status = challenge.status.clone().unwrap_or_default();

        if status.state.is_final() {
            // Cleanup failed on an earlier pass.
            if status.presented {
                self.cleanup(&challenge, &mut status).await?;
                self.write_status(&challenge, status).await?;
            }
            return Ok(Action::await_change());
        }

        let order = match self.order(&challenge) {
            Some(order) if !order.state().is_some_and(|s| s.is_failure()) => order,
            Some(order) => {
                let reason = format!(
                    "order {} failed: {}",
                    order.name_any(),
                    order.status.and_then(|s| s.reason).unwrap_or_default()
                );
                return self.reject(&challenge, &mut status, reason).await;
            }
            None => {
                return self
                    .reject(&challenge, &mut status, "order no longer exists".to_string())
                    .await
            }
        };

        match status.state {
            ChallengeState::Pending => self.present(&challenge, &mut status).await,
            ChallengeState::Presented => self.self_check(&challenge, &mut status).await,
            ChallengeState::SelfChecked => self.validate(&challenge, &order, &mut status).await,
            ChallengeState::Accepted | ChallengeState::Rejected => Ok(Action::await_change()),
        }
    }
}

fn advance(status: &mut ChallengeStatus, next: ChallengeState) -> Result<(), ReconcileError> {
    status
        .advance(next)
        .map_err(|e| ReconcileError::internal(e.to_string()))
}

fn acme_error(e: AcmeError) -> ReconcileError {
    IssuerError::from(e).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{
        acme_cluster_issuer, ready_issuer_status, FakeAcmeClient, TestStores, ACME_SERVER,
    };
    use certwarden_common::crd::{
        AcmeSolver, ChallengeSpec, GenericIssuer, Http01Solver, IssuerKind, IssuerRef, OrderSpec,
        OrderState, OrderStatus,
    };
    use std::collections::BTreeMap;

    const ORDER_URL: &str = "https://acme.test/order/1";

    async fn setup() -> (TestStores, ChallengeReconciler, Arc<FakeAcmeClient>) {
        let t = TestStores::new();
        let mut issuer = acme_cluster_issuer();
        issuer.status = Some(ready_issuer_status());
        t.cluster_issuers.create(&issuer).await.expect("issuer create should succeed");

        let client = Arc::new(FakeAcmeClient::default());
        t.ctx
            .issuer
            .accounts
            .insert(&GenericIssuer::ClusterIssuer(issuer), ACME_SERVER, client.clone());

        let issuer_ref = IssuerRef {
            name: "letsencrypt".to_string(),
            kind: IssuerKind::ClusterIssuer,
        };
        let mut order = Order::new(
            "web-1-42",
            OrderSpec {
                csr: String::new(),
                issuer_ref: issuer_ref.clone(),
                common_name: None,
                dns_names: vec!["web.example.com".to_string()],
            },
        );
        order.metadata.namespace = Some("default".to_string());
        order.status = Some(OrderStatus {
            url: Some(ORDER_URL.to_string()),
            state: Some(OrderState::Pending),
            ..Default::default()
        });
        t.orders.create(&order).await.expect("order create should succeed");

        let mut challenge = Challenge::new(
            "web-1-42-7",
            ChallengeSpec {
                url: "https://acme.test/chall/1".to_string(),
                authz_url: "https://acme.test/authz/1".to_string(),
                dns_name: "web.example.com".to_string(),
                wildcard: false,
                type_: ChallengeType::Http01,
                token: "tok".to_string(),
                key: "tok.thumb".to_string(),
                solver: AcmeSolver {
                    selector: None,
                    http01: Some(Http01Solver {
                        self_check_base_url: None,
                    }),
                    dns01: None,
                },
                issuer_ref,
            },
        );
        challenge.metadata.namespace = Some("default".to_string());
        challenge.metadata.labels = Some(BTreeMap::from([(
            ORDER_NAME_LABEL.to_string(),
            "web-1-42".to_string(),
        )]));
        t.challenges.create(&challenge).await.expect("challenge create should succeed");

        let reconciler = ChallengeReconciler::new(t.ctx.clone());
        (t, reconciler, client)
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "web-1-42-7")
    }

    fn status(t: &TestStores) -> ChallengeStatus {
        t.challenges
            .get(&key())
            .and_then(|c| c.status)
            .unwrap_or_default()
    }

    // =========================================================================
    // Story: an HTTP-01 challenge is presented, checked and accepted
    // =========================================================================

    #[tokio::test]
    async fn challenge_walks_to_accepted() {
        let (t, reconciler, client) = setup().await;
        client.state.lock().challenge_statuses =
            vec![RemoteChallengeStatus::Pending, RemoteChallengeStatus::Valid].into();
        let responder = t.ctx.solver.http01();

        // Chapter 1: the proof is served by the responder
        reconciler.reconcile(&key()).await.expect("present should succeed");
        assert_eq!(status(&t).state, ChallengeState::Presented);
        assert!(status(&t).presented);
        assert_eq!(responder.key_authorization("tok").as_deref(), Some("tok.thumb"));
        assert!(t.events.has_reason(reasons::PRESENTED));

        // Chapter 2: self-check passes
        reconciler.reconcile(&key()).await.expect("self-check should succeed");
        assert_eq!(status(&t).state, ChallengeState::SelfChecked);

        // Chapter 3: the server is asked to validate
        let action = reconciler.reconcile(&key()).await.expect("accept should succeed");
        assert_eq!(action.requeue_after(), Some(VALIDATION_POLL_INTERVAL));
        assert_eq!(client.state.lock().accepted, vec!["https://acme.test/chall/1".to_string()]);

        // Chapter 4: validation succeeds and the proof is removed
        reconciler.reconcile(&key()).await.expect("validation should succeed");
        let final_status = status(&t);
        assert_eq!(final_status.state, ChallengeState::Accepted);
        assert!(!final_status.presented);
        assert!(responder.key_authorization("tok").is_none());
        assert!(t.events.has_reason(reasons::CHALLENGE_ACCEPTED));
    }

    #[tokio::test]
    async fn failed_self_check_is_retried() {
        let (t, reconciler, _) = setup().await;
        t.checker.results.lock().push_back(false);

        reconciler.reconcile(&key()).await.expect("present should succeed");
        let action = reconciler.reconcile(&key()).await.expect("self-check should not error");
        assert_eq!(action.requeue_after(), Some(SELF_CHECK_INTERVAL));
        assert_eq!(status(&t).state, ChallengeState::Presented);
        assert!(t.events.has_reason(reasons::SELF_CHECK_FAILED));

        reconciler.reconcile(&key()).await.expect("self-check should succeed");
        assert_eq!(status(&t).state, ChallengeState::SelfChecked);
    }

    #[tokio::test]
    async fn invalid_challenge_is_rejected_and_cleaned_up() {
        let (t, reconciler, client) = setup().await;
        client.state.lock().challenge_statuses = vec![RemoteChallengeStatus::Invalid].into();

        reconciler.reconcile(&key()).await.expect("present should succeed");
        reconciler.reconcile(&key()).await.expect("self-check should succeed");
        reconciler.reconcile(&key()).await.expect("validation should succeed");

        let final_status = status(&t);
        assert_eq!(final_status.state, ChallengeState::Rejected);
        assert!(final_status.reason.unwrap_or_default().contains("unauthorized"));
        assert!(!final_status.presented);
        assert!(t.ctx.solver.http01().is_empty());
        assert!(t.events.has_reason(reasons::CHALLENGE_REJECTED));

        // Final states never move again
        reconciler.reconcile(&key()).await.expect("reconcile should succeed");
        assert_eq!(status(&t).state, ChallengeState::Rejected);
    }

    #[tokio::test]
    async fn failed_order_rejects_open_challenge() {
        let (t, reconciler, _) = setup().await;
        reconciler.reconcile(&key()).await.expect("present should succeed");

        let mut order = t
            .orders
            .get(&ObjectKey::namespaced("default", "web-1-42"))
            .expect("order should exist");
        if let Some(s) = order.status.as_mut() {
            s.state = Some(OrderState::Invalid);
            s.reason = Some("rateLimited".to_string());
        }
        t.orders.update_status(&order).await.expect("status update should succeed");

        reconciler.reconcile(&key()).await.expect("reconcile should succeed");
        let final_status = status(&t);
        assert_eq!(final_status.state, ChallengeState::Rejected);
        assert!(final_status.reason.unwrap_or_default().contains("rateLimited"));
        assert!(t.ctx.solver.http01().is_empty());
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut status = ChallengeStatus::default();
        advance(&mut status, ChallengeState::Presented).expect("pending to presented");
        assert!(advance(&mut status, ChallengeState::Pending).is_err());
        advance(&mut status, ChallengeState::Accepted).expect("presented to accepted");
        assert!(advance(&mut status, ChallengeState::Rejected).is_err());
        assert_eq!(status.state, ChallengeState::Accepted);
    }
}
