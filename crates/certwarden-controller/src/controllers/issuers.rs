//! Issuer and ClusterIssuer controllers
//!
//! Runs each issuer's backend `setup` and records the outcome in the Ready
//! condition. Requests are only signed by issuers that are Ready.

use std::sync::Arc;

use async_trait::async_trait;
use certwarden_common::crd::{
    is_condition_true, set_condition, ClusterIssuer, Condition, ConditionStatus, GenericIssuer,
    Issuer, IssuerKind, IssuerStatus, CONDITION_READY,
};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_issuer::IssuerError;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::context::ControllerContext;
use crate::error::ReconcileError;
use crate::runtime::{Action, Controller, Reconciler, StoreWatch};

/// Name of the Issuer controller
pub const ISSUERS_CONTROLLER_NAME: &str = "issuers";

/// Name of the ClusterIssuer controller
pub const CLUSTER_ISSUERS_CONTROLLER_NAME: &str = "clusterissuers";

/// Reconciles one kind of issuer
pub struct IssuerReconciler {
    ctx: ControllerContext,
    kind: IssuerKind,
}

impl IssuerReconciler {
    /// Reconciler for issuers of `kind`
    pub fn new(ctx: ControllerContext, kind: IssuerKind) -> Self {
        Self { ctx, kind }
    }

    /// Controller watching issuers of `kind` and the Secrets in their namespace
    pub fn controller(ctx: &ControllerContext, kind: IssuerKind) -> Controller {
        let reconciler = Arc::new(Self::new(ctx.clone(), kind));
        let controller = Controller::new(reconciler, ctx.workers);
        match kind {
            IssuerKind::Issuer => {
                let issuers = ctx.issuers.clone();
                controller
                    .watches(StoreWatch::primary(ctx.issuers.clone()))
                    .watches(StoreWatch::new(ctx.secrets().clone(), move |secret: &Secret| {
                        issuers
                            .list(secret.namespace().as_deref())
                            .iter()
                            .filter_map(ObjectKey::of)
                            .collect()
                    }))
            }
            IssuerKind::ClusterIssuer => {
                let cluster_issuers = ctx.cluster_issuers.clone();
                let namespace = ctx.options().cluster_resource_namespace.clone();
                controller
                    .watches(StoreWatch::primary(ctx.cluster_issuers.clone()))
                    .watches(StoreWatch::new(ctx.secrets().clone(), move |secret: &Secret| {
                        if secret.namespace().as_deref() != Some(namespace.as_str()) {
                            return Vec::new();
                        }
                        cluster_issuers.list(None).iter().filter_map(ObjectKey::of).collect()
                    }))
            }
        }
    }

    fn get(&self, key: &ObjectKey) -> Option<GenericIssuer> {
        match self.kind {
            IssuerKind::Issuer => self.ctx.issuers.get(key).map(GenericIssuer::Issuer),
            IssuerKind::ClusterIssuer => self
                .ctx
                .cluster_issuers
                .get(key)
                .map(GenericIssuer::ClusterIssuer),
        }
    }

    async fn write_status(&self, issuer: &GenericIssuer, status: IssuerStatus) -> Result<(), ReconcileError> {
        if issuer.status() == Some(&status) {
            return Ok(());
        }
        match issuer {
            GenericIssuer::Issuer(i) => {
                let updated = Issuer {
                    status: Some(status),
                    ..i.clone()
                };
                self.ctx.issuers.update_status(&updated).await?;
            }
            GenericIssuer::ClusterIssuer(i) => {
                let updated = ClusterIssuer {
                    status: Some(status),
                    ..i.clone()
                };
                self.ctx.cluster_issuers.update_status(&updated).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for IssuerReconciler {
    fn name(&self) -> &str {
        match self.kind {
            IssuerKind::Issuer => ISSUERS_CONTROLLER_NAME,
            IssuerKind::ClusterIssuer => CLUSTER_ISSUERS_CONTROLLER_NAME,
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(issuer) = self.get(key) else {
            return Ok(Action::await_change());
        };
        let was_ready = issuer
            .status()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY));

        let mut status = issuer.status().cloned().unwrap_or_default();
        let outcome = match self.ctx.backends.backend_for(&issuer) {
            Ok(backend) => backend.setup(&mut status).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                set_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::True, reasons::ISSUER_READY, "Issuer is ready"),
                );
                self.write_status(&issuer, status).await?;
                if !was_ready {
                    info!(issuer = %key, "Issuer is ready");
                    self.ctx
                        .events()
                        .publish(
                            &issuer.object_ref(),
                            EventType::Normal,
                            reasons::ISSUER_READY,
                            actions::SETUP,
                            Some("Issuer is ready".to_string()),
                        )
                        .await;
                }
                Ok(Action::await_change())
            }
            Err(e) => {
                let message = format!("Error initializing issuer: {}", e);
                set_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::False, reasons::ERR_INIT_ISSUER, message.clone()),
                );
                self.write_status(&issuer, status).await?;
                warn!(issuer = %key, error = %e, "Issuer setup failed");
                self.ctx
                    .events()
                    .publish(
                        &issuer.object_ref(),
                        EventType::Warning,
                        reasons::ERR_INIT_ISSUER,
                        actions::SETUP,
                        Some(message),
                    )
                    .await;
                match e {
                    // Fixed only by editing the issuer or its Secret, both watched.
                    IssuerError::Validation { .. } => Err(e.into()),
                    _ => Err(ReconcileError::transient(e.to_string())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{acme_cluster_issuer, TestStores};
    use certwarden_common::crd::{find_condition, CaIssuer, IssuerConfig, IssuerSpec};

    #[tokio::test]
    async fn selfsigned_cluster_issuer_becomes_ready() {
        let t = TestStores::new();
        let issuer = ClusterIssuer::new(
            "selfsigned",
            certwarden_common::crd::ClusterIssuerSpec {
                config: IssuerConfig {
                    self_signed: Some(certwarden_common::crd::SelfSignedIssuer {}),
                    ..Default::default()
                },
            },
        );
        t.cluster_issuers.create(&issuer).await.expect("create should succeed");

        let reconciler = IssuerReconciler::new(t.ctx.clone(), IssuerKind::ClusterIssuer);
        reconciler
            .reconcile(&ObjectKey::cluster("selfsigned"))
            .await
            .expect("reconcile should succeed");

        let status = t
            .cluster_issuers
            .get(&ObjectKey::cluster("selfsigned"))
            .and_then(|i| i.status)
            .expect("status should be set");
        let ready = find_condition(&status.conditions, CONDITION_READY).expect("Ready should be set");
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, reasons::ISSUER_READY);
        assert!(t.events.has_reason(reasons::ISSUER_READY));

        // Already ready: no second event
        reconciler
            .reconcile(&ObjectKey::cluster("selfsigned"))
            .await
            .expect("reconcile should succeed");
        assert_eq!(
            t.events.events().iter().filter(|e| e.reason == reasons::ISSUER_READY).count(),
            1
        );
    }

    #[tokio::test]
    async fn ca_issuer_without_secret_is_not_ready() {
        let t = TestStores::new();
        let mut issuer = Issuer::new(
            "ca",
            IssuerSpec {
                config: IssuerConfig {
                    ca: Some(CaIssuer {
                        secret_name: "root-ca".to_string(),
                    }),
                    ..Default::default()
                },
            },
        );
        issuer.metadata.namespace = Some("default".to_string());
        t.issuers.create(&issuer).await.expect("create should succeed");

        let err = IssuerReconciler::new(t.ctx.clone(), IssuerKind::Issuer)
            .reconcile(&ObjectKey::namespaced("default", "ca"))
            .await
            .expect_err("setup should fail");
        assert!(err.is_retryable());

        let status = t
            .issuers
            .get(&ObjectKey::namespaced("default", "ca"))
            .and_then(|i| i.status)
            .expect("status should be set");
        let ready = find_condition(&status.conditions, CONDITION_READY).expect("Ready should be set");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::ERR_INIT_ISSUER);
        assert!(t.events.has_reason(reasons::ERR_INIT_ISSUER));
    }

    #[tokio::test]
    async fn acme_issuer_without_reachable_server_reports_error() {
        let t = TestStores::new();
        t.cluster_issuers
            .create(&acme_cluster_issuer())
            .await
            .expect("create should succeed");

        // The test account factory cannot register anywhere.
        let result = IssuerReconciler::new(t.ctx.clone(), IssuerKind::ClusterIssuer)
            .reconcile(&ObjectKey::cluster("letsencrypt"))
            .await;
        assert!(result.is_err());
        let status = t
            .cluster_issuers
            .get(&ObjectKey::cluster("letsencrypt"))
            .and_then(|i| i.status)
            .expect("status should be set");
        assert!(status.acme.is_none());
        assert_eq!(
            find_condition(&status.conditions, CONDITION_READY).map(|c| c.reason.as_str()),
            Some(reasons::ERR_INIT_ISSUER)
        );
    }
}
