//! ACME issuer
//!
//! The backend itself only registers the account and owns the Order for a
//! request. Driving the Order and its Challenges through the protocol is the
//! job of the orders and challenges controllers, which resume from the state
//! persisted in those resources. `sign` reports `Pending` until the Order
//! reaches a final state.

mod accounts;
mod client;
mod error;
mod instant;
mod selfcheck;
mod solver;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use certwarden_common::crd::{
    AcmeIssuer, AcmeIssuerStatus, CertificateRequest, GenericIssuer, IssuerStatus, Order,
    OrderSpec, OrderState,
};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::ObjectKey;
use certwarden_pki::CsrInfo;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub use accounts::{issuer_key, AcmeAccounts, AcmeClientFactory, InstantAcmeClientFactory};
pub use client::{
    AcmeClient, RemoteAuthorization, RemoteChallenge, RemoteChallengeStatus, RemoteOrder,
    RemoteOrderStatus,
};
pub use error::AcmeError;
pub use instant::InstantAcmeClient;
pub use selfcheck::{NetworkSelfChecker, SelfChecker};
pub use solver::{
    challenge_record_fqdn, dns01_record_value, ChallengeSolver, DnsProvider, Http01Responder,
    WebhookDnsProvider, ACME_CHALLENGE_RECORD, HTTP01_PATH_PREFIX,
};

#[cfg(test)]
pub use accounts::MockAcmeClientFactory;
#[cfg(test)]
pub use client::MockAcmeClient;

use crate::context::IssuerContext;
use crate::error::IssuerError;
use crate::secrets::value_of;
use crate::{IssueResponse, IssuerBackend};

/// Secret key holding the account credentials when the selector names none
pub const ACCOUNT_CREDENTIALS_KEY: &str = "credentials";

/// Backend for one ACME issuer
pub struct AcmeBackend {
    ctx: IssuerContext,
    issuer: GenericIssuer,
    config: AcmeIssuer,
}

impl AcmeBackend {
    /// Backend for `issuer` configured with `config`
    pub fn new(ctx: IssuerContext, issuer: GenericIssuer, config: AcmeIssuer) -> Self {
        Self {
            ctx,
            issuer,
            config,
        }
    }

    /// Issuer configuration
    pub fn config(&self) -> &AcmeIssuer {
        &self.config
    }

    fn credentials_secret(&self) -> ObjectKey {
        ObjectKey::namespaced(
            self.ctx.options.resource_namespace(&self.issuer),
            &self.config.private_key_secret_ref.name,
        )
    }

    fn credentials_key(&self) -> &str {
        self.config
            .private_key_secret_ref
            .key_or(ACCOUNT_CREDENTIALS_KEY)
    }

    fn stored_credentials(&self) -> Result<Option<String>, IssuerError> {
        let key = self.credentials_secret();
        let Some(secret) = self.ctx.secrets.get(&key) else {
            return Ok(None);
        };
        value_of(&secret, self.credentials_key())
            .map(Some)
            .ok_or_else(|| {
                IssuerError::validation(format!(
                    "secret {} has no key '{}'",
                    key,
                    self.credentials_key()
                ))
            })
    }

    /// Client for the issuer's account, loading stored credentials on first use
    ///
    /// Never registers; an issuer without an account fails with a transient
    /// error until the issuer controller has set it up.
    pub async fn client(&self) -> Result<Arc<dyn AcmeClient>, IssuerError> {
        if let Some(client) = self.ctx.accounts.get(&self.issuer, &self.config.server) {
            return Ok(client);
        }
        let Some(credentials) = self.stored_credentials()? else {
            return Err(AcmeError::NoAccount {
                issuer: issuer_key(&self.issuer),
            }
            .into());
        };
        let client = self
            .ctx
            .accounts
            .factory()
            .from_credentials(&credentials)
            .await?;
        self.ctx
            .accounts
            .insert(&self.issuer, &self.config.server, client.clone());
        Ok(client)
    }

    async fn register(&self) -> Result<Arc<dyn AcmeClient>, IssuerError> {
        let (client, credentials) = self
            .ctx
            .accounts
            .factory()
            .register(&self.config.server, self.config.email.clone())
            .await?;

        let key = self.credentials_secret();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                self.credentials_key().to_string(),
                ByteString(credentials.into_bytes()),
            )])),
            ..Default::default()
        };
        match self.ctx.secrets.create(&secret).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                // Someone else stored credentials first; use theirs next pass.
                return Err(IssuerError::transient(format!(
                    "account secret {} appeared during registration",
                    key
                )));
            }
            Err(e) => return Err(e.into()),
        }
        info!(issuer = %issuer_key(&self.issuer), account = %client.account_url(), "Registered ACME account");
        Ok(client)
    }

    /// Name of the Order serving `request`
    ///
    /// Derived from the CSR and issuer, so a changed request gets a new Order.
    pub fn order_name(request: &CertificateRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.spec.csr.as_bytes());
        hasher.update(request.spec.issuer_ref.kind.to_string().as_bytes());
        hasher.update(request.spec.issuer_ref.name.as_bytes());
        let digest = hasher.finalize();
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        format!("{}-{}", request.name_any(), hash)
    }

    fn build_order(&self, request: &CertificateRequest, name: &str, csr: &CsrInfo) -> Order {
        let mut order = Order::new(
            name,
            OrderSpec {
                csr: request.spec.csr.clone(),
                issuer_ref: request.spec.issuer_ref.clone(),
                common_name: csr.common_name.clone(),
                dns_names: csr.identifiers(),
            },
        );
        order.metadata.namespace = request.namespace();
        order.metadata.labels = Some(request.labels().clone()).filter(|l| !l.is_empty());
        order.metadata.owner_references = request.controller_owner_ref(&()).map(|r| vec![r]);
        order
    }

    async fn fail(&self, request: &CertificateRequest, reason: &str, message: String) {
        self.ctx
            .request_event(request, EventType::Warning, reason, actions::SIGN, message)
            .await;
    }
}

#[async_trait]
impl IssuerBackend for AcmeBackend {
    async fn setup(&self, status: &mut IssuerStatus) -> Result<(), IssuerError> {
        if self.config.server.is_empty() {
            return Err(IssuerError::validation("acme.server must be set"));
        }
        if self.config.private_key_secret_ref.name.is_empty() {
            return Err(IssuerError::validation(
                "acme.privateKeySecretRef.name must be set",
            ));
        }

        let client = match self.ctx.accounts.get(&self.issuer, &self.config.server) {
            Some(client) => client,
            None => {
                let client = match self.stored_credentials()? {
                    Some(credentials) => {
                        debug!(issuer = %issuer_key(&self.issuer), "Loading stored ACME account");
                        self.ctx
                            .accounts
                            .factory()
                            .from_credentials(&credentials)
                            .await?
                    }
                    None => self.register().await?,
                };
                self.ctx
                    .accounts
                    .insert(&self.issuer, &self.config.server, client.clone());
                client
            }
        };

        status.acme = Some(AcmeIssuerStatus {
            uri: Some(client.account_url()),
            last_registered_email: self.config.email.clone(),
        });
        Ok(())
    }

    async fn sign(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<IssueResponse>, IssuerError> {
        let csr = match CsrInfo::from_pem(&request.spec.csr) {
            Ok(csr) => csr,
            Err(e) => {
                self.fail(request, reasons::FAILED, format!("invalid CSR: {}", e))
                    .await;
                return Ok(None);
            }
        };
        if !csr.ip_addresses.is_empty() {
            self.fail(
                request,
                reasons::FAILED,
                "ACME certificates cannot contain IP addresses".to_string(),
            )
            .await;
            return Ok(None);
        }
        if csr.identifiers().is_empty() {
            self.fail(
                request,
                reasons::FAILED,
                "CSR names no DNS identifiers".to_string(),
            )
            .await;
            return Ok(None);
        }

        let name = Self::order_name(request);
        let key = ObjectKey::namespaced(request.namespace().unwrap_or_default(), &name);
        let Some(order) = self.ctx.orders.get(&key) else {
            let order = self.build_order(request, &name, &csr);
            match self.ctx.orders.create(&order).await {
                Ok(_) => {
                    self.ctx
                        .request_event(
                            request,
                            EventType::Normal,
                            reasons::ORDER_CREATED,
                            actions::SIGN,
                            format!("Created Order {}", name),
                        )
                        .await;
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
            return Err(IssuerError::pending(format!("order {} created", key)));
        };

        match order.state() {
            Some(OrderState::Valid) => {
                match order.status.and_then(|s| s.certificate) {
                    Some(certificate) => Ok(Some(IssueResponse {
                        certificate,
                        ca: None,
                    })),
                    None => Err(IssuerError::pending(format!(
                        "order {} is valid but has no certificate yet",
                        key
                    ))),
                }
            }
            Some(state) if state.is_failure() => {
                let reason = order
                    .status
                    .as_ref()
                    .and_then(|s| s.reason.clone())
                    .unwrap_or_else(|| state.to_string());
                self.fail(
                    request,
                    reasons::ORDER_FAILED,
                    format!("Order {} failed: {}", name, reason),
                )
                .await;
                Ok(None)
            }
            state => Err(IssuerError::pending(format!(
                "order {} is {}",
                key,
                state.map(|s| s.to_string()).unwrap_or_else(|| "new".to_string())
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{key_and_csr, request, secret, TestContext};
    use certwarden_common::crd::{
        ClusterIssuer, ClusterIssuerSpec, IssuerConfig, IssuerKind, IssuerRef, OrderStatus,
        SecretKeySelector,
    };
    use certwarden_common::store::ResourceStore;

    const SERVER: &str = "https://acme.test/directory";

    fn acme_config() -> AcmeIssuer {
        AcmeIssuer {
            server: SERVER.to_string(),
            email: Some("ops@example.com".to_string()),
            private_key_secret_ref: SecretKeySelector {
                name: "le-account".to_string(),
                key: None,
            },
            solvers: vec![],
        }
    }

    fn issuer() -> GenericIssuer {
        GenericIssuer::ClusterIssuer(ClusterIssuer::new(
            "letsencrypt",
            ClusterIssuerSpec {
                config: IssuerConfig {
                    acme: Some(acme_config()),
                    ..Default::default()
                },
            },
        ))
    }

    fn issuer_ref() -> IssuerRef {
        IssuerRef {
            name: "letsencrypt".to_string(),
            kind: IssuerKind::ClusterIssuer,
        }
    }

    fn client(account: &'static str) -> Arc<dyn AcmeClient> {
        let mut client = MockAcmeClient::new();
        client
            .expect_account_url()
            .return_const(account.to_string());
        Arc::new(client)
    }

    // =========================================================================
    // Story: a fresh issuer registers an account and keeps the credentials
    // =========================================================================

    #[tokio::test]
    async fn setup_registers_and_stores_credentials() {
        let mut factory = MockAcmeClientFactory::new();
        factory
            .expect_register()
            .withf(|server, email| server == SERVER && email.as_deref() == Some("ops@example.com"))
            .times(1)
            .returning(|_, _| Ok((client("https://acme.test/acct/1"), "{\"id\":1}".to_string())));
        factory.expect_from_credentials().times(0);
        let t = TestContext::with_acme(Arc::new(factory));
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());

        let mut status = IssuerStatus::default();
        backend
            .setup(&mut status)
            .await
            .expect("setup should succeed");

        let acme = status.acme.expect("acme status should be set");
        assert_eq!(acme.uri.as_deref(), Some("https://acme.test/acct/1"));
        assert_eq!(acme.last_registered_email.as_deref(), Some("ops@example.com"));

        let stored = t
            .secrets
            .get(&ObjectKey::namespaced("certwarden", "le-account"))
            .expect("credentials secret should exist");
        assert_eq!(
            value_of(&stored, ACCOUNT_CREDENTIALS_KEY).as_deref(),
            Some("{\"id\":1}")
        );

        // Chapter 2: a second setup reuses the cached client
        backend
            .setup(&mut IssuerStatus::default())
            .await
            .expect("second setup should succeed");
    }

    #[tokio::test]
    async fn setup_loads_stored_account() {
        let mut factory = MockAcmeClientFactory::new();
        factory.expect_register().times(0);
        factory
            .expect_from_credentials()
            .withf(|creds| creds == "{\"id\":7}")
            .times(1)
            .returning(|_| Ok(client("https://acme.test/acct/7")));
        let t = TestContext::with_acme(Arc::new(factory));
        t.secrets
            .create(&secret(
                "certwarden",
                "le-account",
                &[(ACCOUNT_CREDENTIALS_KEY, "{\"id\":7}")],
            ))
            .await
            .expect("secret create should succeed");
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());

        let mut status = IssuerStatus::default();
        backend
            .setup(&mut status)
            .await
            .expect("setup should succeed");
        assert_eq!(
            status.acme.and_then(|a| a.uri).as_deref(),
            Some("https://acme.test/acct/7")
        );
        assert!(backend.client().await.is_ok());
    }

    #[tokio::test]
    async fn rejected_registration_is_not_retried() {
        let mut factory = MockAcmeClientFactory::new();
        factory.expect_register().returning(|_, _| {
            Err(AcmeError::Rejected {
                detail: "invalid contact".to_string(),
            })
        });
        let t = TestContext::with_acme(Arc::new(factory));
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());

        let err = backend
            .setup(&mut IssuerStatus::default())
            .await
            .expect_err("setup should fail");
        assert!(matches!(err, IssuerError::Validation { .. }));
    }

    #[tokio::test]
    async fn client_without_account_is_transient() {
        let t = TestContext::new();
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());
        let err = backend.client().await.err().expect("should fail");
        assert!(err.is_retryable());
    }

    // =========================================================================
    // Story: a request waits on its Order and collects the certificate
    // =========================================================================

    #[tokio::test]
    async fn sign_creates_order_then_returns_certificate() {
        let t = TestContext::new();
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());
        let (_, csr) = key_and_csr(&["web.example.com"]);
        let cr = request("default", "web-1", csr, issuer_ref());

        // Chapter 1: first pass creates the Order and waits
        let err = backend.sign(&cr).await.err().expect("should be pending");
        assert!(err.is_pending());
        let key = ObjectKey::namespaced("default", AcmeBackend::order_name(&cr));
        let order = t.orders.get(&key).expect("order should exist");
        assert_eq!(order.spec.dns_names, vec!["web.example.com"]);
        assert!(t.events.has_reason(reasons::ORDER_CREATED));

        // Chapter 2: still pending while the Order is in flight
        let mut in_flight = order.clone();
        in_flight.status = Some(OrderStatus {
            state: Some(OrderState::Pending),
            ..Default::default()
        });
        t.orders
            .update_status(&in_flight)
            .await
            .expect("status update should succeed");
        assert!(backend.sign(&cr).await.err().expect("pending").is_pending());

        // Chapter 3: a valid Order hands over its certificate
        let mut valid = t.orders.get(&key).expect("order should exist");
        valid.status = Some(OrderStatus {
            state: Some(OrderState::Valid),
            certificate: Some("CERT".to_string()),
            ..Default::default()
        });
        t.orders
            .update_status(&valid)
            .await
            .expect("status update should succeed");
        let response = backend
            .sign(&cr)
            .await
            .expect("sign should succeed")
            .expect("should be issued");
        assert_eq!(response.certificate, "CERT");
    }

    #[tokio::test]
    async fn invalid_order_fails_request_permanently() {
        let t = TestContext::new();
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());
        let (_, csr) = key_and_csr(&["web.example.com"]);
        let cr = request("default", "web-1", csr, issuer_ref());

        let mut order = backend.build_order(
            &cr,
            &AcmeBackend::order_name(&cr),
            &CsrInfo::from_pem(&cr.spec.csr).expect("csr should parse"),
        );
        order.status = Some(OrderStatus {
            state: Some(OrderState::Invalid),
            reason: Some("challenge rejected".to_string()),
            ..Default::default()
        });
        t.orders
            .create(&order)
            .await
            .expect("order create should succeed");

        assert!(backend.sign(&cr).await.expect("sign should succeed").is_none());
        let events = t.events.events();
        assert!(events
            .iter()
            .any(|e| e.reason == reasons::ORDER_FAILED
                && e.note.as_deref().is_some_and(|n| n.contains("challenge rejected"))));
    }

    #[tokio::test]
    async fn garbage_csr_fails_permanently() {
        let t = TestContext::new();
        let backend = AcmeBackend::new(t.ctx.clone(), issuer(), acme_config());
        let cr = request("default", "web-1", "not a csr".to_string(), issuer_ref());
        assert!(backend.sign(&cr).await.expect("sign should succeed").is_none());
        assert!(t.orders.is_empty());
    }

    #[test]
    fn order_name_tracks_csr() {
        let (_, csr_a) = key_and_csr(&["a.example.com"]);
        let (_, csr_b) = key_and_csr(&["a.example.com"]);
        let a = request("default", "web-1", csr_a, issuer_ref());
        let b = request("default", "web-1", csr_b, issuer_ref());
        assert!(AcmeBackend::order_name(&a).starts_with("web-1-"));
        assert_eq!(AcmeBackend::order_name(&a), AcmeBackend::order_name(&a));
        assert_ne!(AcmeBackend::order_name(&a), AcmeBackend::order_name(&b));
    }
}
