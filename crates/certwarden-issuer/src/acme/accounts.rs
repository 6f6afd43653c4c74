//! ACME account registry
//!
//! Clients are cached per issuer so the orders and challenges controllers
//! can reach the account without re-reading credentials on every pass.

use std::sync::Arc;

use async_trait::async_trait;
use certwarden_common::crd::GenericIssuer;
use dashmap::DashMap;

#[cfg(test)]
use mockall::automock;

use super::client::AcmeClient;
use super::error::AcmeError;
use super::instant::InstantAcmeClient;

/// Creates [`AcmeClient`]s for new or stored accounts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcmeClientFactory: Send + Sync {
    /// Register a new account; returns the client and serialized credentials
    async fn register(
        &self,
        server: &str,
        email: Option<String>,
    ) -> Result<(Arc<dyn AcmeClient>, String), AcmeError>;

    /// Load an account from serialized credentials
    async fn from_credentials(&self, credentials: &str) -> Result<Arc<dyn AcmeClient>, AcmeError>;
}

/// Factory backed by `instant-acme`
#[derive(Clone, Copy, Debug, Default)]
pub struct InstantAcmeClientFactory;

#[async_trait]
impl AcmeClientFactory for InstantAcmeClientFactory {
    async fn register(
        &self,
        server: &str,
        email: Option<String>,
    ) -> Result<(Arc<dyn AcmeClient>, String), AcmeError> {
        let (client, credentials) = InstantAcmeClient::register(server, email.as_deref()).await?;
        Ok((Arc::new(client), credentials))
    }

    async fn from_credentials(&self, credentials: &str) -> Result<Arc<dyn AcmeClient>, AcmeError> {
        Ok(Arc::new(InstantAcmeClient::from_credentials(credentials).await?))
    }
}

struct CachedAccount {
    server: String,
    client: Arc<dyn AcmeClient>,
}

/// Registered accounts keyed by issuer
pub struct AcmeAccounts {
    factory: Arc<dyn AcmeClientFactory>,
    accounts: DashMap<String, CachedAccount>,
}

impl AcmeAccounts {
    /// Empty registry creating clients through `factory`
    pub fn new(factory: Arc<dyn AcmeClientFactory>) -> Self {
        Self {
            factory,
            accounts: DashMap::new(),
        }
    }

    /// Factory used for registration and credential loading
    pub fn factory(&self) -> &Arc<dyn AcmeClientFactory> {
        &self.factory
    }

    /// Cached client for `issuer`, if it was registered against `server`
    pub fn get(&self, issuer: &GenericIssuer, server: &str) -> Option<Arc<dyn AcmeClient>> {
        self.accounts
            .get(&issuer_key(issuer))
            .filter(|entry| entry.server == server)
            .map(|entry| entry.client.clone())
    }

    /// Cache `client` for `issuer`, replacing any earlier account
    pub fn insert(&self, issuer: &GenericIssuer, server: &str, client: Arc<dyn AcmeClient>) {
        self.accounts.insert(
            issuer_key(issuer),
            CachedAccount {
                server: server.to_string(),
                client,
            },
        );
    }

    /// Forget the account of `issuer`
    pub fn remove(&self, issuer: &GenericIssuer) {
        self.accounts.remove(&issuer_key(issuer));
    }

    /// Number of cached accounts
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no account is cached
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Default for AcmeAccounts {
    fn default() -> Self {
        Self::new(Arc::new(InstantAcmeClientFactory))
    }
}

/// `ClusterIssuer/<name>` or `Issuer/<namespace>/<name>`
pub fn issuer_key(issuer: &GenericIssuer) -> String {
    match issuer.namespace() {
        Some(ns) => format!("{}/{}/{}", issuer.kind(), ns, issuer.name()),
        None => format!("{}/{}", issuer.kind(), issuer.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::MockAcmeClient;
    use certwarden_common::crd::{ClusterIssuer, Issuer, IssuerSpec};

    #[test]
    fn keys_separate_scopes() {
        let mut issuer = Issuer::new("le", IssuerSpec::default());
        issuer.metadata.namespace = Some("team".to_string());
        assert_eq!(issuer_key(&GenericIssuer::Issuer(issuer)), "Issuer/team/le");
        assert_eq!(
            issuer_key(&GenericIssuer::ClusterIssuer(ClusterIssuer::new(
                "le",
                Default::default()
            ))),
            "ClusterIssuer/le"
        );
    }

    #[test]
    fn cached_client_is_bound_to_its_server() {
        let accounts = AcmeAccounts::new(Arc::new(MockAcmeClientFactory::new()));
        let issuer =
            GenericIssuer::ClusterIssuer(ClusterIssuer::new("le", Default::default()));

        accounts.insert(&issuer, "https://acme.test/dir", Arc::new(MockAcmeClient::new()));
        assert!(accounts.get(&issuer, "https://acme.test/dir").is_some());
        assert!(accounts.get(&issuer, "https://other.test/dir").is_none());

        accounts.remove(&issuer);
        assert!(accounts.is_empty());
    }
}
