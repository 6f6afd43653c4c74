//! Watch-fed stores for every kind the controllers read

use std::sync::Arc;

use certwarden_common::crd::{
    Certificate, CertificateRequest, Challenge, ClusterIssuer, Issuer, Order,
};
use certwarden_common::store::{KubeStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One [`KubeStore`] per watched kind
#[derive(Clone)]
pub struct KubeStores {
    pub certificates: Arc<KubeStore<Certificate>>,
    pub requests: Arc<KubeStore<CertificateRequest>>,
    pub issuers: Arc<KubeStore<Issuer>>,
    pub cluster_issuers: Arc<KubeStore<ClusterIssuer>>,
    pub orders: Arc<KubeStore<Order>>,
    pub challenges: Arc<KubeStore<Challenge>>,
    pub secrets: Arc<KubeStore<Secret>>,
}

impl KubeStores {
    pub fn new(client: Client) -> Self {
        Self {
            certificates: Arc::new(KubeStore::namespaced(client.clone())),
            requests: Arc::new(KubeStore::namespaced(client.clone())),
            issuers: Arc::new(KubeStore::namespaced(client.clone())),
            cluster_issuers: Arc::new(KubeStore::cluster(client.clone())),
            orders: Arc::new(KubeStore::namespaced(client.clone())),
            challenges: Arc::new(KubeStore::namespaced(client.clone())),
            secrets: Arc::new(KubeStore::namespaced(client)),
        }
    }

    /// Start one watch task per kind
    pub fn spawn_watches(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        macro_rules! watch {
            ($store:expr) => {{
                let store = $store.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { store.run_watch(shutdown).await })
            }};
        }
        vec![
            watch!(self.certificates),
            watch!(self.requests),
            watch!(self.issuers),
            watch!(self.cluster_issuers),
            watch!(self.orders),
            watch!(self.challenges),
            watch!(self.secrets),
        ]
    }

    /// Wait for every cache to finish its initial list
    pub async fn wait_until_ready(&self) -> Result<(), StoreError> {
        tokio::try_join!(
            self.certificates.wait_until_ready(),
            self.requests.wait_until_ready(),
            self.issuers.wait_until_ready(),
            self.cluster_issuers.wait_until_ready(),
            self.orders.wait_until_ready(),
            self.challenges.wait_until_ready(),
            self.secrets.wait_until_ready(),
        )?;
        info!("Caches synced");
        Ok(())
    }
}
