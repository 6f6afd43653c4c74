//! Dependencies shared by all backends

use std::sync::Arc;

use certwarden_common::crd::{CertificateRequest, Order};
use certwarden_common::events::EventPublisher;
use certwarden_common::store::ResourceStore;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use kube::Resource;

use crate::acme::AcmeAccounts;
use crate::options::IssuerOptions;

/// Stores, clients and settings a backend may use
#[derive(Clone)]
pub struct IssuerContext {
    /// Secrets holding credentials and key material
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    /// CertificateRequests, for backends that annotate them
    pub requests: Arc<dyn ResourceStore<CertificateRequest>>,
    /// ACME Orders
    pub orders: Arc<dyn ResourceStore<Order>>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Registered ACME accounts
    pub accounts: Arc<AcmeAccounts>,
    /// Process-wide issuer settings
    pub options: IssuerOptions,
    /// HTTP client for Vault and Venafi
    pub http: reqwest::Client,
}

impl IssuerContext {
    /// Publish an event on a CertificateRequest
    pub async fn request_event(
        &self,
        request: &CertificateRequest,
        type_: EventType,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.events
            .publish(&request.object_ref(&()), type_, reason, action, Some(note.into()))
            .await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use certwarden_common::events::RecordingEventPublisher;
    use certwarden_common::store::MemoryStore;

    use crate::acme::AcmeClientFactory;

    /// Context over in-memory stores, with handles for assertions
    pub(crate) struct TestContext {
        pub ctx: IssuerContext,
        pub secrets: Arc<MemoryStore<Secret>>,
        pub requests: Arc<MemoryStore<CertificateRequest>>,
        pub orders: Arc<MemoryStore<Order>>,
        pub events: Arc<RecordingEventPublisher>,
    }

    impl TestContext {
        pub(crate) fn new() -> Self {
            Self::with_acme(Arc::new(crate::acme::MockAcmeClientFactory::new()))
        }

        pub(crate) fn with_acme(factory: Arc<dyn AcmeClientFactory>) -> Self {
            let secrets = Arc::new(MemoryStore::new());
            let requests = Arc::new(MemoryStore::new());
            let orders = Arc::new(MemoryStore::new());
            let events = Arc::new(RecordingEventPublisher::default());
            let ctx = IssuerContext {
                secrets: secrets.clone(),
                requests: requests.clone(),
                orders: orders.clone(),
                events: events.clone(),
                accounts: Arc::new(AcmeAccounts::new(factory)),
                options: IssuerOptions::default(),
                http: reqwest::Client::new(),
            };
            Self {
                ctx,
                secrets,
                requests,
                orders,
                events,
            }
        }
    }

    pub(crate) fn secret(namespace: &str, name: &str, entries: &[(&str, &str)]) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some(namespace.to_string());
        secret.metadata.name = Some(name.to_string());
        secret.data = Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), k8s_openapi::ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        secret
    }

    /// Fresh ECDSA key and a CSR for `dns_names`
    pub(crate) fn key_and_csr(dns_names: &[&str]) -> (certwarden_pki::PrivateKey, String) {
        use certwarden_common::crd::{CertificateSpec, IssuerRef, KeyAlgorithm, KeyEncoding};

        let spec = CertificateSpec {
            secret_name: "tls".to_string(),
            common_name: dns_names.first().map(|n| n.to_string()),
            dns_names: dns_names.iter().map(|n| n.to_string()).collect(),
            ip_addresses: vec![],
            organization: vec![],
            duration: None,
            renew_before: None,
            key_algorithm: KeyAlgorithm::Ecdsa,
            key_size: 256,
            key_encoding: KeyEncoding::Pkcs8,
            is_ca: false,
            issuer_ref: IssuerRef::default(),
        };
        let key = certwarden_pki::generate_private_key_for_certificate(&spec)
            .expect("key generation should succeed");
        let csr = certwarden_pki::build_csr(&spec, &key).expect("csr should build");
        (key, csr)
    }

    pub(crate) fn request(
        namespace: &str,
        name: &str,
        csr: String,
        issuer_ref: certwarden_common::crd::IssuerRef,
    ) -> CertificateRequest {
        let mut cr = CertificateRequest::new(
            name,
            certwarden_common::crd::CertificateRequestSpec {
                csr,
                issuer_ref,
                duration: Some(certwarden_common::Duration::from_hours(24)),
                is_ca: false,
            },
        );
        cr.metadata.namespace = Some(namespace.to_string());
        cr
    }
}
