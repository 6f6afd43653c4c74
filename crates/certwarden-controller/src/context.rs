//! Dependencies shared by every controller

use std::sync::Arc;

use certwarden_common::crd::{
    Certificate, CertificateRequest, Challenge, ClusterIssuer, GenericIssuer, Issuer, IssuerKind,
    IssuerRef, Order,
};
use certwarden_common::events::EventPublisher;
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_issuer::acme::ChallengeSolver;
use certwarden_issuer::{BackendFactory, IssuerContext, IssuerOptions};
use k8s_openapi::api::core::v1::Secret;

/// Default number of workers per controller
pub const DEFAULT_WORKERS: usize = 5;

/// Stores, backends and settings handed to controller factories
#[derive(Clone)]
pub struct ControllerContext {
    /// Context the issuer backends run with; owns the Secret, request and Order stores
    pub issuer: IssuerContext,
    /// Certificates
    pub certificates: Arc<dyn ResourceStore<Certificate>>,
    /// Namespaced Issuers
    pub issuers: Arc<dyn ResourceStore<Issuer>>,
    /// ClusterIssuers
    pub cluster_issuers: Arc<dyn ResourceStore<ClusterIssuer>>,
    /// ACME Challenges
    pub challenges: Arc<dyn ResourceStore<Challenge>>,
    /// Builds a backend for an issuer
    pub backends: Arc<dyn BackendFactory>,
    /// Presents and checks challenge proofs
    pub solver: ChallengeSolver,
    /// Workers per controller
    pub workers: usize,
}

impl ControllerContext {
    /// Secret store
    pub fn secrets(&self) -> &Arc<dyn ResourceStore<Secret>> {
        &self.issuer.secrets
    }

    /// CertificateRequest store
    pub fn requests(&self) -> &Arc<dyn ResourceStore<CertificateRequest>> {
        &self.issuer.requests
    }

    /// Order store
    pub fn orders(&self) -> &Arc<dyn ResourceStore<Order>> {
        &self.issuer.orders
    }

    /// Event sink
    pub fn events(&self) -> &Arc<dyn EventPublisher> {
        &self.issuer.events
    }

    /// Process-wide issuer settings
    pub fn options(&self) -> &IssuerOptions {
        &self.issuer.options
    }

    /// Issuer referenced from a resource in `namespace`
    pub fn get_issuer(&self, namespace: Option<&str>, issuer_ref: &IssuerRef) -> Option<GenericIssuer> {
        match issuer_ref.kind {
            IssuerKind::Issuer => {
                let namespace = namespace?;
                self.issuers
                    .get(&ObjectKey::namespaced(namespace, &issuer_ref.name))
                    .map(GenericIssuer::Issuer)
            }
            IssuerKind::ClusterIssuer => self
                .cluster_issuers
                .get(&ObjectKey::cluster(&issuer_ref.name))
                .map(GenericIssuer::ClusterIssuer),
        }
    }
}
