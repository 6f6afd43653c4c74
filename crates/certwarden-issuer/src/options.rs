//! Process-wide issuer settings

use certwarden_common::crd::GenericIssuer;
use certwarden_common::{Duration, DEFAULT_CLUSTER_RESOURCE_NAMESPACE};

/// Default renew-before window when a Certificate does not set one (30 days)
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_hours(720);

/// Settings shared by every controller and backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerOptions {
    /// Namespace holding Secrets referenced by ClusterIssuers
    pub cluster_resource_namespace: String,

    /// Whether namespaced Issuers may use ambient credentials
    pub issuer_ambient_credentials: bool,

    /// Whether ClusterIssuers may use ambient credentials
    pub cluster_issuer_ambient_credentials: bool,

    /// Renew-before used when a Certificate sets none
    pub renew_before_expiry_duration: Duration,
}

impl Default for IssuerOptions {
    fn default() -> Self {
        Self {
            cluster_resource_namespace: DEFAULT_CLUSTER_RESOURCE_NAMESPACE.to_string(),
            issuer_ambient_credentials: false,
            cluster_issuer_ambient_credentials: true,
            renew_before_expiry_duration: DEFAULT_RENEW_BEFORE,
        }
    }
}

impl IssuerOptions {
    /// Namespace in which the issuer's Secrets are looked up
    pub fn resource_namespace(&self, issuer: &GenericIssuer) -> String {
        match issuer.namespace() {
            Some(ns) if !ns.is_empty() => ns,
            _ => self.cluster_resource_namespace.clone(),
        }
    }

    /// Whether the issuer may fall back to credentials from the environment
    pub fn can_use_ambient_credentials(&self, issuer: &GenericIssuer) -> bool {
        match issuer {
            GenericIssuer::Issuer(_) => self.issuer_ambient_credentials,
            GenericIssuer::ClusterIssuer(_) => self.cluster_issuer_ambient_credentials,
        }
    }

    /// Whether a certificate whose renewal is `until_renew` away is due now
    pub fn certificate_needs_renew(&self, until_renew: chrono::Duration) -> bool {
        until_renew <= chrono::Duration::zero()
    }
}
