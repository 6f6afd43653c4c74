//! The certwarden controllers and the watch mappings between them

pub mod certificaterequests;
pub mod certificates;
pub mod challenges;
pub mod issuers;
pub mod orders;

use std::sync::Arc;

use certwarden_common::crd::{IssuerKind, IssuerRef, IssuerType};
use certwarden_common::store::{ObjectKey, ResourceStore};
use certwarden_common::CERTIFICATE_NAME_LABEL;
use kube::{Resource, ResourceExt};

use crate::registry::{ControllerRegistry, RegistryError};

/// Label on Challenges naming the Order they belong to
pub const ORDER_NAME_LABEL: &str = "certwarden.io/order-name";

/// Registry holding every certwarden controller
pub fn default_registry() -> Result<ControllerRegistry, RegistryError> {
    let mut registry = ControllerRegistry::new();
    registry.register(certificates::CONTROLLER_NAME, |ctx| {
        Ok(certificates::CertificateReconciler::controller(ctx))
    })?;
    for issuer_type in IssuerType::ALL {
        registry.register(certificaterequests::controller_name(issuer_type), move |ctx| {
            Ok(certificaterequests::CertificateRequestReconciler::controller(ctx, issuer_type))
        })?;
    }
    registry.register(issuers::ISSUERS_CONTROLLER_NAME, |ctx| {
        Ok(issuers::IssuerReconciler::controller(ctx, IssuerKind::Issuer))
    })?;
    registry.register(issuers::CLUSTER_ISSUERS_CONTROLLER_NAME, |ctx| {
        Ok(issuers::IssuerReconciler::controller(ctx, IssuerKind::ClusterIssuer))
    })?;
    registry.register(orders::CONTROLLER_NAME, |ctx| {
        Ok(orders::OrderReconciler::controller(ctx))
    })?;
    registry.register(challenges::CONTROLLER_NAME, |ctx| {
        Ok(challenges::ChallengeReconciler::controller(ctx))
    })?;
    Ok(registry)
}

/// Certificate named by the object's certificate-name label
pub(crate) fn labelled_certificate<K: Resource>(obj: &K) -> Vec<ObjectKey> {
    match (obj.namespace(), obj.labels().get(CERTIFICATE_NAME_LABEL)) {
        (Some(ns), Some(name)) => vec![ObjectKey::namespaced(ns, name)],
        _ => Vec::new(),
    }
}

/// Controlling owner of kind `kind`, in the object's namespace
pub(crate) fn owner_of_kind<K: Resource>(obj: &K, kind: &str) -> Vec<ObjectKey> {
    let Some(ns) = obj.namespace() else {
        return Vec::new();
    };
    obj.owner_references()
        .iter()
        .filter(|r| r.kind == kind && r.controller == Some(true))
        .map(|r| ObjectKey::namespaced(&ns, &r.name))
        .collect()
}

/// Keys of objects in `store` whose issuer reference points at the changed issuer
pub(crate) fn referencing_issuer<T, I>(
    store: Arc<dyn ResourceStore<T>>,
    kind: IssuerKind,
    issuer_ref: fn(&T) -> &IssuerRef,
) -> impl Fn(&I) -> Vec<ObjectKey> + Send + Sync + 'static
where
    T: Resource + Clone + Send + Sync + 'static,
    I: Resource,
{
    move |issuer: &I| {
        let name = issuer.name_any();
        // A ClusterIssuer may be referenced from any namespace.
        let namespace = match kind {
            IssuerKind::Issuer => issuer.namespace(),
            IssuerKind::ClusterIssuer => None,
        };
        store
            .list(namespace.as_deref())
            .iter()
            .filter(|obj| {
                let r = issuer_ref(obj);
                r.kind == kind && r.name == name
            })
            .filter_map(ObjectKey::of)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    #[test]
    fn registry_holds_every_controller_once() {
        let registry = default_registry().expect("registry should build");
        let names = registry.names();
        assert_eq!(names.len(), 11);
        assert!(names.contains(&"certificates"));
        assert!(names.contains(&"certificaterequests-issuer-acme"));
        assert!(names.contains(&"certificaterequests-issuer-venafi"));
        assert!(names.contains(&"clusterissuers"));
        assert!(names.contains(&"challenges"));
    }

    #[test]
    fn secrets_map_to_their_certificate() {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some("default".to_string());
        secret.metadata.labels = Some(BTreeMap::from([(
            CERTIFICATE_NAME_LABEL.to_string(),
            "web".to_string(),
        )]));
        assert_eq!(
            labelled_certificate(&secret),
            vec![ObjectKey::namespaced("default", "web")]
        );

        secret.metadata.labels = None;
        assert!(labelled_certificate(&secret).is_empty());
    }

    #[test]
    fn only_controlling_owner_of_kind_is_used() {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some("default".to_string());
        secret.metadata.owner_references = Some(vec![
            OwnerReference {
                kind: "CertificateRequest".to_string(),
                name: "web-1".to_string(),
                controller: Some(true),
                ..Default::default()
            },
            OwnerReference {
                kind: "CertificateRequest".to_string(),
                name: "other".to_string(),
                controller: None,
                ..Default::default()
            },
        ]);
        assert_eq!(
            owner_of_kind(&secret, "CertificateRequest"),
            vec![ObjectKey::namespaced("default", "web-1")]
        );
    }
}
