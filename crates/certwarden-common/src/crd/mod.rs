//! Custom Resource Definitions for certwarden

mod certificate;
mod certificate_request;
mod challenge;
mod issuer;
mod order;
mod types;

pub use certificate::{
    Certificate, CertificateSpec, CertificateStatus, KeyAlgorithm, KeyEncoding,
    MIN_CERTIFICATE_DURATION, MIN_RENEW_BEFORE,
};
pub use certificate_request::{
    CertificateRequest, CertificateRequestSpec, CertificateRequestStatus, RequestState,
    REASON_FAILED, REASON_ISSUED, REASON_PENDING,
};
pub use challenge::{
    Challenge, ChallengeSpec, ChallengeState, ChallengeStatus, ChallengeType, TransitionError,
};
pub use issuer::{
    AcmeIssuer, AcmeIssuerStatus, AcmeSolver, CaIssuer, ClusterIssuer, ClusterIssuerSpec,
    Dns01Solver, Dns01Webhook, GenericIssuer, Http01Solver, Issuer, IssuerConfig, IssuerSpec,
    IssuerStatus, IssuerType, SelfSignedIssuer, SolverSelector, VaultAppRole, VaultAuth,
    VaultIssuer, VenafiCloud, VenafiIssuer, VenafiTpp,
};
pub use order::{AcmeAuthorization, AcmeChallenge, Order, OrderSpec, OrderState, OrderStatus};
pub use types::{
    find_condition, is_condition_true, set_condition, Condition, ConditionStatus, IssuerKind,
    IssuerRef, SecretKeySelector, CONDITION_DENIED, CONDITION_FAILED, CONDITION_READY,
};

/// Every CRD served by certwarden, for installation and `--crd` output
pub fn all_crds(
) -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;
    vec![
        Certificate::crd(),
        CertificateRequest::crd(),
        Issuer::crd(),
        ClusterIssuer::crd(),
        Order::crd(),
        Challenge::crd(),
    ]
}
