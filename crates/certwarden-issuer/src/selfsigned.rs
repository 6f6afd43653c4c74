//! SelfSigned issuer: signs each request with its own private key

use async_trait::async_trait;
use certwarden_common::crd::{CertificateRequest, GenericIssuer, IssuerStatus};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::ObjectKey;
use certwarden_common::{PRIVATE_KEY_SECRET_ANNOTATION, TLS_PRIVATE_KEY_KEY};
use certwarden_pki::{parse_private_key_pem, self_sign_csr, PkiError, DEFAULT_CERTIFICATE_DURATION};
use kube::runtime::events::EventType;
use kube::ResourceExt;

use crate::context::IssuerContext;
use crate::error::IssuerError;
use crate::secrets::value_of;
use crate::{IssueResponse, IssuerBackend};

/// Backend producing self-signed certificates
pub struct SelfSignedBackend {
    ctx: IssuerContext,
    issuer: GenericIssuer,
}

impl SelfSignedBackend {
    /// Backend for `issuer`
    pub fn new(ctx: IssuerContext, issuer: GenericIssuer) -> Self {
        Self { ctx, issuer }
    }

    async fn reject(&self, request: &CertificateRequest, message: String) -> Option<IssueResponse> {
        self.ctx
            .request_event(
                request,
                EventType::Warning,
                reasons::FAILED,
                actions::SIGN,
                message,
            )
            .await;
        None
    }
}

#[async_trait]
impl IssuerBackend for SelfSignedBackend {
    async fn setup(&self, _status: &mut IssuerStatus) -> Result<(), IssuerError> {
        Ok(())
    }

    async fn sign(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<IssueResponse>, IssuerError> {
        let Some(secret_name) = request.annotations().get(PRIVATE_KEY_SECRET_ANNOTATION) else {
            return Ok(self
                .reject(
                    request,
                    format!(
                        "annotation {} is required for issuer {}",
                        PRIVATE_KEY_SECRET_ANNOTATION,
                        self.issuer.name()
                    ),
                )
                .await);
        };

        let key = ObjectKey::namespaced(request.namespace().unwrap_or_default(), secret_name);
        let secret = self
            .ctx
            .secrets
            .get(&key)
            .ok_or_else(|| IssuerError::transient(format!("private key secret {} not found", key)))?;
        let Some(key_pem) = value_of(&secret, TLS_PRIVATE_KEY_KEY) else {
            return Ok(self
                .reject(request, format!("secret {} has no private key", key))
                .await);
        };
        let private_key = match parse_private_key_pem(&key_pem) {
            Ok(k) => k,
            Err(e) => return Ok(self.reject(request, e.to_string()).await),
        };

        let duration = request
            .spec
            .duration
            .unwrap_or(DEFAULT_CERTIFICATE_DURATION);
        match self_sign_csr(&request.spec.csr, &private_key, duration, request.spec.is_ca) {
            Ok(signed) => Ok(Some(IssueResponse {
                certificate: signed.certificate,
                ca: Some(signed.ca),
            })),
            Err(e @ (PkiError::KeyMismatch(_) | PkiError::InvalidCsr(_) | PkiError::ParseError(_))) => {
                Ok(self.reject(request, e.to_string()).await)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{key_and_csr, request, secret, TestContext};
    use certwarden_common::crd::{ClusterIssuer, IssuerKind, IssuerRef};
    use certwarden_common::store::ResourceStore;
    use certwarden_pki::{encode_private_key, CertificateInfo};
    use certwarden_common::crd::KeyEncoding;

    fn backend(t: &TestContext) -> SelfSignedBackend {
        SelfSignedBackend::new(
            t.ctx.clone(),
            GenericIssuer::ClusterIssuer(ClusterIssuer::new("selfsigned", Default::default())),
        )
    }

    fn issuer_ref() -> IssuerRef {
        IssuerRef {
            name: "selfsigned".to_string(),
            kind: IssuerKind::ClusterIssuer,
        }
    }

    // =========================================================================
    // Story: a request is signed by the key it was generated from
    // =========================================================================

    #[tokio::test]
    async fn signs_with_annotated_key() {
        let t = TestContext::new();
        let (key, csr) = key_and_csr(&["local.test"]);
        let key_pem = encode_private_key(&key, KeyEncoding::Pkcs1).expect("key should encode");
        t.secrets
            .create(&secret("default", "web-next-key", &[(TLS_PRIVATE_KEY_KEY, &key_pem)]))
            .await
            .expect("secret create should succeed");

        let mut cr = request("default", "web-1", csr, issuer_ref());
        cr.annotations_mut().insert(
            PRIVATE_KEY_SECRET_ANNOTATION.to_string(),
            "web-next-key".to_string(),
        );

        let response = backend(&t)
            .sign(&cr)
            .await
            .expect("sign should succeed")
            .expect("should be issued");
        let info = CertificateInfo::from_pem(&response.certificate).expect("cert should parse");
        assert!(key.public_key().matches(&info.public_key));
        assert_eq!(response.ca.as_deref(), Some(response.certificate.as_str()));
    }

    #[tokio::test]
    async fn key_not_matching_csr_fails_permanently() {
        let t = TestContext::new();
        let (_, csr) = key_and_csr(&["local.test"]);
        let (other_key, _) = key_and_csr(&["local.test"]);
        let key_pem = encode_private_key(&other_key, KeyEncoding::Pkcs8).expect("key should encode");
        t.secrets
            .create(&secret("default", "web-next-key", &[(TLS_PRIVATE_KEY_KEY, &key_pem)]))
            .await
            .expect("secret create should succeed");

        let mut cr = request("default", "web-1", csr, issuer_ref());
        cr.annotations_mut().insert(
            PRIVATE_KEY_SECRET_ANNOTATION.to_string(),
            "web-next-key".to_string(),
        );
        assert!(backend(&t).sign(&cr).await.expect("sign should succeed").is_none());
        assert!(t.events.has_reason(reasons::FAILED));
    }

    #[tokio::test]
    async fn missing_annotation_fails_permanently() {
        let t = TestContext::new();
        let (_, csr) = key_and_csr(&["local.test"]);
        let cr = request("default", "web-1", csr, issuer_ref());
        assert!(backend(&t).sign(&cr).await.expect("sign should succeed").is_none());
    }

    #[tokio::test]
    async fn missing_key_secret_is_retried() {
        let t = TestContext::new();
        let (_, csr) = key_and_csr(&["local.test"]);
        let mut cr = request("default", "web-1", csr, issuer_ref());
        cr.annotations_mut().insert(
            PRIVATE_KEY_SECRET_ANNOTATION.to_string(),
            "web-next-key".to_string(),
        );
        let err = backend(&t).sign(&cr).await.expect_err("sign should fail");
        assert!(err.is_retryable());
    }
}
