//! CA issuer: signs with a keypair stored in a Secret

use async_trait::async_trait;
use certwarden_common::crd::{CaIssuer, CertificateRequest, GenericIssuer, IssuerStatus};
use certwarden_common::events::{actions, reasons};
use certwarden_common::store::ObjectKey;
use certwarden_common::{TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use certwarden_pki::{
    parse_private_key_pem, public_key_matches_certificate, sign_csr_with_ca, CertificateInfo,
    PkiError, DEFAULT_CERTIFICATE_DURATION,
};
use kube::runtime::events::EventType;
use tracing::debug;

use crate::context::IssuerContext;
use crate::error::IssuerError;
use crate::secrets::value_of;
use crate::{IssueResponse, IssuerBackend};

/// Backend signing with a local CA
pub struct CaBackend {
    ctx: IssuerContext,
    issuer: GenericIssuer,
    config: CaIssuer,
}

impl CaBackend {
    /// Backend for `issuer` configured with `config`
    pub fn new(ctx: IssuerContext, issuer: GenericIssuer, config: CaIssuer) -> Self {
        Self {
            ctx,
            issuer,
            config,
        }
    }

    /// PEM certificate and key of the CA
    fn keypair(&self) -> Result<(String, String), IssuerError> {
        let key = ObjectKey::namespaced(
            self.ctx.options.resource_namespace(&self.issuer),
            &self.config.secret_name,
        );
        let secret = self
            .ctx
            .secrets
            .get(&key)
            .ok_or_else(|| IssuerError::transient(format!("CA secret {} not found", key)))?;
        let field = |name: &str| {
            value_of(&secret, name).ok_or_else(|| {
                IssuerError::validation(format!("CA secret {} has no '{}'", key, name))
            })
        };
        Ok((field(TLS_CERT_KEY)?, field(TLS_PRIVATE_KEY_KEY)?))
    }
}

#[async_trait]
impl IssuerBackend for CaBackend {
    async fn setup(&self, _status: &mut IssuerStatus) -> Result<(), IssuerError> {
        if self.config.secret_name.is_empty() {
            return Err(IssuerError::validation("ca.secretName must be set"));
        }
        let (cert_pem, key_pem) = self.keypair()?;
        let info = CertificateInfo::from_pem(&cert_pem)?;
        if !info.is_ca {
            return Err(IssuerError::validation(format!(
                "certificate in secret {} is not a CA",
                self.config.secret_name
            )));
        }
        let key = parse_private_key_pem(&key_pem)?;
        if !public_key_matches_certificate(&key.public_key(), &cert_pem)? {
            return Err(PkiError::KeyMismatch("CA certificate").into());
        }
        debug!(issuer = %self.issuer.name(), not_after = %info.not_after, "CA keypair verified");
        Ok(())
    }

    async fn sign(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<IssueResponse>, IssuerError> {
        let (cert_pem, key_pem) = self.keypair()?;
        let duration = request
            .spec
            .duration
            .unwrap_or(DEFAULT_CERTIFICATE_DURATION);

        match sign_csr_with_ca(
            &request.spec.csr,
            &cert_pem,
            &key_pem,
            duration,
            request.spec.is_ca,
        ) {
            Ok(signed) => Ok(Some(IssueResponse {
                certificate: signed.certificate,
                ca: Some(signed.ca),
            })),
            Err(e @ PkiError::InvalidCsr(_)) => {
                self.ctx
                    .request_event(
                        request,
                        EventType::Warning,
                        reasons::FAILED,
                        actions::SIGN,
                        e.to_string(),
                    )
                    .await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{key_and_csr, request, secret, TestContext};
    use certwarden_common::crd::{
        CertificateSpec, Issuer, IssuerConfig, IssuerKind, IssuerRef, IssuerSpec, KeyAlgorithm,
        KeyEncoding,
    };
    use certwarden_common::store::ResourceStore;
    use certwarden_common::Duration;
    use certwarden_pki::{build_csr, encode_private_key, generate_key, self_sign_csr};

    fn ca_keypair(is_ca: bool) -> (String, String) {
        let key = generate_key(KeyAlgorithm::Ecdsa, 256).expect("key generation should succeed");
        let spec = CertificateSpec {
            secret_name: "ca".to_string(),
            common_name: Some("Test CA".to_string()),
            dns_names: vec![],
            ip_addresses: vec![],
            organization: vec![],
            duration: None,
            renew_before: None,
            key_algorithm: KeyAlgorithm::Ecdsa,
            key_size: 256,
            key_encoding: KeyEncoding::Pkcs8,
            is_ca,
            issuer_ref: IssuerRef::default(),
        };
        let csr = build_csr(&spec, &key).expect("csr should build");
        let signed =
            self_sign_csr(&csr, &key, Duration::from_hours(24 * 365), is_ca).expect("should sign");
        (
            signed.certificate,
            encode_private_key(&key, KeyEncoding::Pkcs8).expect("key should encode"),
        )
    }

    fn issuer() -> GenericIssuer {
        let mut issuer = Issuer::new(
            "team-ca",
            IssuerSpec {
                config: IssuerConfig {
                    ca: Some(CaIssuer {
                        secret_name: "ca-keypair".to_string(),
                    }),
                    ..Default::default()
                },
            },
        );
        issuer.metadata.namespace = Some("team".to_string());
        GenericIssuer::Issuer(issuer)
    }

    fn issuer_ref() -> IssuerRef {
        IssuerRef {
            name: "team-ca".to_string(),
            kind: IssuerKind::Issuer,
        }
    }

    async fn backend_with(is_ca: bool) -> (TestContext, CaBackend, String) {
        let t = TestContext::new();
        let (cert, key) = ca_keypair(is_ca);
        t.secrets
            .create(&secret(
                "team",
                "ca-keypair",
                &[(TLS_CERT_KEY, &cert), (TLS_PRIVATE_KEY_KEY, &key)],
            ))
            .await
            .expect("secret create should succeed");
        let backend = CaBackend::new(
            t.ctx.clone(),
            issuer(),
            CaIssuer {
                secret_name: "ca-keypair".to_string(),
            },
        );
        (t, backend, cert)
    }

    // =========================================================================
    // Story: a team CA signs leaf certificates from its Secret
    // =========================================================================

    #[tokio::test]
    async fn setup_and_sign_with_ca() {
        let (_t, backend, ca_cert) = backend_with(true).await;

        // Chapter 1: the keypair passes the readiness check
        backend
            .setup(&mut IssuerStatus::default())
            .await
            .expect("setup should succeed");

        // Chapter 2: a request is signed and carries the CA
        let (_, csr) = key_and_csr(&["api.team.svc"]);
        let cr = request("team", "api-1", csr, issuer_ref());
        let response = backend
            .sign(&cr)
            .await
            .expect("sign should succeed")
            .expect("should be issued");
        let leaf = CertificateInfo::from_pem(&response.certificate).expect("leaf should parse");
        assert!(leaf.dns_names.contains(&"api.team.svc".to_string()));
        assert!(!leaf.is_ca);
        assert_eq!(response.ca.as_deref(), Some(ca_cert.as_str()));
    }

    #[tokio::test]
    async fn non_ca_certificate_fails_setup() {
        let (_t, backend, _) = backend_with(false).await;
        let err = backend
            .setup(&mut IssuerStatus::default())
            .await
            .expect_err("setup should fail");
        assert!(matches!(err, IssuerError::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_secret_is_retried() {
        let t = TestContext::new();
        let backend = CaBackend::new(
            t.ctx.clone(),
            issuer(),
            CaIssuer {
                secret_name: "ca-keypair".to_string(),
            },
        );
        let (_, csr) = key_and_csr(&["api.team.svc"]);
        let err = backend
            .sign(&request("team", "api-1", csr, issuer_ref()))
            .await
            .expect_err("sign should fail");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_csr_fails_permanently() {
        let (t, backend, _) = backend_with(true).await;
        let cr = request("team", "api-1", "garbage".to_string(), issuer_ref());
        assert!(backend.sign(&cr).await.expect("sign should succeed").is_none());
        assert!(t.events.has_reason(reasons::FAILED));
    }
}
