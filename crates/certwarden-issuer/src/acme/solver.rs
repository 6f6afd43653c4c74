//! Challenge solvers
//!
//! HTTP-01 proofs are kept in an in-process map served by the operator's
//! responder. DNS-01 proofs are published through a webhook that owns the
//! zone. Both are driven through [`ChallengeSolver`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use certwarden_common::crd::{Challenge, ChallengeType, Dns01Webhook};
use certwarden_common::store::ResourceStore;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::error::AcmeError;
use super::selfcheck::SelfChecker;
use crate::secrets::secret_value;

/// Prefix of the DNS-01 TXT record
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// Path prefix served by the HTTP-01 responder
pub const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// `_acme-challenge.<domain>`, with any wildcard label removed
pub fn challenge_record_fqdn(domain: &str) -> String {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!("{}.{}", ACME_CHALLENGE_RECORD, domain)
}

/// TXT record value for a key authorization: base64url(sha256(key))
pub fn dns01_record_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Token → key authorization map backing the HTTP-01 responder
#[derive(Clone, Debug, Default)]
pub struct Http01Responder {
    tokens: Arc<DashMap<String, String>>,
}

impl Http01Responder {
    /// Empty responder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start answering `token` with `key_authorization`
    pub fn present(&self, token: &str, key_authorization: &str) {
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Stop answering `token`
    pub fn cleanup(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Key authorization for `token`, if presented
    pub fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.value().clone())
    }

    /// Number of presented tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing is presented
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Publishes and removes DNS-01 TXT records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create the TXT record `fqdn` with `value`
    async fn present(
        &self,
        webhook: &Dns01Webhook,
        token: Option<String>,
        fqdn: &str,
        value: &str,
    ) -> Result<(), AcmeError>;

    /// Remove the TXT record `fqdn` with `value`
    async fn cleanup(
        &self,
        webhook: &Dns01Webhook,
        token: Option<String>,
        fqdn: &str,
        value: &str,
    ) -> Result<(), AcmeError>;
}

#[derive(Serialize)]
struct WebhookRecord<'a> {
    fqdn: &'a str,
    value: &'a str,
    #[serde(rename = "type")]
    type_: &'static str,
}

/// DNS provider calling a user supplied webhook
///
/// `POST {url}` creates the record and `DELETE {url}` removes it; both carry
/// `{"fqdn", "value", "type": "TXT"}` as JSON. A 404 on delete counts as
/// already removed.
#[derive(Clone, Debug)]
pub struct WebhookDnsProvider {
    client: reqwest::Client,
}

impl WebhookDnsProvider {
    /// Provider using `client` for every webhook call
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn call(
        &self,
        method: reqwest::Method,
        webhook: &Dns01Webhook,
        token: Option<String>,
        fqdn: &str,
        value: &str,
    ) -> Result<reqwest::StatusCode, AcmeError> {
        let mut request = self
            .client
            .request(method, &webhook.url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&WebhookRecord {
                fqdn,
                value,
                type_: "TXT",
            });
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AcmeError::DnsProvider(format!("webhook request failed: {}", e)))?;
        Ok(response.status())
    }
}

#[async_trait]
impl DnsProvider for WebhookDnsProvider {
    async fn present(
        &self,
        webhook: &Dns01Webhook,
        token: Option<String>,
        fqdn: &str,
        value: &str,
    ) -> Result<(), AcmeError> {
        debug!(fqdn = %fqdn, url = %webhook.url, "Creating TXT record via webhook");
        let status = self
            .call(reqwest::Method::POST, webhook, token, fqdn, value)
            .await?;
        if !status.is_success() {
            return Err(AcmeError::DnsProvider(format!(
                "webhook returned HTTP {} creating {}",
                status, fqdn
            )));
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        webhook: &Dns01Webhook,
        token: Option<String>,
        fqdn: &str,
        value: &str,
    ) -> Result<(), AcmeError> {
        debug!(fqdn = %fqdn, url = %webhook.url, "Deleting TXT record via webhook");
        let status = self
            .call(reqwest::Method::DELETE, webhook, token, fqdn, value)
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        Err(AcmeError::DnsProvider(format!(
            "webhook returned HTTP {} deleting {}",
            status, fqdn
        )))
    }
}

/// Presents, verifies and removes challenge proofs
#[derive(Clone)]
pub struct ChallengeSolver {
    http01: Http01Responder,
    dns: Arc<dyn DnsProvider>,
    checker: Arc<dyn SelfChecker>,
    secrets: Arc<dyn ResourceStore<Secret>>,
}

impl ChallengeSolver {
    /// Solver over the given responder, DNS provider and self-checker
    pub fn new(
        http01: Http01Responder,
        dns: Arc<dyn DnsProvider>,
        checker: Arc<dyn SelfChecker>,
        secrets: Arc<dyn ResourceStore<Secret>>,
    ) -> Self {
        Self {
            http01,
            dns,
            checker,
            secrets,
        }
    }

    /// Responder shared with the HTTP-01 server
    pub fn http01(&self) -> &Http01Responder {
        &self.http01
    }

    /// Publish the proof for `challenge`
    ///
    /// `resource_namespace` is where the issuer's Secrets live.
    pub async fn present(
        &self,
        challenge: &Challenge,
        resource_namespace: &str,
    ) -> Result<(), AcmeError> {
        let spec = &challenge.spec;
        match spec.type_ {
            ChallengeType::Http01 => {
                self.http01.present(&spec.token, &spec.key);
                Ok(())
            }
            ChallengeType::Dns01 => {
                let webhook = self.webhook(challenge)?;
                let token = self.webhook_token(webhook, resource_namespace)?;
                self.dns
                    .present(
                        webhook,
                        token,
                        &challenge_record_fqdn(&spec.dns_name),
                        &dns01_record_value(&spec.key),
                    )
                    .await
            }
        }
    }

    /// Verify locally that the proof is visible
    pub async fn check(&self, challenge: &Challenge) -> Result<bool, AcmeError> {
        let spec = &challenge.spec;
        match spec.type_ {
            ChallengeType::Http01 => {
                let base = spec
                    .solver
                    .http01
                    .as_ref()
                    .and_then(|h| h.self_check_base_url.clone())
                    .unwrap_or_else(|| format!("http://{}", spec.dns_name));
                let url = format!(
                    "{}{}{}",
                    base.trim_end_matches('/'),
                    HTTP01_PATH_PREFIX,
                    spec.token
                );
                self.checker.check_http01(&url, &spec.key).await
            }
            ChallengeType::Dns01 => {
                let nameservers = spec
                    .solver
                    .dns01
                    .as_ref()
                    .map(|d| d.nameservers.clone())
                    .unwrap_or_default();
                self.checker
                    .check_dns01(
                        &challenge_record_fqdn(&spec.dns_name),
                        &dns01_record_value(&spec.key),
                        &nameservers,
                    )
                    .await
            }
        }
    }

    /// Remove the proof for `challenge`; removing an absent proof succeeds
    pub async fn cleanup(
        &self,
        challenge: &Challenge,
        resource_namespace: &str,
    ) -> Result<(), AcmeError> {
        let spec = &challenge.spec;
        match spec.type_ {
            ChallengeType::Http01 => {
                self.http01.cleanup(&spec.token);
                Ok(())
            }
            ChallengeType::Dns01 => {
                let webhook = self.webhook(challenge)?;
                let token = self.webhook_token(webhook, resource_namespace)?;
                self.dns
                    .cleanup(
                        webhook,
                        token,
                        &challenge_record_fqdn(&spec.dns_name),
                        &dns01_record_value(&spec.key),
                    )
                    .await
            }
        }
    }

    fn webhook<'a>(&self, challenge: &'a Challenge) -> Result<&'a Dns01Webhook, AcmeError> {
        challenge
            .spec
            .solver
            .dns01
            .as_ref()
            .map(|d| &d.webhook)
            .ok_or_else(|| AcmeError::NoSolver {
                domain: challenge.spec.dns_name.clone(),
            })
    }

    fn webhook_token(
        &self,
        webhook: &Dns01Webhook,
        resource_namespace: &str,
    ) -> Result<Option<String>, AcmeError> {
        let Some(selector) = &webhook.auth_secret_ref else {
            return Ok(None);
        };
        secret_value(
            self.secrets.as_ref(),
            resource_namespace,
            &selector.name,
            selector.key_or("token"),
        )
        .map(Some)
        .map_err(|e| AcmeError::DnsProvider(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::selfcheck::MockSelfChecker;
    use certwarden_common::crd::{
        AcmeSolver, ChallengeSpec, Dns01Solver, Http01Solver, IssuerRef,
    };
    use certwarden_common::store::MemoryStore;

    fn challenge(type_: ChallengeType) -> Challenge {
        let solver = match type_ {
            ChallengeType::Http01 => AcmeSolver {
                http01: Some(Http01Solver::default()),
                ..Default::default()
            },
            ChallengeType::Dns01 => AcmeSolver {
                dns01: Some(Dns01Solver {
                    webhook: Dns01Webhook {
                        url: "http://dns-hook.local/records".to_string(),
                        auth_secret_ref: None,
                    },
                    nameservers: vec![],
                }),
                ..Default::default()
            },
        };
        let mut ch = Challenge::new(
            "web-1-123-0",
            ChallengeSpec {
                url: "https://acme.test/chall/1".to_string(),
                authz_url: "https://acme.test/authz/1".to_string(),
                dns_name: "web.example.com".to_string(),
                wildcard: false,
                type_,
                token: "tok".to_string(),
                key: "tok.thumb".to_string(),
                solver,
                issuer_ref: IssuerRef::default(),
            },
        );
        ch.metadata.namespace = Some("default".to_string());
        ch
    }

    fn solver(dns: MockDnsProvider, checker: MockSelfChecker) -> ChallengeSolver {
        ChallengeSolver::new(
            Http01Responder::new(),
            Arc::new(dns),
            Arc::new(checker),
            Arc::new(MemoryStore::<Secret>::new()),
        )
    }

    #[test]
    fn record_names_strip_wildcards() {
        assert_eq!(
            challenge_record_fqdn("*.example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_fqdn("sub.example.com"),
            "_acme-challenge.sub.example.com"
        );
    }

    #[test]
    fn record_value_is_base64url_sha256() {
        // sha256("") base64url without padding
        assert_eq!(
            dns01_record_value(""),
            "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[tokio::test]
    async fn http01_present_check_cleanup() {
        let mut checker = MockSelfChecker::new();
        checker
            .expect_check_http01()
            .withf(|url, expected| {
                url == "http://web.example.com/.well-known/acme-challenge/tok"
                    && expected == "tok.thumb"
            })
            .returning(|_, _| Ok(true));
        let solver = solver(MockDnsProvider::new(), checker);
        let ch = challenge(ChallengeType::Http01);

        solver.present(&ch, "default").await.expect("present should succeed");
        assert_eq!(
            solver.http01().key_authorization("tok").as_deref(),
            Some("tok.thumb")
        );
        assert!(solver.check(&ch).await.expect("check should succeed"));

        solver.cleanup(&ch, "default").await.expect("cleanup should succeed");
        assert!(solver.http01().is_empty());
    }

    #[tokio::test]
    async fn dns01_goes_through_provider() {
        let mut dns = MockDnsProvider::new();
        dns.expect_present()
            .withf(|_, token, fqdn, value| {
                token.is_none()
                    && fqdn == "_acme-challenge.web.example.com"
                    && value == dns01_record_value("tok.thumb")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        dns.expect_cleanup()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let solver = solver(dns, MockSelfChecker::new());
        let ch = challenge(ChallengeType::Dns01);

        solver.present(&ch, "default").await.expect("present should succeed");
        solver.cleanup(&ch, "default").await.expect("cleanup should succeed");
    }
}
