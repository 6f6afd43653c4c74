//! Vault issuer: signs through a PKI secrets engine
//!
//! Authenticates with a static token or an AppRole login, then posts the CSR
//! to the configured signing path. Rate limiting and server errors are
//! retried; any other refusal fails the request.

use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::crd::{CertificateRequest, GenericIssuer, IssuerStatus, VaultIssuer};
use certwarden_common::events::{actions, reasons};
use certwarden_pki::{CsrInfo, DEFAULT_CERTIFICATE_DURATION};
use kube::runtime::events::EventType;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::IssuerContext;
use crate::error::IssuerError;
use crate::secrets::secret_value;
use crate::{IssueResponse, IssuerBackend};

const VAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable consulted for ambient credentials
pub const VAULT_TOKEN_ENV: &str = "VAULT_TOKEN";

#[derive(Serialize)]
struct AppRoleLogin<'a> {
    role_id: &'a str,
    secret_id: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    common_name: &'a str,
    alt_names: String,
    ip_sans: String,
    ttl: String,
    exclude_cn_from_sans: bool,
}

#[derive(Deserialize)]
struct SignResponse {
    data: SignData,
}

#[derive(Deserialize)]
struct SignData {
    certificate: String,
    #[serde(default)]
    issuing_ca: Option<String>,
    #[serde(default)]
    ca_chain: Vec<String>,
}

/// How a non-success Vault response should be handled
#[derive(Debug, PartialEq, Eq)]
enum Refusal {
    Retry,
    Permanent,
}

fn classify(status: StatusCode) -> Refusal {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Refusal::Retry
    } else {
        Refusal::Permanent
    }
}

/// Backend for one Vault issuer
pub struct VaultBackend {
    ctx: IssuerContext,
    issuer: GenericIssuer,
    config: VaultIssuer,
}

impl VaultBackend {
    /// Backend for `issuer` configured with `config`
    pub fn new(ctx: IssuerContext, issuer: GenericIssuer, config: VaultIssuer) -> Self {
        Self {
            ctx,
            issuer,
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.server.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Client token for the configured auth method
    async fn token(&self) -> Result<String, IssuerError> {
        let namespace = self.ctx.options.resource_namespace(&self.issuer);
        let auth = &self.config.auth;

        if let Some(selector) = &auth.token_secret_ref {
            return secret_value(
                self.ctx.secrets.as_ref(),
                &namespace,
                &selector.name,
                selector.key_or("token"),
            );
        }

        if let Some(app_role) = &auth.app_role {
            let secret_id = secret_value(
                self.ctx.secrets.as_ref(),
                &namespace,
                &app_role.secret_ref.name,
                app_role.secret_ref.key_or("secretId"),
            )?;
            let mount = app_role.path.as_deref().unwrap_or("approle");
            let response = self
                .ctx
                .http
                .post(self.url(&format!("auth/{}/login", mount.trim_matches('/'))))
                .timeout(VAULT_REQUEST_TIMEOUT)
                .json(&AppRoleLogin {
                    role_id: &app_role.role_id,
                    secret_id: &secret_id,
                })
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let message = format!("vault AppRole login returned HTTP {}", status);
                return Err(match classify(status) {
                    Refusal::Retry => IssuerError::transient(message),
                    Refusal::Permanent => IssuerError::validation(message),
                });
            }
            let login: LoginResponse = response.json().await?;
            return Ok(login.auth.client_token);
        }

        if self.ctx.options.can_use_ambient_credentials(&self.issuer) {
            if let Ok(token) = std::env::var(VAULT_TOKEN_ENV) {
                return Ok(token);
            }
        }
        Err(IssuerError::validation(
            "vault.auth must set tokenSecretRef or appRole",
        ))
    }

    async fn refuse(&self, request: &CertificateRequest, message: String) -> Option<IssueResponse> {
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
impl IssuerBackend for VaultBackend {
    async fn setup(&self, _status: &mut IssuerStatus) -> Result<(), IssuerError> {
        if self.config.server.is_empty() || self.config.path.is_empty() {
            return Err(IssuerError::validation(
                "vault.server and vault.path must be set",
            ));
        }
        self.token().await?;

        let response = self
            .ctx
            .http
            .get(self.url("sys/health"))
            .timeout(VAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        // 429 and 472/473 are healthy standbys and performance replicas.
        match response.status().as_u16() {
            200 | 429 | 472 | 473 => Ok(()),
            code => Err(IssuerError::transient(format!(
                "vault at {} is not ready (HTTP {})",
                self.config.server, code
            ))),
        }
    }

    async fn sign(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<IssueResponse>, IssuerError> {
        let csr = match CsrInfo::from_pem(&request.spec.csr) {
            Ok(csr) => csr,
            Err(e) => return Ok(self.refuse(request, e.to_string()).await),
        };
        let token = self.token().await?;
        let ttl = request
            .spec
            .duration
            .unwrap_or(DEFAULT_CERTIFICATE_DURATION);

        let body = SignRequest {
            csr: &request.spec.csr,
            common_name: csr.common_name.as_deref().unwrap_or_default(),
            alt_names: csr.dns_names.join(","),
            ip_sans: csr.ip_addresses.join(","),
            ttl: format!("{}s", ttl.as_std().as_secs()),
            exclude_cn_from_sans: true,
        };
        debug!(path = %self.config.path, ttl = %ttl, "Submitting CSR to vault");
        let response = self
            .ctx
            .http
            .post(self.url(&self.config.path))
            .timeout(VAULT_REQUEST_TIMEOUT)
            .header("X-Vault-Token", token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("vault returned HTTP {}: {}", status, detail.trim());
            return match classify(status) {
                Refusal::Retry => {
                    warn!(path = %self.config.path, status = %status, "Vault signing will be retried");
                    Err(IssuerError::transient(message))
                }
                Refusal::Permanent => Ok(self.refuse(request, message).await),
            };
        }

        let signed: SignResponse = response.json().await?;
        let mut chain = vec![signed.data.certificate];
        chain.extend(signed.data.ca_chain);
        Ok(Some(IssueResponse {
            certificate: chain.join("\n"),
            ca: signed.data.issuing_ca,
        }))
    }
}
