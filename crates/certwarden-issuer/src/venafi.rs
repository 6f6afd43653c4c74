//! Venafi issuer: Trust Protection Platform or Venafi Cloud
//!
//! The pickup id returned on submission is stored on the CertificateRequest,
//! so a request that is still being processed remotely is only polled on
//! later passes and never submitted twice.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use certwarden_common::crd::{CertificateRequest, GenericIssuer, IssuerStatus, VenafiIssuer};
use certwarden_common::events::{actions, reasons};
use certwarden_pki::CsrInfo;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::context::IssuerContext;
use crate::error::IssuerError;
use crate::secrets::secret_value;
use crate::{IssueResponse, IssuerBackend};

/// Annotation on a CertificateRequest holding the Venafi pickup id
pub const VENAFI_PICKUP_ID_ANNOTATION: &str = "certwarden.io/venafi-pickup-id";

/// Default Venafi Cloud API endpoint
pub const DEFAULT_CLOUD_URL: &str = "https://api.venafi.cloud";

const RETRIEVE_ATTEMPTS: u32 = 5;
const RETRIEVE_INTERVAL: Duration = Duration::from_secs(2);
const VENAFI_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of asking for an issued certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Retrieval {
    /// PEM chain, leaf first
    Issued(String),
    /// Still being processed
    Pending,
    /// Refused by policy or an approver
    Rejected(String),
}

/// Errors from a Venafi endpoint
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VenafiError {
    /// Network failure or server error; retry
    #[error("venafi unavailable: {0}")]
    Unavailable(String),
    /// The request was refused; retrying will not help
    #[error("venafi refused the request: {0}")]
    Refused(String),
}

impl From<reqwest::Error> for VenafiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// One Venafi product's API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VenafiConnector: Send + Sync {
    /// Read the zone's policy; fails if the zone is unknown or unreachable
    async fn read_zone(&self, zone: &str) -> Result<(), VenafiError>;

    /// Submit a CSR; returns the pickup id
    async fn request_certificate(
        &self,
        zone: &str,
        name: &str,
        csr: &str,
    ) -> Result<String, VenafiError>;

    /// Ask once for the certificate of a submitted request
    async fn retrieve_certificate(&self, pickup_id: &str) -> Result<Retrieval, VenafiError>;
}

fn check_status(status: StatusCode, what: &str) -> Result<(), VenafiError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(VenafiError::Unavailable(format!("{} returned HTTP {}", what, status)))
    } else {
        Err(VenafiError::Refused(format!("{} returned HTTP {}", what, status)))
    }
}

/// Trust Protection Platform WebSDK
pub struct TppConnector {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl TppConnector {
    /// Connector for the TPP at `url` using an OAuth bearer `token`
    pub fn new(http: reqwest::Client, url: &str, token: String) -> Self {
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn policy_dn(zone: &str) -> String {
        if zone.starts_with("\\VED\\Policy") {
            zone.to_string()
        } else {
            format!("\\VED\\Policy\\{}", zone.trim_start_matches('\\'))
        }
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, VenafiError> {
        Ok(self
            .http
            .post(format!("{}/vedsdk/{}", self.url, path))
            .timeout(VENAFI_REQUEST_TIMEOUT)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TppRequestResponse {
    #[serde(rename = "CertificateDN")]
    certificate_dn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TppRetrieveResponse {
    certificate_data: String,
}

#[async_trait]
impl VenafiConnector for TppConnector {
    async fn read_zone(&self, zone: &str) -> Result<(), VenafiError> {
        let response = self
            .post(
                "certificates/checkpolicy",
                json!({ "PolicyDN": Self::policy_dn(zone) }),
            )
            .await?;
        check_status(response.status(), "checkpolicy")
    }

    async fn request_certificate(
        &self,
        zone: &str,
        name: &str,
        csr: &str,
    ) -> Result<String, VenafiError> {
        let response = self
            .post(
                "certificates/request",
                json!({
                    "PolicyDN": Self::policy_dn(zone),
                    "ObjectName": name,
                    "PKCS10": csr,
                    "DisableAutomaticRenewal": true,
                }),
            )
            .await?;
        check_status(response.status(), "certificate request")?;
        let body: TppRequestResponse = response.json().await?;
        Ok(body.certificate_dn)
    }

    async fn retrieve_certificate(&self, pickup_id: &str) -> Result<Retrieval, VenafiError> {
        let response = self
            .post(
                "certificates/retrieve",
                json!({
                    "CertificateDN": pickup_id,
                    "Format": "base64",
                    "IncludeChain": true,
                    "RootFirstOrder": false,
                }),
            )
            .await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(Retrieval::Pending);
        }
        check_status(response.status(), "certificate retrieve")?;
        let body: TppRetrieveResponse = response.json().await?;
        let pem = STANDARD
            .decode(body.certificate_data.as_bytes())
            .map_err(|e| VenafiError::Unavailable(format!("bad certificate data: {}", e)))?;
        String::from_utf8(pem)
            .map(Retrieval::Issued)
            .map_err(|e| VenafiError::Unavailable(format!("bad certificate data: {}", e)))
    }
}

/// Venafi Cloud REST API
pub struct CloudConnector {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl CloudConnector {
    /// Connector for Venafi Cloud at `url` using `api_key`
    pub fn new(http: reqwest::Client, url: &str, api_key: String) -> Self {
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.url, path))
            .timeout(VENAFI_REQUEST_TIMEOUT)
            .header("tppl-api-key", &self.api_key)
    }

    async fn zone_id(&self, zone: &str) -> Result<String, VenafiError> {
        let response = self
            .request(reqwest::Method::GET, &format!("v1/zones/tag/{}", zone))
            .send()
            .await?;
        check_status(response.status(), "zone lookup")?;
        let body: CloudZone = response.json().await?;
        Ok(body.id)
    }
}

#[derive(Deserialize)]
struct CloudZone {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudRequests {
    certificate_requests: Vec<CloudRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudRequest {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    certificate_ids: Vec<String>,
    #[serde(default)]
    error_information: Option<serde_json::Value>,
}

#[async_trait]
impl VenafiConnector for CloudConnector {
    async fn read_zone(&self, zone: &str) -> Result<(), VenafiError> {
        self.zone_id(zone).await.map(|_| ())
    }

    async fn request_certificate(
        &self,
        zone: &str,
        _name: &str,
        csr: &str,
    ) -> Result<String, VenafiError> {
        let zone_id = self.zone_id(zone).await?;
        let response = self
            .request(reqwest::Method::POST, "v1/certificaterequests")
            .json(&json!({
                "zoneId": zone_id,
                "certificateSigningRequest": csr,
            }))
            .send()
            .await?;
        check_status(response.status(), "certificate request")?;
        let body: CloudRequests = response.json().await?;
        body.certificate_requests
            .into_iter()
            .next()
            .map(|r| r.id)
            .ok_or_else(|| VenafiError::Unavailable("no request id in response".to_string()))
    }

    async fn retrieve_certificate(&self, pickup_id: &str) -> Result<Retrieval, VenafiError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("v1/certificaterequests/{}", pickup_id),
            )
            .send()
            .await?;
        check_status(response.status(), "request status")?;
        let request: CloudRequest = response.json().await?;
        match request.status.as_str() {
            "ISSUED" => {}
            "FAILED" | "REJECTED" | "REJECTED_APPROVAL" | "CANCELLED" => {
                let detail = request
                    .error_information
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| request.status.clone());
                return Ok(Retrieval::Rejected(detail));
            }
            _ => return Ok(Retrieval::Pending),
        }
        let Some(cert_id) = request.certificate_ids.first() else {
            return Ok(Retrieval::Pending);
        };
        let response = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "v1/certificates/{}/contents?format=PEM&chainOrder=EE_FIRST",
                    cert_id
                ),
            )
            .send()
            .await?;
        check_status(response.status(), "certificate download")?;
        Ok(Retrieval::Issued(response.text().await?))
    }
}

/// Backend for one Venafi issuer
pub struct VenafiBackend {
    ctx: IssuerContext,
    issuer: GenericIssuer,
    config: VenafiIssuer,
    connector: Option<std::sync::Arc<dyn VenafiConnector>>,
}

impl VenafiBackend {
    /// Backend for `issuer`; exactly one of `tpp` and `cloud` must be set
    pub fn new(
        ctx: IssuerContext,
        issuer: GenericIssuer,
        config: VenafiIssuer,
    ) -> Result<Self, IssuerError> {
        match (&config.tpp, &config.cloud) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(IssuerError::validation(
                    "venafi requires exactly one of tpp and cloud",
                ))
            }
        }
        Ok(Self {
            ctx,
            issuer,
            config,
            connector: None,
        })
    }

    /// Use `connector` instead of building one from the configuration
    pub fn with_connector(mut self, connector: std::sync::Arc<dyn VenafiConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    fn connector(&self) -> Result<std::sync::Arc<dyn VenafiConnector>, IssuerError> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }
        let namespace = self.ctx.options.resource_namespace(&self.issuer);
        let secrets = self.ctx.secrets.as_ref();
        if let Some(tpp) = &self.config.tpp {
            let token = secret_value(
                secrets,
                &namespace,
                &tpp.credentials_ref.name,
                tpp.credentials_ref.key_or("access-token"),
            )?;
            return Ok(std::sync::Arc::new(TppConnector::new(
                self.ctx.http.clone(),
                &tpp.url,
                token,
            )));
        }
        if let Some(cloud) = &self.config.cloud {
            let api_key = secret_value(
                secrets,
                &namespace,
                &cloud.api_token_secret_ref.name,
                cloud.api_token_secret_ref.key_or("api-key"),
            )?;
            return Ok(std::sync::Arc::new(CloudConnector::new(
                self.ctx.http.clone(),
                cloud.url.as_deref().unwrap_or(DEFAULT_CLOUD_URL),
                api_key,
            )));
        }
        Err(IssuerError::validation(
            "venafi requires exactly one of tpp and cloud",
        ))
    }

    async fn event(&self, request: &CertificateRequest, type_: EventType, reason: &str, note: String) {
        self.ctx
            .request_event(request, type_, reason, actions::SIGN, note)
            .await;
    }

    /// Submit the CSR and remember the pickup id on the request
    async fn submit(
        &self,
        connector: &dyn VenafiConnector,
        request: &CertificateRequest,
    ) -> Result<Option<String>, IssuerError> {
        if let Err(e) = connector.read_zone(&self.config.zone).await {
            self.event(
                request,
                EventType::Warning,
                reasons::FAILED,
                format!("Failed to read Venafi zone {}: {}", self.config.zone, e),
            )
            .await;
            return Err(IssuerError::transient(e.to_string()));
        }

        let pickup_id = match connector
            .request_certificate(&self.config.zone, &request.name_any(), &request.spec.csr)
            .await
        {
            Ok(id) => id,
            Err(VenafiError::Refused(m)) => {
                self.event(
                    request,
                    EventType::Warning,
                    reasons::FAILED,
                    format!("Venafi refused the request: {}", m),
                )
                .await;
                return Ok(None);
            }
            Err(e) => return Err(IssuerError::transient(e.to_string())),
        };
        info!(request = %request.name_any(), pickup_id = %pickup_id, "Submitted CSR to Venafi");

        let mut annotated = request.clone();
        annotated
            .annotations_mut()
            .insert(VENAFI_PICKUP_ID_ANNOTATION.to_string(), pickup_id.clone());
        self.ctx.requests.update(&annotated).await?;
        Ok(Some(pickup_id))
    }
}

#[async_trait]
impl IssuerBackend for VenafiBackend {
    async fn setup(&self, _status: &mut IssuerStatus) -> Result<(), IssuerError> {
        if self.config.zone.is_empty() {
            return Err(IssuerError::validation("venafi.zone must be set"));
        }
        self.connector()?
            .read_zone(&self.config.zone)
            .await
            .map_err(|e| match e {
                VenafiError::Refused(m) => IssuerError::validation(m),
                VenafiError::Unavailable(m) => IssuerError::transient(m),
            })
    }

    async fn sign(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<IssueResponse>, IssuerError> {
        if let Err(e) = CsrInfo::from_pem(&request.spec.csr) {
            self.event(
                request,
                EventType::Warning,
                reasons::FAILED,
                format!("Request carries an unusable CSR: {}", e),
            )
            .await;
            return Ok(None);
        }
        let connector = self.connector()?;

        let pickup_id = match request.annotations().get(VENAFI_PICKUP_ID_ANNOTATION) {
            Some(id) => id.clone(),
            None => match self.submit(connector.as_ref(), request).await? {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        for attempt in 1..=RETRIEVE_ATTEMPTS {
            match connector.retrieve_certificate(&pickup_id).await {
                Ok(Retrieval::Issued(chain)) => {
                    self.event(
                        request,
                        EventType::Normal,
                        reasons::RETRIEVED,
                        "Retrieved certificate from Venafi".to_string(),
                    )
                    .await;
                    return Ok(Some(IssueResponse {
                        certificate: chain,
                        ca: None,
                    }));
                }
                Ok(Retrieval::Rejected(m)) => {
                    self.event(
                        request,
                        EventType::Warning,
                        reasons::FAILED,
                        format!("Venafi rejected the request: {}", m),
                    )
                    .await;
                    return Ok(None);
                }
                Ok(Retrieval::Pending) => {
                    debug!(pickup_id = %pickup_id, attempt, "Venafi certificate still pending");
                }
                Err(e) => return Err(IssuerError::transient(e.to_string())),
            }
            if attempt < RETRIEVE_ATTEMPTS {
                tokio::time::sleep(RETRIEVE_INTERVAL).await;
            }
        }

        self.event(
            request,
            EventType::Normal,
            reasons::PENDING,
            "Venafi certificate is still pending".to_string(),
        )
        .await;
        Err(IssuerError::transient(format!(
            "venafi certificate {} still pending",
            pickup_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{key_and_csr, request, TestContext};
    use certwarden_common::crd::{
        ClusterIssuer, IssuerKind, IssuerRef, SecretKeySelector, VenafiCloud, VenafiTpp,
    };
    use certwarden_common::store::{ObjectKey, ResourceStore};
    use std::sync::Arc;

    fn config() -> VenafiIssuer {
        VenafiIssuer {
            zone: "Certificates\\Web".to_string(),
            tpp: Some(VenafiTpp {
                url: "https://tpp.test".to_string(),
                credentials_ref: SecretKeySelector {
                    name: "tpp-token".to_string(),
                    key: None,
                },
            }),
            cloud: None,
        }
    }

    fn backend(t: &TestContext, connector: MockVenafiConnector) -> VenafiBackend {
        VenafiBackend::new(
            t.ctx.clone(),
            GenericIssuer::ClusterIssuer(ClusterIssuer::new("venafi", Default::default())),
            config(),
        )
        .expect("config should be valid")
        .with_connector(Arc::new(connector))
    }

    async fn stored_request(t: &TestContext) -> CertificateRequest {
        let (_, csr) = key_and_csr(&["venafi.example.com"]);
        let cr = request(
            "default",
            "web-1",
            csr,
            IssuerRef {
                name: "venafi".to_string(),
                kind: IssuerKind::ClusterIssuer,
            },
        );
        t.requests
            .create(&cr)
            .await
            .expect("request create should succeed")
    }

    // =========================================================================
    // Story: a request is submitted once and picked up later
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn submit_then_retrieve_on_later_pass() {
        let t = TestContext::new();
        let cr = stored_request(&t).await;

        // Chapter 1: zone read, submission, then five pending polls
        let mut connector = MockVenafiConnector::new();
        connector.expect_read_zone().times(1).returning(|_| Ok(()));
        connector
            .expect_request_certificate()
            .times(1)
            .returning(|_, _, _| Ok("\\VED\\Policy\\Web\\web-1".to_string()));
        connector
            .expect_retrieve_certificate()
            .times(RETRIEVE_ATTEMPTS as usize)
            .returning(|_| Ok(Retrieval::Pending));
        let err = backend(&t, connector)
            .sign(&cr)
            .await
            .expect_err("should still be pending");
        assert!(err.is_retryable());
        assert!(t.events.has_reason(reasons::PENDING));

        let annotated = t
            .requests
            .get(&ObjectKey::namespaced("default", "web-1"))
            .expect("request should exist");
        assert_eq!(
            annotated.annotations().get(VENAFI_PICKUP_ID_ANNOTATION).map(String::as_str),
            Some("\\VED\\Policy\\Web\\web-1")
        );

        // Chapter 2: the next pass only retrieves
        let mut connector = MockVenafiConnector::new();
        connector.expect_read_zone().times(0);
        connector.expect_request_certificate().times(0);
        connector
            .expect_retrieve_certificate()
            .withf(|id| id == "\\VED\\Policy\\Web\\web-1")
            .times(1)
            .returning(|_| Ok(Retrieval::Issued("CHAIN".to_string())));
        let response = backend(&t, connector)
            .sign(&annotated)
            .await
            .expect("sign should succeed")
            .expect("should be issued");
        assert_eq!(response.certificate, "CHAIN");
        assert!(t.events.has_reason(reasons::RETRIEVED));
    }

    #[tokio::test]
    async fn unreadable_zone_is_transient() {
        let t = TestContext::new();
        let cr = stored_request(&t).await;
        let mut connector = MockVenafiConnector::new();
        connector
            .expect_read_zone()
            .returning(|_| Err(VenafiError::Unavailable("connection refused".to_string())));
        connector.expect_request_certificate().times(0);

        let err = backend(&t, connector).sign(&cr).await.expect_err("should fail");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn policy_refusal_fails_permanently() {
        let t = TestContext::new();
        let cr = stored_request(&t).await;
        let mut connector = MockVenafiConnector::new();
        connector.expect_read_zone().returning(|_| Ok(()));
        connector
            .expect_request_certificate()
            .returning(|_, _, _| Err(VenafiError::Refused("key size violates policy".to_string())));

        assert!(backend(&t, connector)
            .sign(&cr)
            .await
            .expect("sign should succeed")
            .is_none());
        assert!(t.events.has_reason(reasons::FAILED));
    }

    #[tokio::test]
    async fn unusable_csr_fails_permanently() {
        let t = TestContext::new();
        let mut cr = stored_request(&t).await;
        cr.spec.csr = "garbage".to_string();
        let backend = backend(&t, MockVenafiConnector::new());
        assert!(backend.sign(&cr).await.expect("sign should succeed").is_none());
        assert!(t.events.has_reason(reasons::FAILED));
    }

    #[test]
    fn exactly_one_product_required() {
        let t = TestContext::new();
        let issuer = GenericIssuer::ClusterIssuer(ClusterIssuer::new("v", Default::default()));
        let mut both = config();
        both.cloud = Some(VenafiCloud {
            url: None,
            api_token_secret_ref: SecretKeySelector::default(),
        });
        assert!(VenafiBackend::new(t.ctx.clone(), issuer.clone(), both).is_err());

        let mut neither = config();
        neither.tpp = None;
        assert!(VenafiBackend::new(t.ctx.clone(), issuer, neither).is_err());
    }

    #[test]
    fn tpp_policy_dn_is_rooted() {
        assert_eq!(
            TppConnector::policy_dn("Certificates\\Web"),
            "\\VED\\Policy\\Certificates\\Web"
        );
        assert_eq!(
            TppConnector::policy_dn("\\VED\\Policy\\Web"),
            "\\VED\\Policy\\Web"
        );
    }

    #[test]
    fn venafi_errors_describe_themselves() {
        assert_eq!(
            VenafiError::Unavailable("HTTP 503".to_string()).to_string(),
            "venafi unavailable: HTTP 503"
        );
        assert_eq!(
            VenafiError::Refused("policy".to_string()).to_string(),
            "venafi refused the request: policy"
        );
    }
}
