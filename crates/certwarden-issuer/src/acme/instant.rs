//! [`AcmeClient`] backed by `instant-acme`

use async_trait::async_trait;
use certwarden_common::crd::ChallengeType;
use certwarden_common::metrics::record_acme_request;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeStatus, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tracing::{debug, info};

use super::client::{
    AcmeClient, RemoteAuthorization, RemoteChallenge, RemoteChallengeStatus, RemoteOrder,
    RemoteOrderStatus,
};
use super::error::AcmeError;

/// ACME account handle
pub struct InstantAcmeClient {
    account: Account,
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("account", &self.account.id())
            .finish()
    }
}

impl InstantAcmeClient {
    /// Register a new account; returns the client and its serialized credentials
    pub async fn register(server: &str, email: Option<&str>) -> Result<(Self, String), AcmeError> {
        let contact = email.map(|e| format!("mailto:{}", e));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        info!(server = %server, email = ?email, "Registering ACME account");
        let result = Account::builder()
            .map_err(|e| AcmeError::AccountRegistration(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &contacts,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                server.to_owned(),
                None,
            )
            .await;
        record_acme_request("new-account", result.is_ok());
        let (account, credentials) = result?;

        let json = serde_json::to_string(&credentials).map_err(|e| {
            AcmeError::AccountRegistration(format!("failed to serialize credentials: {}", e))
        })?;
        Ok((Self { account }, json))
    }

    /// Load an account from previously stored credentials
    pub async fn from_credentials(json: &str) -> Result<Self, AcmeError> {
        let credentials: AccountCredentials = serde_json::from_str(json).map_err(|e| {
            AcmeError::AccountRegistration(format!("failed to deserialize credentials: {}", e))
        })?;
        let account = Account::builder()
            .map_err(|e| AcmeError::AccountRegistration(e.to_string()))?
            .from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::AccountRegistration(e.to_string()))?;
        Ok(Self { account })
    }

    async fn load_order(&self, order_url: &str) -> Result<Order, AcmeError> {
        let result = self.account.order(order_url.to_owned()).await;
        record_acme_request("get-order", result.is_ok());
        Ok(result?)
    }
}

fn order_status(status: OrderStatus) -> RemoteOrderStatus {
    match status {
        OrderStatus::Pending => RemoteOrderStatus::Pending,
        OrderStatus::Ready => RemoteOrderStatus::Ready,
        OrderStatus::Processing => RemoteOrderStatus::Processing,
        OrderStatus::Valid => RemoteOrderStatus::Valid,
        OrderStatus::Invalid => RemoteOrderStatus::Invalid,
    }
}

fn challenge_status(status: ChallengeStatus) -> RemoteChallengeStatus {
    match status {
        ChallengeStatus::Pending => RemoteChallengeStatus::Pending,
        ChallengeStatus::Processing => RemoteChallengeStatus::Processing,
        ChallengeStatus::Valid => RemoteChallengeStatus::Valid,
        ChallengeStatus::Invalid => RemoteChallengeStatus::Invalid,
    }
}

fn challenge_type(type_: &instant_acme::ChallengeType) -> Option<ChallengeType> {
    match type_ {
        instant_acme::ChallengeType::Http01 => Some(ChallengeType::Http01),
        instant_acme::ChallengeType::Dns01 => Some(ChallengeType::Dns01),
        _ => None,
    }
}

fn acme_type(type_: ChallengeType) -> instant_acme::ChallengeType {
    match type_ {
        ChallengeType::Http01 => instant_acme::ChallengeType::Http01,
        ChallengeType::Dns01 => instant_acme::ChallengeType::Dns01,
    }
}

/// Key authorization for `token` given a key authorization issued for `other`
///
/// A key authorization is `token.thumbprint` (RFC 8555 §8.1) and the account
/// thumbprint is shared by every challenge.
fn key_authorization_for(token: &str, other_token: &str, other: &str) -> Option<String> {
    let thumbprint = other.strip_prefix(other_token)?.strip_prefix('.')?;
    Some(format!("{}.{}", token, thumbprint))
}

/// Offered HTTP-01 and DNS-01 challenges of one authorization, without key
/// authorizations
fn offered_challenges(authz: &instant_acme::AuthorizationState) -> Vec<(String, String, ChallengeType)> {
    authz
        .challenges
        .iter()
        .filter_map(|c| challenge_type(&c.r#type).map(|t| (c.url.clone(), c.token.clone(), t)))
        .collect()
}

/// Read the order and all of its authorizations
async fn snapshot(order: &mut Order) -> Result<RemoteOrder, AcmeError> {
    let url = order.url().to_owned();
    let state = order.refresh().await?;
    let status = order_status(state.status);
    let finalize_url = state.finalize.clone();
    let error = state
        .error
        .as_ref()
        .map(|p| p.detail.clone().unwrap_or_else(|| p.to_string()));

    let mut pending = Vec::new();
    // (token, key authorization) of one challenge, enough to derive all others
    let mut sample: Option<(String, String)> = None;
    let mut authzs = order.authorizations();
    while let Some(result) = authzs.next().await {
        let mut authz = result?;
        let (identifier, wildcard) = {
            let id = authz.identifier();
            match &id.identifier {
                Identifier::Dns(domain) => (domain.clone(), id.wildcard),
                _ => continue,
            }
        };
        let authz_url = authz.url().to_owned();
        let valid = authz.status == AuthorizationStatus::Valid;
        let offered = offered_challenges(&authz);
        let first = offered.first().map(|(_, token, type_)| (token.clone(), *type_));
        pending.push((authz_url, identifier, wildcard, valid, offered));

        // The handle borrows the authorization for good, so it is taken last.
        if sample.is_none() {
            if let Some((token, type_)) = first {
                if let Some(handle) = authz.challenge(acme_type(type_)) {
                    sample = Some((token, handle.key_authorization().as_str().to_string()));
                }
            }
        }
    }

    let mut authorizations = Vec::with_capacity(pending.len());
    for (authz_url, identifier, wildcard, valid, offered) in pending {
        let mut challenges = Vec::with_capacity(offered.len());
        for (challenge_url, token, type_) in offered {
            let key_authorization = sample
                .as_ref()
                .and_then(|(other_token, other)| key_authorization_for(&token, other_token, other))
                .ok_or_else(|| {
                    AcmeError::Protocol(format!(
                        "no key authorization available for challenge {}",
                        challenge_url
                    ))
                })?;
            challenges.push(RemoteChallenge {
                url: challenge_url,
                token,
                type_,
                key_authorization,
            });
        }
        authorizations.push(RemoteAuthorization {
            url: authz_url,
            identifier,
            wildcard,
            valid,
            challenges,
        });
    }

    Ok(RemoteOrder {
        url,
        finalize_url,
        status,
        authorizations,
        error,
    })
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    fn account_url(&self) -> String {
        self.account.id().to_string()
    }

    async fn create_order(&self, dns_names: &[String]) -> Result<RemoteOrder, AcmeError> {
        let identifiers: Vec<Identifier> = dns_names
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();
        debug!(domains = ?dns_names, "Creating ACME order");

        let result = self.account.new_order(&NewOrder::new(&identifiers)).await;
        record_acme_request("new-order", result.is_ok());
        let mut order = result?;
        snapshot(&mut order).await
    }

    async fn get_order(&self, order_url: &str) -> Result<RemoteOrder, AcmeError> {
        let mut order = self.load_order(order_url).await?;
        snapshot(&mut order).await
    }

    async fn accept_challenge(
        &self,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        let mut order = self.load_order(order_url).await?;
        let mut authzs = order.authorizations();
        while let Some(result) = authzs.next().await {
            let mut authz = result?;
            let matching = authz
                .challenges
                .iter()
                .find(|c| c.url == challenge_url)
                .map(|c| c.r#type.clone());
            if let Some(type_) = matching {
                if let Some(mut challenge) = authz.challenge(type_) {
                    let result = challenge.set_ready().await;
                    record_acme_request("accept-challenge", result.is_ok());
                    return Ok(result?);
                }
            }
        }
        Err(AcmeError::Protocol(format!(
            "challenge {} not found in order {}",
            challenge_url, order_url
        )))
    }

    async fn challenge_status(
        &self,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(RemoteChallengeStatus, Option<String>), AcmeError> {
        let mut order = self.load_order(order_url).await?;
        let mut authzs = order.authorizations();
        while let Some(result) = authzs.next().await {
            let authz = result?;
            if let Some(c) = authz.challenges.iter().find(|c| c.url == challenge_url) {
                let detail = c
                    .error
                    .as_ref()
                    .map(|p| p.detail.clone().unwrap_or_else(|| p.to_string()));
                return Ok((challenge_status(c.status), detail));
            }
        }
        Err(AcmeError::Protocol(format!(
            "challenge {} not found in order {}",
            challenge_url, order_url
        )))
    }

    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<RemoteOrder, AcmeError> {
        let mut order = self.load_order(order_url).await?;
        let result = order.finalize_csr(csr_der).await;
        record_acme_request("finalize", result.is_ok());
        result?;
        snapshot(&mut order).await
    }

    async fn certificate(&self, order_url: &str) -> Result<Option<String>, AcmeError> {
        let mut order = self.load_order(order_url).await?;
        let result = order.certificate().await;
        record_acme_request("certificate", result.is_ok());
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_authorization_reuses_the_account_thumbprint() {
        assert_eq!(
            key_authorization_for("tok2", "tok1", "tok1.thumb").as_deref(),
            Some("tok2.thumb")
        );
    }

    #[test]
    fn key_authorization_needs_a_matching_sample() {
        assert!(key_authorization_for("tok2", "tok1", "other.thumb").is_none());
        assert!(key_authorization_for("tok2", "tok1", "tok1thumb").is_none());
    }

    #[test]
    fn only_http01_and_dns01_are_mapped() {
        assert_eq!(
            challenge_type(&instant_acme::ChallengeType::Http01),
            Some(ChallengeType::Http01)
        );
        assert_eq!(
            challenge_type(&instant_acme::ChallengeType::Dns01),
            Some(ChallengeType::Dns01)
        );
        assert_eq!(challenge_type(&instant_acme::ChallengeType::TlsAlpn01), None);
    }
}
