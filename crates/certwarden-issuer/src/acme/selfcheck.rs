//! Local verification of presented challenges
//!
//! Run before asking the ACME server to validate, so a proof that is not
//! yet visible does not burn a validation attempt.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use super::error::AcmeError;

const HTTP_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes that a challenge proof is publicly visible
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SelfChecker: Send + Sync {
    /// Whether `url` answers with exactly `expected`
    async fn check_http01(&self, url: &str, expected: &str) -> Result<bool, AcmeError>;

    /// Whether `fqdn` has a TXT record equal to `expected`
    ///
    /// `nameservers` (`host:port`) override the system resolver when set.
    async fn check_dns01(
        &self,
        fqdn: &str,
        expected: &str,
        nameservers: &[String],
    ) -> Result<bool, AcmeError>;
}

/// Self-checker using `reqwest` for HTTP-01 and `hickory-resolver` for DNS-01
#[derive(Clone, Debug)]
pub struct NetworkSelfChecker {
    client: reqwest::Client,
}

impl NetworkSelfChecker {
    /// Checker using `client` for HTTP self-checks
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn resolver(nameservers: &[String]) -> Result<TokioResolver, AcmeError> {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ns in nameservers {
                let addr: SocketAddr = ns.parse().map_err(|e| AcmeError::SelfCheck {
                    domain: ns.clone(),
                    message: format!("invalid nameserver address: {}", e),
                })?;
                config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        // Every lookup must see the authoritative answer, not a cached miss.
        opts.cache_size = 0;

        Ok(
            Resolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build(),
        )
    }
}

#[async_trait]
impl SelfChecker for NetworkSelfChecker {
    async fn check_http01(&self, url: &str, expected: &str) -> Result<bool, AcmeError> {
        let response = self
            .client
            .get(url)
            .timeout(HTTP_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| AcmeError::SelfCheck {
                domain: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "HTTP-01 self check got error status");
            return Ok(false);
        }
        let body = response.text().await.map_err(|e| AcmeError::SelfCheck {
            domain: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(body.trim() == expected)
    }

    async fn check_dns01(
        &self,
        fqdn: &str,
        expected: &str,
        nameservers: &[String],
    ) -> Result<bool, AcmeError> {
        let resolver = Self::resolver(nameservers)?;
        let lookup = match resolver.txt_lookup(fqdn).await {
            Ok(lookup) => lookup,
            Err(e) => {
                // NXDOMAIN and empty answers are expected until the record propagates.
                trace!(fqdn = %fqdn, error = %e, "TXT lookup failed");
                return Ok(false);
            }
        };
        for record in lookup.iter() {
            let value: String = record
                .txt_data()
                .iter()
                .map(|data| String::from_utf8_lossy(data))
                .collect();
            if value == expected {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
