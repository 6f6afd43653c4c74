//! certwarden - certificate management controller for Kubernetes

mod http01;
mod stores;

use std::net::SocketAddr;
use std::sync::Arc;

use certwarden_common::crd::{
    Certificate, CertificateRequest, Challenge, ClusterIssuer, Issuer, Order,
};
use certwarden_common::duration::parse_duration;
use certwarden_common::events::KubeEventPublisher;
use certwarden_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use certwarden_common::{Duration, DEFAULT_CLUSTER_RESOURCE_NAMESPACE};
use certwarden_controller::{default_registry, ControllerContext, DEFAULT_WORKERS};
use certwarden_issuer::acme::{
    AcmeAccounts, ChallengeSolver, Http01Responder, InstantAcmeClientFactory, NetworkSelfChecker,
    WebhookDnsProvider,
};
use certwarden_issuer::{IssuerContext, IssuerFactory, IssuerOptions};
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::stores::KubeStores;

/// Issues and renews X.509 certificates declared as Kubernetes resources
#[derive(Parser, Debug)]
#[command(name = "certwarden", version, about, long_about = None)]
struct Cli {
    /// Print all CRD manifests as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Namespace holding Secrets referenced by ClusterIssuers
    #[arg(long, env = "CLUSTER_RESOURCE_NAMESPACE", default_value = DEFAULT_CLUSTER_RESOURCE_NAMESPACE)]
    cluster_resource_namespace: String,

    /// Allow namespaced Issuers to use ambient credentials
    #[arg(long, env = "ISSUER_AMBIENT_CREDENTIALS", default_value_t = false, action = clap::ArgAction::Set)]
    issuer_ambient_credentials: bool,

    /// Allow ClusterIssuers to use ambient credentials
    #[arg(long, env = "CLUSTER_ISSUER_AMBIENT_CREDENTIALS", default_value_t = true, action = clap::ArgAction::Set)]
    cluster_issuer_ambient_credentials: bool,

    /// Renew-before applied to Certificates that set none (Go duration syntax)
    #[arg(long, env = "RENEW_BEFORE_EXPIRY_DURATION", default_value = "720h", value_parser = parse_duration)]
    renew_before_expiry_duration: Duration,

    /// Workers per controller
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Address of the HTTP-01 responder
    #[arg(long, env = "HTTP01_LISTEN", default_value = "0.0.0.0:8089")]
    http01_listen: SocketAddr,

    /// Comma separated controllers to start; all when unset
    #[arg(long, env = "CONTROLLERS", value_delimiter = ',')]
    controllers: Option<Vec<String>>,

    /// Log format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    fn issuer_options(&self) -> IssuerOptions {
        IssuerOptions {
            cluster_resource_namespace: self.cluster_resource_namespace.clone(),
            issuer_ambient_credentials: self.issuer_ambient_credentials,
            cluster_issuer_ambient_credentials: self.cluster_issuer_ambient_credentials,
            renew_before_expiry_duration: self.renew_before_expiry_duration,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crds = [
            Certificate::crd(),
            CertificateRequest::crd(),
            Issuer::crd(),
            ClusterIssuer::crd(),
            Order::crd(),
            Challenge::crd(),
        ];
        for crd in crds {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("failed to install the aws-lc-rs crypto provider: {:?}", e);
    }

    init_telemetry(TelemetryConfig {
        log_format: cli.log_format,
        ..Default::default()
    })?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let shutdown = CancellationToken::new();

    let stores = KubeStores::new(client.clone());
    let watches = stores.spawn_watches(&shutdown);
    stores.wait_until_ready().await?;

    let http = reqwest::Client::new();
    let issuer = IssuerContext {
        secrets: stores.secrets.clone(),
        requests: stores.requests.clone(),
        orders: stores.orders.clone(),
        events: Arc::new(KubeEventPublisher::new(client, "certwarden-controller")),
        accounts: Arc::new(AcmeAccounts::new(Arc::new(InstantAcmeClientFactory))),
        options: cli.issuer_options(),
        http: http.clone(),
    };
    let responder = Http01Responder::new();
    let ctx = ControllerContext {
        backends: Arc::new(IssuerFactory::new(issuer.clone())),
        issuer,
        certificates: stores.certificates.clone(),
        issuers: stores.issuers.clone(),
        cluster_issuers: stores.cluster_issuers.clone(),
        challenges: stores.challenges.clone(),
        solver: ChallengeSolver::new(
            responder.clone(),
            Arc::new(WebhookDnsProvider::new(http.clone())),
            Arc::new(NetworkSelfChecker::new(http)),
            stores.secrets.clone(),
        ),
        workers: cli.workers,
    };

    let http01 = tokio::spawn(http01::serve(cli.http01_listen, responder, shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        signal.cancel();
    });

    let registry = default_registry()?;
    registry
        .run(&ctx, cli.controllers.as_deref(), shutdown.clone())
        .await?;

    shutdown.cancel();
    match http01.await {
        Ok(Err(e)) => error!(error = %e, "HTTP-01 responder failed"),
        Err(e) => error!(error = %e, "HTTP-01 responder task failed"),
        Ok(Ok(())) => {}
    }
    for watch in watches {
        watch.abort();
    }
    info!("certwarden stopped");
    Ok(())
}
