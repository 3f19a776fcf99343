//! Dashboard backend - relays DevWorkspace watches to browser dashboards

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dashboard_api::cluster_client::{CA_CERT_PATH, DEFAULT_API_URL};
use dashboard_api::credential::SA_TOKEN_PATH;
use dashboard_api::subscription::{DEFAULT_MAX_CHANNELS, DEFAULT_MAX_WATCHERS};
use dashboard_api::{
    start_server, AppState, BackoffConfig, ClusterClientFactory, ClusterConfig,
    CredentialResolver, FileServiceCredential, RegistryConfig, ReqwestClientFactory,
    ResolverMode, ServerConfig, ServiceCredentialSource,
};

/// Dashboard backend - real-time DevWorkspace watch bridge
#[derive(Parser, Debug)]
#[command(name = "dashboard-backend", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "DASHBOARD_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Kubernetes API server URL
    #[arg(long, env = "CLUSTER_API_URL", default_value = DEFAULT_API_URL)]
    cluster_api_url: String,

    /// CA bundle for the API server (defaults to the in-cluster CA when present)
    #[arg(long, env = "CLUSTER_CA_PATH")]
    cluster_ca_path: Option<PathBuf>,

    /// Skip API server certificate verification (development only)
    #[arg(long, env = "INSECURE_SKIP_TLS_VERIFY")]
    insecure_skip_tls_verify: bool,

    /// How client tokens become cluster credentials
    #[arg(long, env = "CREDENTIAL_MODE", default_value_t = ResolverMode::Passthrough)]
    credential_mode: ResolverMode,

    /// Service account token used for TokenReview and impersonation
    #[arg(long, env = "SERVICE_ACCOUNT_TOKEN_PATH", default_value = SA_TOKEN_PATH)]
    service_account_token_path: PathBuf,

    /// Client certificate bundle used instead of the service account token
    #[arg(long, env = "SERVICE_ACCOUNT_CERT_PATH")]
    service_account_cert_path: Option<PathBuf>,

    /// Audiences requested in TokenReview (comma separated)
    #[arg(long, env = "TOKEN_REVIEW_AUDIENCES", value_delimiter = ',')]
    token_review_audiences: Vec<String>,

    /// Channels one connection may hold
    #[arg(long, env = "MAX_CHANNELS_PER_CONNECTION", default_value_t = DEFAULT_MAX_CHANNELS)]
    max_channels: usize,

    /// Upstream watches one connection may hold
    #[arg(long, env = "MAX_WATCHERS_PER_CONNECTION", default_value_t = DEFAULT_MAX_WATCHERS)]
    max_watchers: usize,

    /// Consecutive watch failures before giving up (0 = never)
    #[arg(long, env = "WATCH_MAX_FAILURES", default_value_t = 10)]
    watch_max_failures: u32,

    /// Longest delay between watch reconnects, in seconds
    #[arg(long, env = "WATCH_BACKOFF_MAX_SECS", default_value_t = 30)]
    watch_backoff_max_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let json_layer = cli.log_json.then(|| fmt::layer().json());
    let text_layer = (!cli.log_json).then(|| fmt::layer());
    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cluster = ClusterConfig {
        api_url: cli.cluster_api_url.clone(),
        ca_cert_path: cli.cluster_ca_path.clone().or_else(|| {
            Path::new(CA_CERT_PATH)
                .exists()
                .then(|| PathBuf::from(CA_CERT_PATH))
        }),
        insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
        ..ClusterConfig::default()
    };
    let factory: Arc<dyn ClusterClientFactory> = Arc::new(
        ReqwestClientFactory::new(cluster)
            .await
            .context("Failed to create cluster client factory")?,
    );

    let resolver = build_resolver(&cli, factory.clone());
    info!(
        mode = %resolver.mode(),
        api_url = %cli.cluster_api_url,
        "Credential resolver ready"
    );

    let registry = RegistryConfig {
        max_channels: cli.max_channels,
        max_watchers: cli.max_watchers,
        backoff: BackoffConfig {
            max_delay: Duration::from_secs(cli.watch_backoff_max_secs.max(1)),
            max_consecutive_failures: cli.watch_max_failures,
            ..BackoffConfig::default()
        },
        ..RegistryConfig::default()
    };

    let state = AppState {
        resolver: Arc::new(resolver),
        factory,
        registry,
    };

    start_server(
        ServerConfig {
            addr: cli.listen_addr,
        },
        state,
    )
    .await
    .context("Dashboard backend failed")?;

    Ok(())
}

/// Build the credential resolver for the configured mode
fn build_resolver(cli: &Cli, factory: Arc<dyn ClusterClientFactory>) -> CredentialResolver {
    if cli.credential_mode == ResolverMode::Passthrough {
        return CredentialResolver::passthrough();
    }

    let service: Arc<dyn ServiceCredentialSource> = match &cli.service_account_cert_path {
        Some(path) => Arc::new(FileServiceCredential::Certificate(path.clone())),
        None => Arc::new(FileServiceCredential::Token(
            cli.service_account_token_path.clone(),
        )),
    };

    let resolver = CredentialResolver::new(cli.credential_mode, service, factory);
    if cli.token_review_audiences.is_empty() {
        resolver
    } else {
        resolver.with_audiences(cli.token_review_audiences.clone())
    }
}
