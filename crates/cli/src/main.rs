use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use gatesync_controller::{Controller, SyncConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

mod http;

/// Flags override the matching `GATESYNC_*` variables.
#[derive(Parser, Debug)]
#[command(name = "gatesyncd", version, about = "Keeps an API gateway in sync with its cluster resources")]
struct Cli {
    /// Log filter (tracing EnvFilter syntax)
    #[arg(long = "log", env = "GATESYNC_LOG", default_value = "info")]
    log: String,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Explicit API server URL instead of the inferred one
    #[arg(long = "api-url")]
    api_url: Option<String>,

    /// Address for the admission webhook and health endpoints
    #[arg(long = "listen")]
    webhook_addr: Option<SocketAddr>,

    /// Address for the Prometheus exporter
    #[arg(long = "metrics-addr")]
    metrics_addr: Option<SocketAddr>,

    /// Serve admission only; do not watch or reconcile
    #[arg(long = "no-sync", action = ArgAction::SetTrue)]
    no_sync: bool,

    #[arg(long = "max-retries")]
    max_retries: Option<u32>,

    #[arg(long = "drain-interval-ms")]
    drain_interval_ms: Option<u64>,
}

impl Cli {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(ns) = &self.namespace {
            config.namespace = ns.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = Some(url.clone());
        }
        if let Some(addr) = self.webhook_addr {
            config.webhook_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = Some(addr);
        }
        if self.no_sync {
            config.enabled = false;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        match self.drain_interval_ms {
            Some(0) => warn!("--drain-interval-ms 0 ignored; a period must be positive"),
            Some(ms) => config.drain_interval_ms = ms,
            None => {}
        }
        config
    }
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    let config = cli.apply(SyncConfig::from_env());
    init_metrics(config.metrics_addr);
    info!(config = ?config, "starting gatesyncd");

    let controller = Controller::connect(config).await.context("wiring controller")?;
    controller.orchestrator.start()?;

    let addr = controller.config.webhook_addr;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "webhook listening");
    let served = axum::serve(listener, http::router(http::AppState::from(&controller)))
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "waiting for ctrl-c failed");
            }
            info!("shutdown requested");
        })
        .await;

    controller.orchestrator.stop().await;
    served.context("serving webhook")?;
    Ok(())
}
