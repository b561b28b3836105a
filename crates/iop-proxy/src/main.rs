use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use iop_proxy::acme::{AcmeController, ChallengeMap};
use iop_proxy::admin::{self, AdminState};
use iop_proxy::cli;
use iop_proxy::config::ProxyConfig;
use iop_proxy::health::HealthMonitor;
use iop_proxy::server::{self, ProxyContext};
use iop_proxy::state::StateStore;
use iop_proxy::tls::CertStore;

#[derive(Parser)]
#[command(name = "iop-proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Edge proxy for iop deployments")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy (the default when no subcommand is given)
    Run,
    /// Show routes and certificate states of the running proxy
    Status,
    /// Show just the route table
    Routes,
    /// Force a certificate back through issuance
    CertRenew { host: String },
    /// Toggle the Let's Encrypt staging directory
    Staging {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Issue one HTTP GET from inside the proxy's network
    Probe {
        url: String,
        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("iop_proxy={}", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ProxyConfig::load(args.config.as_deref())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => cli::status(config.admin_addr).await,
        Command::Routes => cli::routes(config.admin_addr).await,
        Command::CertRenew { host } => cli::cert_renew(config.admin_addr, &host).await,
        Command::Staging { state } => cli::staging(config.admin_addr, state == "on").await,
        Command::Probe { url, timeout } => cli::probe(&url, timeout).await,
    }
}

async fn run(config: ProxyConfig) -> Result<()> {
    info!("[PROXY] starting iop-proxy v{}", env!("CARGO_PKG_VERSION"));

    let store = StateStore::open(config.state_path())
        .await
        .context("opening state store")?;

    let certs = Arc::new(CertStore::new(config.certs_dir()));
    let challenges = Arc::new(ChallengeMap::new());

    let acme = AcmeController::new(
        store.clone(),
        certs.clone(),
        challenges.clone(),
        config.account_key_path(),
        config.acme_contact.clone(),
    );
    acme.start().await;

    let monitor = HealthMonitor::new(store.clone()).context("building health monitor")?;
    monitor.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_state = AdminState {
        store: store.clone(),
        acme: acme.clone(),
        monitor: monitor.clone(),
    };
    let admin_task = tokio::spawn(admin::serve(
        admin_state,
        config.admin_addr,
        shutdown_rx.clone(),
    ));

    let ctx = ProxyContext::new(
        store.clone(),
        certs,
        challenges,
        Duration::from_secs(config.request_timeout_secs),
    );
    let server_task = tokio::spawn(server::run(ctx, shutdown_rx));

    wait_for_termination().await?;
    info!("[PROXY] shutdown signal received");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("server", server_task), ("admin", admin_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[PROXY] {name} exited with error: {e}"),
            Err(e) => error!("[PROXY] {name} task panicked: {e}"),
        }
    }

    store.flush().await.context("final state flush")?;
    info!("[PROXY] shutdown complete");
    Ok(())
}

async fn wait_for_termination() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    Ok(())
}
