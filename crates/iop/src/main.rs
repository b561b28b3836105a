use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use iop::commands::{deploy, init, proxy, status};
use iop::config::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = "iop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Zero-downtime Docker deployments to your own servers")]
struct Cli {
    /// Project file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build, ship, and roll out services
    Deploy {
        /// Services to deploy; all of them when omitted
        services: Vec<String>,
    },
    /// Show live container and proxy state per server
    Status,
    /// Scaffold iop.yml and .iop/secrets in the current directory
    Init,
    /// Operate the edge proxy on the project's servers
    Proxy {
        #[command(subcommand)]
        action: ProxyCommand,
    },
}

#[derive(Subcommand)]
enum ProxyCommand {
    /// Container state and the admin API's route summary
    Status,
    /// Pull the configured proxy image and recreate the container
    Update,
    /// Tail the proxy container's logs
    Logs {
        #[arg(long, default_value_t = 100)]
        tail: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "iop=debug" } else { "iop=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let outcome = match cli.command {
        Command::Deploy { services } => {
            deploy::run(deploy::DeployArgs {
                config_path: cli.config,
                services,
            })
            .await
        }
        Command::Status => status::run(&cli.config).await.map(|()| true),
        Command::Init => init::run(std::path::Path::new(".")).map(|()| true),
        Command::Proxy { action } => {
            let action = match action {
                ProxyCommand::Status => proxy::ProxyAction::Status,
                ProxyCommand::Update => proxy::ProxyAction::Update,
                ProxyCommand::Logs { tail } => proxy::ProxyAction::Logs { tail },
            };
            proxy::run(&cli.config, action).await.map(|()| true)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("[CLI] {e:#}");
            ExitCode::from(1)
        }
    }
}
