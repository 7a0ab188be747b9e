//! TPoT CLI - Expose a local HTTP server through a TPoT relay

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::ConfigManager;
use tpot_client::{TunnelConfig, TunnelConnector, TunnelError};

/// Exit status for failures that are not a TunnelError
const EXIT_INTERNAL: u8 = 1;

/// TPoT - Expose local HTTP servers through a TPoT relay
#[derive(Parser, Debug)]
#[command(name = "tpot")]
#[command(about = "Expose local HTTP servers through a TPoT relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// URL of the TPoT server (e.g. https://tpot.example.com)
    #[arg(short = 't', long, env = "TPOT_SERVER", global = true)]
    tpot_server: Option<String>,

    /// Authentication key shared with the server
    #[arg(short = 'k', long, env = "TPOT_AUTH_KEY", hide_env_values = true, global = true)]
    auth_key: Option<String>,

    /// Request a specific subdomain
    #[arg(short, long, global = true)]
    subdomain: Option<String>,

    /// Override the Host request header sent to the target
    #[arg(short = 'H', long, global = true)]
    http_host: Option<String>,

    /// Forward the Host request header unchanged
    #[arg(long, global = true)]
    no_host_rewrite: bool,

    /// Seconds to wait for the target to accept a connection
    #[arg(long, value_name = "SECS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..), global = true)]
    connect_timeout: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a tunnel to an HTTP server
    Http {
        /// Target server (e.g. localhost:3000 or http://127.0.0.1:8080)
        target: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.debug) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_INTERNAL);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Commands::Http { target } = cli.command;

    let stored =
        ConfigManager::load().map_err(|e| TunnelError::ConfigError(format!("{:#}", e)))?;

    let mut builder = TunnelConfig::builder()
        .target(target)
        .auth_key(cli.auth_key.or(stored.auth_key))
        .subdomain(cli.subdomain.or(stored.subdomain))
        .rewrite_host(cli.http_host.or(stored.http_host))
        .no_host_rewrite(cli.no_host_rewrite)
        .connect_timeout(Duration::from_secs(cli.connect_timeout));
    if let Some(server) = cli.tpot_server.or(stored.tpot_server) {
        builder = builder.server(server);
    }
    let config = builder.build()?;
    debug!("Resolved configuration: {:?}", config);

    let target = config.target.to_string();
    let session = TunnelConnector::new(config).connect().await?;

    println!("Tunnel established: {} -> {}", session.tunnel_url(), target);

    session
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Tunnel terminated")?;

    Ok(())
}

/// Map an error to the process exit status
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TunnelError>())
        .map_or(EXIT_INTERNAL, TunnelError::exit_code)
}

/// Setup logging. `RUST_LOG` wins unless `--debug` is given.
fn init_logging(log_level: &str, debug: bool) -> Result<()> {
    let filter = if debug {
        tracing_subscriber::EnvFilter::try_new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
    }
    .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
