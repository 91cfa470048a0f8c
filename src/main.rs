//! Enclave Gateway - host-side gateway for confidential PII detection
//!
//! Launches the Nitro Enclave, supervises the KMS tunnel and serves the
//! HTTP API until interrupted.

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use clap::{Parser, Subcommand, ValueEnum};
use enclave_gateway::{api, config::GatewayConfig, gateway::Gateway};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "enclave-gateway")]
#[command(version)]
#[command(about = "Host-side gateway for confidential PII detection in a Nitro Enclave")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ENCLAVE_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the enclave and serve the HTTP API (default)
    Serve,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_gateway(config).await?,
        Commands::Config => show_config(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("enclave_gateway={},tower_http={}", log_level, log_level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn run_gateway(config: GatewayConfig) -> Result<()> {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.kms.region.clone()))
        .load()
        .await;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let cors_origins = config.server.cors_origins.clone();

    let gateway = Arc::new(Gateway::from_sdk_config(config, &sdk_config)?);
    gateway.start().await.context("Enclave gateway failed to start")?;

    let app = api::build_app(gateway.clone(), &cors_origins);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            gateway.stop().await?;
            return Err(e).with_context(|| format!("Failed to bind {}", addr));
        }
    };
    tracing::info!(addr = %addr, "HTTP API listening. Press Ctrl+C to stop.");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("Shutting down...");
    gateway.stop().await?;

    served.context("HTTP server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn show_config(config: &GatewayConfig) -> Result<()> {
    let toml = toml::to_string_pretty(config)?;
    println!("{}", toml);
    Ok(())
}
