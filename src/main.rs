use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use modelwatch_k8s::KubeClusterApi;

mod guard;
mod routes;
mod settings;

use routes::AppState;
use settings::{Overrides, Settings};

/// Modelwatch - real-time event streams for KServe InferenceServices
#[derive(Parser, Debug)]
#[command(name = "modelwatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(long, env = "MODELWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level for modelwatch crates when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "modelwatch={level},modelwatch_stream={level},modelwatch_k8s={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::load(args.config.as_deref())
        .context("Failed to load settings")?
        .apply(args.overrides);
    settings.validate()?;

    let api = KubeClusterApi::connect(settings.context.as_deref())
        .await
        .context("Failed to connect to the cluster")?;

    let state = AppState::new(Arc::new(api), &settings);
    let registry = state.registry.clone();
    let api = routes::routes(state, settings.clone());

    // open streams only end once the registry lets go of their channels
    let shutdown = {
        async move {
            shutdown_signal().await;
            registry.shutdown();
        }
    };

    let (addr, server) = warp::serve(api)
        .try_bind_with_graceful_shutdown(settings.listen, shutdown)
        .with_context(|| format!("Failed to bind {}", settings.listen))?;

    info!(
        %addr,
        prefix = %settings.prefix,
        strategy = %settings.strategy,
        isvc_version = %settings.isvc_version,
        "Serving event streams"
    );
    server.await;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
