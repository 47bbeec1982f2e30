//! Service binary: config, tracing, runtime, HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tessera_runtime::{Runtime, RuntimeConfig};
use tessera_server::{build_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "tessera-server", about = "Tessera workflow orchestration service")]
struct Args {
    /// Path to a TOML configuration file (TESSERA_* env vars override it).
    #[arg(long)]
    config: Option<String>,

    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Log filter (overrides RUST_LOG).
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = RuntimeConfig::load(args.config.as_deref())?;
    let runtime = Runtime::new(config).await?;

    let state = AppState {
        engine: runtime.engine().clone(),
        blueprints: runtime.blueprints().clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "tessera server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    runtime.shutdown().await?;
    Ok(())
}
