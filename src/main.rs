mod auth;
mod build;
mod config;
mod git;
mod health;
mod http;
mod metrics;
mod singleflight;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::store::TokenStore;
use crate::build::{BuildOutcome, BuildRunner};
use crate::config::Config;
use crate::metrics::{BuildLabels, BuildOutcomeLabel, Metrics};
use crate::sync::engine::Synchronizer;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "forgebench",
    about = "Git working-tree/bare-repo synchronization server"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgebench/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Token signing secret, resolved once from the configured env var.
    pub auth_secret: Arc<Vec<u8>>,
    pub tokens: Arc<TokenStore>,
    pub sync: Arc<Synchronizer>,
    pub build: Arc<BuildRunner>,
    pub metrics: Arc<Metrics>,
}

// ---------------------------------------------------------------------------
// Build runner wiring
// ---------------------------------------------------------------------------

/// Wire build-pipeline callbacks to logs and metrics; job persistence is an
/// external concern.
fn build_runner(config: &Config, metrics: Arc<Metrics>) -> BuildRunner {
    BuildRunner::new(config.repos.workdir_path(), config.build.clone())
        .with_on_start(Arc::new(|| {
            tracing::info!("build job started");
        }))
        .with_on_progress(Arc::new(|line, stream, percent| {
            tracing::debug!(%stream, percent, output = %line, "build progress");
        }))
        .with_on_complete(Arc::new(move |result: &Result<BuildOutcome>| {
            let outcome = match result {
                Ok(outcome) => {
                    tracing::info!(exit_code = outcome.exit_code, "build job completed");
                    BuildOutcomeLabel::Success
                }
                Err(err) => {
                    tracing::error!(error = %err, "build job failed");
                    BuildOutcomeLabel::Failure
                }
            };
            metrics
                .build_total
                .get_or_create(&BuildLabels { outcome })
                .inc();
        }))
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting forgebench");

    // ---- Signing secret ----
    let auth_secret = std::env::var(&config.auth.secret_env)
        .with_context(|| format!("{} is not set", config.auth.secret_env))?;
    anyhow::ensure!(!auth_secret.is_empty(), "token signing secret is empty");
    let auth_secret = Arc::new(auth_secret.into_bytes());

    // ---- Repository directories ----
    tokio::fs::create_dir_all(&config.repos.root)
        .await
        .with_context(|| format!("failed to create repos directory: {}", config.repos.root))?;

    // ---- Token store ----
    let tokens = Arc::new(
        TokenStore::open(std::path::Path::new(&config.auth.db_path))
            .context("failed to open token store")?,
    );

    // ---- Metrics ----
    let metrics = Arc::new(Metrics::new());

    // ---- Synchronizer ----
    let synchronizer = Arc::new(Synchronizer::new(
        config.repos.workdir_path(),
        config.repos.bare_path(),
        config.repos.default_branch.clone(),
        Duration::from_millis(config.sync.restore_delay_ms),
    ));

    // Bootstrap the bare mirror from the working tree.  A workdir that is
    // not (yet) a git repository is logged and skipped, not fatal.
    match synchronizer.bootstrap().await {
        Ok(true) => tracing::info!("bare repository bootstrapped from working tree"),
        Ok(false) => tracing::debug!("bare repository bootstrap not needed"),
        Err(err) => tracing::error!(error = %err, "bare repository bootstrap failed"),
    }

    // Installed dependencies must stay out of the status matrix, or every
    // sync pass would try to commit them.
    let workdir = config.repos.workdir_path();
    let gitignore = workdir.join(".gitignore");
    if workdir.join(".git").exists() && !gitignore.exists() {
        if let Err(err) = tokio::fs::write(&gitignore, "node_modules\n").await {
            tracing::warn!(error = %err, "failed to create workdir .gitignore");
        }
    }

    // ---- Build runner ----
    let build = Arc::new(build_runner(&config, Arc::clone(&metrics)));

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        auth_secret,
        tokens,
        sync: Arc::clone(&synchronizer),
        build,
        metrics,
    });

    // ---- Serve until shutdown ----
    run_http_server(Arc::clone(&state)).await?;

    // Let an in-flight deferred stash restore finish before exiting.
    synchronizer.wait_for_pending_restore().await;

    tracing::info!("forgebench shut down cleanly");
    Ok(())
}
