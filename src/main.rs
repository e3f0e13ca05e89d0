//! jobdeck - session-scoped job server
//!
//! Serves the HTTP API: per-session config and target list, job runs
//! streamed as server-sent events, and artifact listing and download.
//! Settings come from an optional TOML file with command-line overrides.

use clap::Parser;
use jobdeck::{
    api::{self, resolve::SessionCarriage, AppState, RouterConfig},
    artifacts::ArtifactStore,
    config::{ConfigError, Settings},
    gc,
    job::JobRunner,
    session::SessionRegistry,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// jobdeck - session-scoped job server
///
/// Runs an external worker per browser session and streams its output.
#[derive(Parser, Debug)]
#[command(name = "jobdeck", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long, env = "JOBDECK_CONFIG", default_value = "jobdeck.toml")]
    config: PathBuf,

    /// Address to bind the HTTP API
    #[arg(long, env = "JOBDECK_BIND")]
    bind: Option<SocketAddr>,

    /// Data directory; artifacts live under <data-dir>/downloads
    #[arg(long, env = "JOBDECK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Worker program and leading arguments, given after `--`
    #[arg(last = true, value_name = "WORKER")]
    worker: Vec<String>,

    /// Idle time before a session is evicted
    #[arg(long, env = "JOBDECK_SESSION_TTL_SECS")]
    session_ttl_secs: Option<u64>,

    /// Interval between eviction sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Per-IP request rate limit (requests per second)
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Allowed CORS origin (repeatable)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,
}

#[derive(Debug, Error)]
pub enum JobdeckError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Cli {
    /// File settings with command-line overrides applied.
    fn settings(&self) -> Result<Settings, JobdeckError> {
        let mut settings = Settings::load(&self.config)?.unwrap_or_default();
        if let Some(bind) = self.bind {
            settings.server.bind = bind;
        }
        if let Some(ref dir) = self.data_dir {
            settings.server.data_dir = dir.clone();
        }
        if !self.worker.is_empty() {
            settings.worker.command = self.worker.clone();
        }
        if let Some(ttl) = self.session_ttl_secs {
            settings.session.ttl_secs = ttl;
        }
        if let Some(interval) = self.sweep_interval_secs {
            settings.session.sweep_interval_secs = interval;
        }
        if self.rate_limit.is_some() {
            settings.server.rate_limit = self.rate_limit;
        }
        if !self.cors_origins.is_empty() {
            settings.server.cors_origins = self.cors_origins.clone();
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), JobdeckError> {
    let cli = Cli::parse();
    init_tracing();

    let settings = cli.settings()?;
    run_server(settings).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jobdeck=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(settings: Settings) -> Result<(), JobdeckError> {
    let artifacts = ArtifactStore::new(settings.server.downloads_dir());
    tokio::fs::create_dir_all(artifacts.root()).await?;

    let runner = JobRunner::from_settings(&settings.worker, artifacts.clone())
        .ok_or_else(|| ConfigError::Invalid("worker.command must name a program".into()))?;
    let sessions = SessionRegistry::new();

    let state = AppState {
        sessions: sessions.clone(),
        artifacts: artifacts.clone(),
        runner: Arc::new(runner),
        carriage: Arc::new(SessionCarriage::from_settings(&settings.session)),
    };
    let app = api::router(
        state,
        RouterConfig {
            cors_origins: settings.server.cors_origins.clone(),
            rate_limit: settings.server.rate_limit,
        },
    );

    let shutdown = CancellationToken::new();
    let sweeper = gc::spawn_sweeper(
        sessions.clone(),
        artifacts,
        settings.session.ttl(),
        settings.session.sweep_interval(),
        settings.worker.kill_grace() + Duration::from_secs(1),
        shutdown.child_token(),
    );

    let bind = settings.server.bind;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| JobdeckError::Bind(bind, e))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        worker = ?settings.worker.command,
        ttl_secs = settings.session.ttl_secs,
        "jobdeck listening"
    );

    let server_shutdown = shutdown.clone();
    let drain_sessions = sessions.clone();
    let drain_timeout = settings.worker.kill_grace() + Duration::from_secs(1);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_shutdown.cancel();
        // Cancelled jobs drop their event channels, which ends open streams
        // and lets the server finish draining connections.
        let drained = drain_sessions.drain();
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while drained.iter().any(|s| s.is_running()) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!(sessions = drained.len(), "sessions drained");
    })
    .await?;

    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task failed");
    }
    tracing::info!("jobdeck stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
