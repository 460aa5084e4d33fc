//! devfarmd - device farm daemon
//!
//! Serves the device acquisition orchestrator over HTTP, backed either by a
//! Testdroid-compatible device cloud or, with `--fake`, by an in-memory cloud
//! seeded with sample devices.
//!
//! Usage:
//!   devfarmd --config devfarmd.toml
//!   devfarmd --fake --port 8080

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use devfarm_api::{create_router, AppState};
use devfarm_client::TestdroidClient;
use devfarm_core::{DeviceCloud, DeviceManager, FakeDeviceCloud};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::DaemonConfig;

const DEFAULT_LOG_FILTER: &str = "devfarmd=info,devfarm_api=info,devfarm_core=info,devfarm_client=info,tower_http=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "devfarmd")]
#[command(author, version, about = "Device farm acquisition and flashing daemon")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "DEVFARM_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Device cloud base URL
    #[arg(long, env = "DEVFARM_CLOUD_URL")]
    cloud_url: Option<String>,

    /// Device cloud username
    #[arg(long, env = "DEVFARM_USERNAME")]
    username: Option<String>,

    /// Device cloud password
    #[arg(long, env = "DEVFARM_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Serve an in-memory cloud with sample devices instead of a real one
    #[arg(long)]
    fake: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    tracing::info!("Starting devfarmd");

    let config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            DaemonConfig::load_from(path)?
        }
        None => DaemonConfig::default(),
    };
    let mut config = config.merge_with_args(
        args.port,
        args.cloud_url.as_deref(),
        args.username.as_deref(),
        args.password.as_deref(),
    );

    config
        .orchestrator
        .validate()
        .context("Invalid [orchestrator] settings")?;

    let cloud: Arc<dyn DeviceCloud> = if args.fake {
        tracing::info!("Using in-memory device cloud with sample devices");
        let signing = &mut config.orchestrator.signing;
        if signing.client_id.is_empty() || signing.access_token.is_empty() {
            tracing::warn!("No signing credentials configured, using demo credentials");
            signing.client_id = "demo".to_string();
            signing.access_token = "demo".to_string();
        }
        let fake = FakeDeviceCloud::sample();
        fake.set_build_param(&config.orchestrator.flash.build_param);
        Arc::new(fake)
    } else {
        let Some(cloud_config) = config.cloud.clone() else {
            bail!("No device cloud configured: pass --cloud-url, add a [cloud] table, or use --fake");
        };
        tracing::info!(url = %cloud_config.url, "Using device cloud");
        Arc::new(TestdroidClient::new(cloud_config).context("Failed to create cloud client")?)
    };

    let manager = DeviceManager::new(cloud, config.orchestrator.clone());
    let mut state = AppState::new(manager);
    if let Some(timeout) = config.server.request_timeout() {
        if timeout < state.request_timeout() {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                acquisition_secs = state.request_timeout().as_secs(),
                "Request timeout is shorter than a full acquisition; late devices are released"
            );
        }
        state = state.with_request_timeout(timeout);
    }
    let app = create_router(state.clone());

    let addr = config.server.addr();
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    release_held_sessions(&state).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Unlock every device still held by an HTTP caller
async fn release_held_sessions(state: &AppState) {
    for held in state.sessions().list() {
        let session_id = held.handle.session_id();
        match state.manager().release_device(held.handle).await {
            Ok(()) => tracing::info!(session_id, "Released session on shutdown"),
            Err(e) => tracing::warn!(session_id, error = %e, "Failed to release session on shutdown"),
        }
    }
}
