//! botplane Host Daemon
//!
//! Boots the orchestrator and the enforcement loop:
//!
//! - **Store**: local SQLite state; rows left `running` by a previous
//!   daemon process are reset at startup, since execution handles are
//!   never persisted
//! - **Backends**: process groups always, containers when the engine
//!   socket is present
//! - **Enforcer**: periodic drain and depletion enforcement

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use botplane_hostd::backend::{ContainerBackend, ProcessBackend};
use botplane_hostd::notify::TracingNotifier;
use botplane_hostd::secrets::PlainSecretStore;
use botplane_hostd::{BackendSet, Config, Enforcer, Orchestrator, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting botplane host daemon");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        bots_dir = %config.bots_dir,
        db_path = %config.db_path,
        default_backend = config.default_backend.as_str(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.bots_dir)?;

    // Open the state store and reconcile stale rows
    let store = Arc::new(Store::open(&config.db_path)?);
    let stale = store.reset_running_on_boot()?;
    if stale > 0 {
        warn!(count = stale, "Reset stale running bots from previous run");
    }

    // Execution backends
    let container = ContainerBackend::new(&config.docker_socket, &config.container_image);
    if !container.socket_exists() {
        warn!(
            socket = %config.docker_socket,
            "Container engine socket not found; container launches will fail"
        );
    }
    let backends = BackendSet {
        process: Arc::new(ProcessBackend::new()),
        container: Arc::new(container),
    };

    // The orchestrator façade
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        backends,
        Arc::new(TracingNotifier),
        Arc::new(PlainSecretStore),
        config.default_backend,
        Duration::from_secs(config.stop_grace_secs),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the enforcement loop
    let enforcer = Enforcer::new(
        Arc::clone(&store),
        Arc::clone(&orchestrator),
        Arc::new(TracingNotifier),
        Duration::from_secs(config.enforce_interval_secs),
    );
    let enforcer_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            enforcer.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = enforcer_handle => {
            info!("Enforcement loop exited");
        }
    }

    // Signal shutdown to all workers and stop live units
    let _ = shutdown_tx.send(true);
    orchestrator.shutdown_all().await;

    info!("Host daemon shutdown complete");
    Ok(())
}
