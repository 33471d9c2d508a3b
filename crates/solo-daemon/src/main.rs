use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use solo_bridge::event_bus::EventBus;
use solo_core::config::Config;
use solo_core::store::AgentStateStore;
use solo_core::types::ProcessIdentity;
use solo_daemon::services::StaticSettings;
use solo_daemon::signals::register_signal_handlers;
use solo_daemon::{DaemonController, HeartbeatManager, Watchdog};

const DEFAULT_AGENT_KEY: &str = "main";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // SOLOD_LOG_JSON switches to machine-readable output for log shippers.
    if std::env::var_os("SOLOD_LOG_JSON").is_some() {
        solo_telemetry::logging::init_logging_json("solod", "info");
    } else {
        solo_telemetry::logging::init_logging("solod", "info");
    }

    let agent_key = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_AGENT_KEY.to_string());

    let config = Config::load().context("failed to load configuration")?;
    info!(
        agent_key = %agent_key,
        heartbeat_interval_ms = config.daemon.heartbeat_interval_ms,
        stale_threshold_ms = config.daemon.stale_threshold_ms,
        "solod starting"
    );

    let db_path = config.store.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Arc::new(
        AgentStateStore::new(&db_path)
            .await
            .with_context(|| format!("failed to open state store at {}", db_path.display()))?,
    );

    let identity = ProcessIdentity::current();
    let bus = EventBus::new();
    let heartbeat = Arc::new(HeartbeatManager::new(
        store.clone(),
        identity.clone(),
        bus.clone(),
    ));
    let settings = Arc::new(StaticSettings::new(config.daemon.clone()));

    let controller = Arc::new(DaemonController::new(
        agent_key,
        store,
        heartbeat,
        bus.clone(),
        settings.clone(),
        identity,
    ));

    let watchdog = Watchdog::new(config.daemon.watchdog_interval_ms, settings, bus);
    controller.attach_watchdog(&watchdog);

    register_signal_handlers(controller.clone());

    if !controller.start().await {
        error!("daemon did not start; watchdog will keep retrying if auto-start is enabled");
    }
    watchdog.start(controller.clone());

    // The signal handler performs the graceful stop and exits the process.
    std::future::pending::<()>().await;
    Ok(())
}
