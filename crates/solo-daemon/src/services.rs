use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use solo_core::config::DaemonSettings;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A dependent background service supervised by the daemon controller.
///
/// Services are registered into an ordered list at process wiring time;
/// registration order is startup priority order. Implementations must be
/// idempotent to duplicate start calls — two processes can both believe
/// they are starting within the heartbeat-staleness window.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Config-driven gate deciding whether a registered service starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceGate {
    /// Starts on every `start()` (scheduler, maintenance jobs).
    Always,
    /// Channel connectors: only when auto-start-on-boot is configured.
    AutoStartOnBoot,
    EventTriggers,
    ProactiveMessaging,
}

impl ServiceGate {
    pub fn is_enabled(&self, settings: &DaemonSettings) -> bool {
        match self {
            ServiceGate::Always => true,
            ServiceGate::AutoStartOnBoot => settings.auto_start_on_boot,
            ServiceGate::EventTriggers => settings.event_triggers_enabled,
            ServiceGate::ProactiveMessaging => settings.proactive_messaging_enabled,
        }
    }
}

#[derive(Clone)]
pub struct ServiceRegistration {
    pub service: Arc<dyn Service>,
    pub gate: ServiceGate,
}

// ---------------------------------------------------------------------------
// Session recovery
// ---------------------------------------------------------------------------

/// Summary of in-flight work recovered from a prior process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub recoverable_tasks: u64,
    pub paused_tasks: u64,
}

/// Recovers in-flight work from a prior process. Runs first, before any
/// other service.
#[async_trait]
pub trait SessionRecovery: Send + Sync {
    async fn recover(&self) -> anyhow::Result<RecoverySummary>;
}

// ---------------------------------------------------------------------------
// Boot scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootScriptReport {
    pub ran: u64,
    pub total: u64,
    pub errors: Vec<String>,
}

/// One-off scripts executed after all services are up.
#[async_trait]
pub trait BootScriptRunner: Send + Sync {
    async fn run_boot_scripts(&self) -> anyhow::Result<BootScriptReport>;
}

// ---------------------------------------------------------------------------
// Shutdown hooks
// ---------------------------------------------------------------------------

/// Async closure awaited sequentially at the head of the stop sequence,
/// before any service is stopped.
pub type ShutdownHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Settings provider
// ---------------------------------------------------------------------------

/// Source of the configuration snapshot the controller reads once per
/// `start()` call. Never live-reloaded mid-run.
pub trait SettingsProvider: Send + Sync {
    fn snapshot(&self) -> DaemonSettings;
}

/// Fixed settings, for wiring and tests.
pub struct StaticSettings {
    settings: DaemonSettings,
}

impl StaticSettings {
    pub fn new(settings: DaemonSettings) -> Self {
        Self { settings }
    }
}

impl SettingsProvider for StaticSettings {
    fn snapshot(&self) -> DaemonSettings {
        self.settings.clone()
    }
}
