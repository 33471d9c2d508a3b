use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use solo_bridge::event_bus::EventBus;
use solo_bridge::protocol::DaemonEvent;
use solo_core::config::DaemonSettings;
use solo_core::store::AgentStateStore;
use solo_core::types::{DaemonInfo, DaemonStatus, ProcessIdentity};

use crate::heartbeat::{HeartbeatManager, LeadershipClaim};
use crate::services::{
    BootScriptRunner, Service, ServiceGate, ServiceRegistration, SessionRecovery, SettingsProvider,
    ShutdownHook,
};
use crate::watchdog::Watchdog;

/// The daemon lifecycle state machine for one agent key.
///
/// Sequences leadership acquisition, heartbeat start, dependent-service
/// startup in priority order, and boot scripts; runs the reverse sequence
/// on shutdown. `start()`/`stop()` never surface exceptions to the caller —
/// they return a boolean and leave details in the row and the event bus.
pub struct DaemonController {
    agent_key: String,
    store: Arc<AgentStateStore>,
    heartbeat: Arc<HeartbeatManager>,
    bus: EventBus,
    settings: Arc<dyn SettingsProvider>,
    identity: ProcessIdentity,

    status: Mutex<DaemonStatus>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    /// True while this process is (or is becoming) the active owner; makes
    /// the in-memory status authoritative for `get_info()`.
    started_here: AtomicBool,
    /// Guards against concurrent shutdown.
    is_shutting_down: AtomicBool,

    /// Registration order is startup priority order.
    services: Mutex<Vec<ServiceRegistration>>,
    /// Indices of services actually started by the last `start()`, in
    /// start order. Shutdown walks this in reverse.
    started_order: Mutex<Vec<usize>>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
    session_recovery: Mutex<Option<Arc<dyn SessionRecovery>>>,
    boot_scripts: Mutex<Option<Arc<dyn BootScriptRunner>>>,
    watchdog: Mutex<Option<Weak<Watchdog>>>,
}

impl DaemonController {
    pub fn new(
        agent_key: impl Into<String>,
        store: Arc<AgentStateStore>,
        heartbeat: Arc<HeartbeatManager>,
        bus: EventBus,
        settings: Arc<dyn SettingsProvider>,
        identity: ProcessIdentity,
    ) -> Self {
        Self {
            agent_key: agent_key.into(),
            store,
            heartbeat,
            bus,
            settings,
            identity,
            status: Mutex::new(DaemonStatus::Stopped),
            started_at: Mutex::new(None),
            started_here: AtomicBool::new(false),
            is_shutting_down: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            started_order: Mutex::new(Vec::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
            session_recovery: Mutex::new(None),
            boot_scripts: Mutex::new(None),
            watchdog: Mutex::new(None),
        }
    }

    pub fn agent_key(&self) -> &str {
        &self.agent_key
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn status(&self) -> DaemonStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    /// Register a dependent service. Registration order is startup order.
    pub fn register_service(&self, service: Arc<dyn Service>, gate: ServiceGate) {
        let mut services = self.services.lock().expect("services lock poisoned");
        services.push(ServiceRegistration { service, gate });
    }

    /// Register a hook awaited at the head of the stop sequence.
    pub fn register_shutdown_hook(&self, hook: ShutdownHook) {
        let mut hooks = self.shutdown_hooks.lock().expect("hooks lock poisoned");
        hooks.push(hook);
    }

    pub fn set_session_recovery(&self, recovery: Arc<dyn SessionRecovery>) {
        *self
            .session_recovery
            .lock()
            .expect("recovery lock poisoned") = Some(recovery);
    }

    pub fn set_boot_scripts(&self, runner: Arc<dyn BootScriptRunner>) {
        *self.boot_scripts.lock().expect("boot lock poisoned") = Some(runner);
    }

    /// Attach the watchdog so `stop()` can disable it before anything else.
    pub fn attach_watchdog(&self, watchdog: &Arc<Watchdog>) {
        *self.watchdog.lock().expect("watchdog lock poisoned") = Some(Arc::downgrade(watchdog));
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Start the daemon. Returns `true` when this process ends up running
    /// it; `false` on deliberate no-ops (config-disabled, leadership
    /// denied, re-entrant start) and on fatal failures. Never panics or
    /// propagates errors — details land in the row and the activity log.
    pub async fn start(&self) -> bool {
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            match *status {
                DaemonStatus::Running => {
                    debug!(agent_key = %self.agent_key, "start ignored — already running");
                    return true;
                }
                DaemonStatus::Starting | DaemonStatus::Stopping => {
                    warn!(
                        agent_key = %self.agent_key,
                        status = %*status,
                        "start rejected — transition already in progress"
                    );
                    return false;
                }
                DaemonStatus::Stopped | DaemonStatus::Error => {
                    *status = DaemonStatus::Starting;
                }
            }
        }
        self.started_here.store(true, Ordering::SeqCst);
        self.bus.publish(DaemonEvent::Starting {
            agent_key: self.agent_key.clone(),
        });

        // One snapshot per start; never live-reloaded mid-run.
        let settings = self.settings.snapshot();

        if !settings.enabled {
            info!(agent_key = %self.agent_key, "daemon disabled by configuration");
            self.set_status(DaemonStatus::Stopped);
            self.started_here.store(false, Ordering::SeqCst);
            self.bus.publish(DaemonEvent::Disabled {
                agent_key: self.agent_key.clone(),
            });
            return false;
        }

        let claim = match self
            .heartbeat
            .claim_leadership(&self.agent_key, settings.stale_threshold_ms)
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                return self.fail_start(&format!("leadership claim failed: {e}")).await;
            }
        };

        match claim {
            LeadershipClaim::Denied { owner } => {
                info!(
                    agent_key = %self.agent_key,
                    owner = owner.as_deref().unwrap_or("unknown"),
                    "leadership denied — another instance is healthy"
                );
                self.set_status(DaemonStatus::Stopped);
                self.started_here.store(false, Ordering::SeqCst);
                self.bus.publish(DaemonEvent::LeadershipDenied {
                    agent_key: self.agent_key.clone(),
                    owner,
                });
                return false;
            }
            LeadershipClaim::GrantedTakeover {
                previous_owner,
                stale_secs,
            } => {
                self.bus.publish(DaemonEvent::LeadershipTaken {
                    agent_key: self.agent_key.clone(),
                    previous_owner,
                    stale_secs,
                });
            }
            _ => {}
        }

        if let Err(e) = self.run_start_sequence(&settings).await {
            return self.fail_start(&e.to_string()).await;
        }

        self.set_status(DaemonStatus::Running);
        if let Some(watchdog) = self.attached_watchdog() {
            watchdog.enable();
        }
        self.bus.publish(DaemonEvent::Started {
            agent_key: self.agent_key.clone(),
            process_id: self.identity.process_id.clone(),
        });
        info!(agent_key = %self.agent_key, "daemon running");
        true
    }

    /// Core fallible startup steps. A failure here is a fatal startup
    /// failure; individual service failures are isolated inside and never
    /// bubble up.
    async fn run_start_sequence(&self, settings: &DaemonSettings) -> anyhow::Result<()> {
        self.heartbeat
            .start(&self.agent_key, settings.heartbeat_interval_ms)
            .await?;
        self.heartbeat.mark_started(&self.agent_key).await?;
        *self.started_at.lock().expect("started_at lock poisoned") = Some(Utc::now());

        // Session/task recovery runs first, before any other service.
        let recovery = self
            .session_recovery
            .lock()
            .expect("recovery lock poisoned")
            .clone();
        if let Some(recovery) = recovery {
            match recovery.recover().await {
                Ok(summary) => {
                    info!(
                        recoverable = summary.recoverable_tasks,
                        paused = summary.paused_tasks,
                        "session recovery complete"
                    );
                    self.bus.publish(DaemonEvent::SessionRecovery {
                        recoverable_tasks: summary.recoverable_tasks,
                        paused_tasks: summary.paused_tasks,
                    });
                }
                Err(e) => {
                    error!(error = %e, "session recovery failed");
                    self.bus.publish(DaemonEvent::ServiceStartFailed {
                        service: "session-recovery".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // Dependent services in priority order. A single failing service
        // does not abort the others.
        let registrations: Vec<ServiceRegistration> =
            self.services.lock().expect("services lock poisoned").clone();
        let mut started = Vec::new();
        for (index, registration) in registrations.iter().enumerate() {
            let name = registration.service.name().to_string();
            if !registration.gate.is_enabled(settings) {
                debug!(service = %name, "service gated off by configuration");
                continue;
            }
            match registration.service.start().await {
                Ok(()) => {
                    info!(service = %name, "service started");
                    started.push(index);
                    self.bus
                        .publish(DaemonEvent::ServiceStarted { service: name });
                }
                Err(e) => {
                    error!(service = %name, error = %e, "service failed to start");
                    self.bus.publish(DaemonEvent::ServiceStartFailed {
                        service: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        *self
            .started_order
            .lock()
            .expect("started_order lock poisoned") = started;

        // One-off boot scripts, bracketed by a started/completed event pair.
        if settings.boot_scripts_enabled {
            let runner = self.boot_scripts.lock().expect("boot lock poisoned").clone();
            if let Some(runner) = runner {
                self.bus.publish(DaemonEvent::BootScriptsStarted {
                    agent_key: self.agent_key.clone(),
                });
                let report = match runner.run_boot_scripts().await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "boot script run failed");
                        crate::services::BootScriptReport {
                            ran: 0,
                            total: 0,
                            errors: vec![e.to_string()],
                        }
                    }
                };
                info!(
                    ran = report.ran,
                    total = report.total,
                    errors = report.errors.len(),
                    "boot scripts completed"
                );
                self.bus.publish(DaemonEvent::BootScriptsCompleted {
                    ran: report.ran,
                    total: report.total,
                    errors: report.errors,
                });
            }
        }

        Ok(())
    }

    /// Fatal start failure: record on the row, stop the heartbeat, settle
    /// in `error`.
    async fn fail_start(&self, message: &str) -> bool {
        error!(agent_key = %self.agent_key, error = %message, "daemon start failed");
        if let Err(e) = self.store.record_error(&self.agent_key, message).await {
            error!(error = %e, "failed to record start error on agent row");
        }
        self.heartbeat.stop(&self.agent_key);
        self.set_status(DaemonStatus::Error);
        self.bus.publish(DaemonEvent::DaemonError {
            agent_key: self.agent_key.clone(),
            message: message.to_string(),
        });
        false
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    /// Stop the daemon: shutdown hooks, then services in the exact reverse
    /// of the recorded start order, then the heartbeat, then the durable
    /// stop write. Always runs to completion; per-step failures are logged
    /// and do not abort the remaining steps.
    pub async fn stop(&self) -> bool {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            warn!(agent_key = %self.agent_key, "stop ignored — shutdown already in progress");
            return false;
        }

        if self.status() == DaemonStatus::Stopped {
            self.is_shutting_down.store(false, Ordering::SeqCst);
            debug!(agent_key = %self.agent_key, "stop ignored — already stopped");
            return true;
        }

        self.set_status(DaemonStatus::Stopping);
        self.bus.publish(DaemonEvent::Stopping {
            agent_key: self.agent_key.clone(),
        });

        // Disable the watchdog first so an intentional stop is not
        // immediately undone.
        if let Some(watchdog) = self.attached_watchdog() {
            watchdog.disable();
        }

        let result = self.run_stop_sequence().await;

        let ok = match result {
            Ok(()) => {
                self.set_status(DaemonStatus::Stopped);
                *self.started_at.lock().expect("started_at lock poisoned") = None;
                self.started_here.store(false, Ordering::SeqCst);
                self.bus.publish(DaemonEvent::Stopped {
                    agent_key: self.agent_key.clone(),
                });
                info!(agent_key = %self.agent_key, "daemon stopped");
                true
            }
            Err(e) => {
                error!(agent_key = %self.agent_key, error = %e, "daemon stop failed");
                let _ = self
                    .heartbeat
                    .mark_stopped(&self.agent_key, Some(&e.to_string()))
                    .await;
                self.set_status(DaemonStatus::Error);
                self.bus.publish(DaemonEvent::DaemonError {
                    agent_key: self.agent_key.clone(),
                    message: e.to_string(),
                });
                false
            }
        };

        self.is_shutting_down.store(false, Ordering::SeqCst);
        ok
    }

    async fn run_stop_sequence(&self) -> anyhow::Result<()> {
        // Registered shutdown hooks run first, awaited sequentially.
        let hooks: Vec<ShutdownHook> = self
            .shutdown_hooks
            .lock()
            .expect("hooks lock poisoned")
            .clone();
        for hook in hooks {
            if let Err(e) = hook().await {
                warn!(error = %e, "shutdown hook failed");
            }
        }

        // Services stop in the exact reverse of the recorded start order.
        let order: Vec<usize> = {
            let mut started = self
                .started_order
                .lock()
                .expect("started_order lock poisoned");
            std::mem::take(&mut *started)
        };
        let registrations: Vec<ServiceRegistration> =
            self.services.lock().expect("services lock poisoned").clone();
        for index in order.into_iter().rev() {
            let Some(registration) = registrations.get(index) else {
                continue;
            };
            let name = registration.service.name().to_string();
            match registration.service.stop().await {
                Ok(()) => {
                    info!(service = %name, "service stopped");
                    self.bus
                        .publish(DaemonEvent::ServiceStopped { service: name });
                }
                Err(e) => {
                    error!(service = %name, error = %e, "service failed to stop");
                    self.bus.publish(DaemonEvent::ServiceStopFailed {
                        service: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.heartbeat.stop(&self.agent_key);
        self.heartbeat.mark_stopped(&self.agent_key, None).await?;
        Ok(())
    }

    /// `stop()` then `start()`, sequential, no special-casing.
    pub async fn restart(&self) -> bool {
        self.stop().await;
        self.start().await
    }

    // -----------------------------------------------------------------------
    // get_info
    // -----------------------------------------------------------------------

    /// Status projection for any process, including one that never ran
    /// `start()`.
    ///
    /// The in-memory status is authoritative only while this process
    /// actually drives the daemon; otherwise status derives from the
    /// durable row: a `running` row with a stale heartbeat reads as
    /// `error` (silent crash inference).
    pub async fn get_info(&self) -> Result<DaemonInfo, tokio_rusqlite::Error> {
        let settings = self.settings.snapshot();
        let row = self.store.get(&self.agent_key).await?;

        if self.started_here.load(Ordering::SeqCst) {
            let status = self.status();
            return Ok(match row {
                Some(state) => DaemonInfo::from_state(&state, status),
                None => {
                    let mut info =
                        DaemonInfo::absent(&self.agent_key, settings.heartbeat_interval_ms);
                    info.status = status;
                    info
                }
            });
        }

        let Some(state) = row else {
            return Ok(DaemonInfo::absent(
                &self.agent_key,
                settings.heartbeat_interval_ms,
            ));
        };

        let status = if state.status == DaemonStatus::Running {
            if state.is_heartbeat_stale(Utc::now(), settings.stale_threshold_ms) {
                DaemonStatus::Error
            } else {
                DaemonStatus::Running
            }
        } else {
            state.status
        };
        Ok(DaemonInfo::from_state(&state, status))
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    fn set_status(&self, status: DaemonStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    fn attached_watchdog(&self) -> Option<Arc<Watchdog>> {
        self.watchdog
            .lock()
            .expect("watchdog lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }
}
