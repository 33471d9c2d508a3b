use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use solo_bridge::event_bus::EventBus;
use solo_bridge::protocol::DaemonEvent;
use solo_core::types::DaemonStatus;

use crate::controller::DaemonController;
use crate::services::SettingsProvider;

/// What a single watchdog tick decided to do. Returned so tests can drive
/// ticks directly without waiting out the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Watchdog is disabled (intentional stop in progress or completed).
    Disabled,
    /// `auto_start_on_boot` is off; the watchdog observes but never restarts.
    AutoStartOff,
    /// A previous tick's restart is still in flight; skipped.
    InFlight,
    /// The status check against the store failed; nothing attempted.
    CheckFailed,
    /// Daemon is running or mid-transition; nothing to do.
    Healthy,
    /// Daemon was down; a restart was attempted.
    Restarted { succeeded: bool },
}

/// Periodically checks the daemon and restarts it when it is found
/// stopped or errored without an intentional shutdown.
///
/// Holds a strong reference to the controller only inside the spawned
/// loop; the controller holds this end weakly, so dropping both tears
/// the pair down cleanly.
pub struct Watchdog {
    interval_ms: u64,
    settings: Arc<dyn SettingsProvider>,
    bus: EventBus,
    enabled: AtomicBool,
    /// Overlap guard: one restart at a time, later ticks skip.
    in_flight: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(interval_ms: u64, settings: Arc<dyn SettingsProvider>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            interval_ms,
            settings,
            bus,
            enabled: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Spawn the periodic check loop. Idempotent: a second call aborts the
    /// previous loop first.
    pub fn start(self: &Arc<Self>, controller: Arc<DaemonController>) {
        let mut task = self.task.lock().expect("watchdog task lock poisoned");
        if let Some(handle) = task.take() {
            handle.abort();
        }

        let watchdog = self.clone();
        let interval_ms = self.interval_ms;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                watchdog.tick(&controller).await;
            }
        }));
        info!(interval_ms, "watchdog started");
    }

    /// One check-and-maybe-restart pass.
    pub async fn tick(&self, controller: &DaemonController) -> TickOutcome {
        if !self.enabled.load(Ordering::SeqCst) {
            return TickOutcome::Disabled;
        }

        let settings = self.settings.snapshot();
        if !settings.auto_start_on_boot {
            return TickOutcome::AutoStartOff;
        }

        // Reconciled info, not local status: a standby instance whose row
        // shows a healthy foreign owner must do nothing, while a running
        // row gone stale reads as an error and gets a takeover attempt.
        let info = match controller.get_info().await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "watchdog: status check failed");
                return TickOutcome::CheckFailed;
            }
        };
        let status = info.status;
        match status {
            // Transitional states are never interfered with.
            DaemonStatus::Running | DaemonStatus::Starting | DaemonStatus::Stopping => {
                debug!(status = %status, "watchdog: daemon healthy");
                return TickOutcome::Healthy;
            }
            DaemonStatus::Stopped | DaemonStatus::Error => {}
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("watchdog: restart already in flight, skipping tick");
            return TickOutcome::InFlight;
        }

        warn!(
            agent_key = controller.agent_key(),
            observed_status = %status,
            "watchdog: daemon is down, restarting"
        );
        self.bus.publish(DaemonEvent::WatchdogRestart {
            agent_key: controller.agent_key().to_string(),
            observed_status: status.as_str().to_string(),
        });

        let succeeded = controller.start().await;
        if !succeeded {
            error!(
                agent_key = controller.agent_key(),
                "watchdog restart did not bring the daemon up"
            );
        }

        self.in_flight.store(false, Ordering::SeqCst);
        TickOutcome::Restarted { succeeded }
    }

    /// Suppress restarts without tearing the loop down. Used at the head
    /// of an intentional stop.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        debug!("watchdog disabled");
    }

    /// Re-arm after a successful start.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        debug!("watchdog enabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Abort the check loop entirely (process shutdown).
    pub fn shutdown(&self) {
        let mut task = self.task.lock().expect("watchdog task lock poisoned");
        if let Some(handle) = task.take() {
            handle.abort();
            info!("watchdog shut down");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
