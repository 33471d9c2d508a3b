use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events published by the daemon controller, heartbeat manager,
/// and watchdog. Purely local observability fan-out — no cross-process
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum DaemonEvent {
    Starting { agent_key: String },
    Started { agent_key: String, process_id: String },
    Stopping { agent_key: String },
    Stopped { agent_key: String },
    /// `start()` observed `daemon.enabled = false` — deliberate no-op.
    Disabled { agent_key: String },
    LeadershipDenied { agent_key: String, owner: Option<String> },
    LeadershipTaken { agent_key: String, previous_owner: Option<String>, stale_secs: i64 },
    ServiceStarted { service: String },
    ServiceStartFailed { service: String, error: String },
    ServiceStopped { service: String },
    ServiceStopFailed { service: String, error: String },
    SessionRecovery { recoverable_tasks: u64, paused_tasks: u64 },
    BootScriptsStarted { agent_key: String },
    BootScriptsCompleted { ran: u64, total: u64, errors: Vec<String> },
    HeartbeatError { agent_key: String, error: String },
    DaemonError { agent_key: String, message: String },
    WatchdogRestart { agent_key: String, observed_status: String },
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Discriminant used as the subscription key on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Starting,
    Started,
    Stopping,
    Stopped,
    Disabled,
    LeadershipDenied,
    LeadershipTaken,
    ServiceStarted,
    ServiceStartFailed,
    ServiceStopped,
    ServiceStopFailed,
    SessionRecovery,
    BootScriptsStarted,
    BootScriptsCompleted,
    HeartbeatError,
    DaemonError,
    WatchdogRestart,
}

impl DaemonEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DaemonEvent::Starting { .. } => EventKind::Starting,
            DaemonEvent::Started { .. } => EventKind::Started,
            DaemonEvent::Stopping { .. } => EventKind::Stopping,
            DaemonEvent::Stopped { .. } => EventKind::Stopped,
            DaemonEvent::Disabled { .. } => EventKind::Disabled,
            DaemonEvent::LeadershipDenied { .. } => EventKind::LeadershipDenied,
            DaemonEvent::LeadershipTaken { .. } => EventKind::LeadershipTaken,
            DaemonEvent::ServiceStarted { .. } => EventKind::ServiceStarted,
            DaemonEvent::ServiceStartFailed { .. } => EventKind::ServiceStartFailed,
            DaemonEvent::ServiceStopped { .. } => EventKind::ServiceStopped,
            DaemonEvent::ServiceStopFailed { .. } => EventKind::ServiceStopFailed,
            DaemonEvent::SessionRecovery { .. } => EventKind::SessionRecovery,
            DaemonEvent::BootScriptsStarted { .. } => EventKind::BootScriptsStarted,
            DaemonEvent::BootScriptsCompleted { .. } => EventKind::BootScriptsCompleted,
            DaemonEvent::HeartbeatError { .. } => EventKind::HeartbeatError,
            DaemonEvent::DaemonError { .. } => EventKind::DaemonError,
            DaemonEvent::WatchdogRestart { .. } => EventKind::WatchdogRestart,
        }
    }

    /// Classify the event for the activity log by inspecting the payload.
    pub fn activity_status(&self) -> ActivityStatus {
        match self {
            DaemonEvent::Disabled { .. } | DaemonEvent::LeadershipDenied { .. } => {
                ActivityStatus::Skipped
            }
            DaemonEvent::ServiceStartFailed { .. }
            | DaemonEvent::ServiceStopFailed { .. }
            | DaemonEvent::HeartbeatError { .. }
            | DaemonEvent::DaemonError { .. } => ActivityStatus::Error,
            DaemonEvent::BootScriptsCompleted { errors, .. } if !errors.is_empty() => {
                ActivityStatus::Error
            }
            _ => ActivityStatus::Success,
        }
    }

    /// Human-readable activity message synthesized per event type.
    pub fn activity_message(&self) -> String {
        match self {
            DaemonEvent::Starting { agent_key } => format!("daemon '{agent_key}' starting"),
            DaemonEvent::Started { agent_key, process_id } => {
                format!("daemon '{agent_key}' running (pid {process_id})")
            }
            DaemonEvent::Stopping { agent_key } => format!("daemon '{agent_key}' stopping"),
            DaemonEvent::Stopped { agent_key } => format!("daemon '{agent_key}' stopped"),
            DaemonEvent::Disabled { agent_key } => {
                format!("daemon '{agent_key}' disabled by configuration")
            }
            DaemonEvent::LeadershipDenied { agent_key, owner } => format!(
                "leadership denied for '{agent_key}' — active owner {}",
                owner.as_deref().unwrap_or("unknown")
            ),
            DaemonEvent::LeadershipTaken { agent_key, previous_owner, stale_secs } => format!(
                "took over '{agent_key}' from {} (stale for {stale_secs}s)",
                previous_owner.as_deref().unwrap_or("no previous owner")
            ),
            DaemonEvent::ServiceStarted { service } => format!("service '{service}' started"),
            DaemonEvent::ServiceStartFailed { service, error } => {
                format!("service '{service}' failed to start: {error}")
            }
            DaemonEvent::ServiceStopped { service } => format!("service '{service}' stopped"),
            DaemonEvent::ServiceStopFailed { service, error } => {
                format!("service '{service}' failed to stop: {error}")
            }
            DaemonEvent::SessionRecovery { recoverable_tasks, paused_tasks } => format!(
                "session recovery: {recoverable_tasks} recoverable, {paused_tasks} paused"
            ),
            DaemonEvent::BootScriptsStarted { agent_key } => {
                format!("boot scripts starting for '{agent_key}'")
            }
            DaemonEvent::BootScriptsCompleted { ran, total, errors } => format!(
                "boot scripts completed: {ran}/{total} ran, {} error(s)",
                errors.len()
            ),
            DaemonEvent::HeartbeatError { agent_key, error } => {
                format!("heartbeat write failed for '{agent_key}': {error}")
            }
            DaemonEvent::DaemonError { agent_key, message } => {
                format!("daemon '{agent_key}' error: {message}")
            }
            DaemonEvent::WatchdogRestart { agent_key, observed_status } => format!(
                "watchdog restarting '{agent_key}' (observed status: {observed_status})"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    Error,
    Skipped,
}

/// One entry in the bounded in-memory activity ring buffer, derived from
/// every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub status: ActivityStatus,
    pub message: String,
}

impl ActivityEntry {
    pub fn from_event(event: &DaemonEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: event.kind(),
            status: event.activity_status(),
            message: event.activity_message(),
        }
    }
}
