use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DaemonStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of the background daemon for one agent key.
///
/// Mirrored between the controller's in-memory state and the durable
/// `agent_state` row; the row is the source of truth for other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl DaemonStatus {
    /// Rest states from which `start()` may be invoked again.
    pub fn is_rest_state(&self) -> bool {
        matches!(self, DaemonStatus::Stopped | DaemonStatus::Error)
    }

    /// Transitional states the watchdog must not interfere with.
    pub fn is_transitional(&self) -> bool {
        matches!(self, DaemonStatus::Starting | DaemonStatus::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Starting => "starting",
            DaemonStatus::Running => "running",
            DaemonStatus::Stopping => "stopping",
            DaemonStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProcessIdentity
// ---------------------------------------------------------------------------

/// Identity of the process that owns (or last owned) an agent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub process_id: String,
    pub host_name: String,
}

impl ProcessIdentity {
    /// Identity of the current OS process.
    pub fn current() -> Self {
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self {
            process_id: std::process::id().to_string(),
            host_name,
        }
    }

    /// Construct an explicit identity (tests, multi-instance simulation).
    pub fn new(process_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            host_name: host_name.into(),
        }
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.process_id, self.host_name)
    }
}

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

/// One durable row per logical agent key — the only cross-process shared
/// state in the system. `last_heartbeat_at` is the liveness signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_key: String,
    pub status: DaemonStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Cadence the current owner claims to use; lets observers compute
    /// staleness without hard-coding assumptions.
    pub heartbeat_interval_ms: u64,
    pub process_id: Option<String>,
    pub host_name: Option<String>,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub total_tasks_run: u64,
    pub metadata: Option<serde_json::Value>,
}

impl AgentState {
    pub fn new(agent_key: impl Into<String>, heartbeat_interval_ms: u64) -> Self {
        Self {
            agent_key: agent_key.into(),
            status: DaemonStatus::Stopped,
            started_at: None,
            stopped_at: None,
            last_heartbeat_at: None,
            heartbeat_interval_ms,
            process_id: None,
            host_name: None,
            last_error: None,
            error_count: 0,
            total_tasks_run: 0,
            metadata: None,
        }
    }

    /// Whether this row is owned by `identity`.
    pub fn is_owned_by(&self, identity: &ProcessIdentity) -> bool {
        self.process_id.as_deref() == Some(identity.process_id.as_str())
    }

    /// Time elapsed since the last heartbeat, or `None` when the row has
    /// never been beaten.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_heartbeat_at.map(|hb| now - hb)
    }

    /// Whether the heartbeat has exceeded the stale threshold. A row with
    /// no heartbeat at all is considered stale.
    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>, stale_threshold_ms: u64) -> bool {
        match self.heartbeat_age(now) {
            Some(age) => age > chrono::Duration::milliseconds(stale_threshold_ms as i64),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// DaemonInfo
// ---------------------------------------------------------------------------

/// Read-only projection combining in-memory controller status with the
/// durable row, so any process — including one that never ran `start()` —
/// reports accurate status. Derived, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub agent_key: String,
    pub status: DaemonStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_interval_ms: u64,
    pub process_id: Option<String>,
    pub host_name: Option<String>,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub total_tasks_run: u64,
}

impl DaemonInfo {
    /// Info for an agent key with no durable row and no local controller.
    pub fn absent(agent_key: impl Into<String>, heartbeat_interval_ms: u64) -> Self {
        Self {
            agent_key: agent_key.into(),
            status: DaemonStatus::Stopped,
            started_at: None,
            last_heartbeat_at: None,
            heartbeat_interval_ms,
            process_id: None,
            host_name: None,
            last_error: None,
            error_count: 0,
            total_tasks_run: 0,
        }
    }

    pub fn from_state(state: &AgentState, status: DaemonStatus) -> Self {
        Self {
            agent_key: state.agent_key.clone(),
            status,
            started_at: state.started_at,
            last_heartbeat_at: state.last_heartbeat_at,
            heartbeat_interval_ms: state.heartbeat_interval_ms,
            process_id: state.process_id.clone(),
            host_name: state.host_name.clone(),
            last_error: state.last_error.clone(),
            error_count: state.error_count,
            total_tasks_run: state.total_tasks_run,
        }
    }
}
