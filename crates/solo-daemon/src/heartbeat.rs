use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use solo_bridge::event_bus::EventBus;
use solo_bridge::protocol::DaemonEvent;
use solo_core::store::AgentStateStore;
use solo_core::types::{DaemonStatus, ProcessIdentity};

/// Outcome of a leadership claim against the shared row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipClaim {
    /// No row exists yet (bootstrap case).
    GrantedBootstrap,
    /// The row already carries the caller's own identity.
    GrantedSelf,
    /// The previous owner's heartbeat exceeded the stale threshold.
    GrantedTakeover {
        previous_owner: Option<String>,
        stale_secs: i64,
    },
    /// The row reads `stopped` or `error` — nobody owns it.
    GrantedIdle,
    /// Another process is actively heartbeating within the threshold.
    Denied { owner: Option<String> },
}

impl LeadershipClaim {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LeadershipClaim::Denied { .. })
    }
}

/// Owns the local periodic heartbeat timers (one per agent key), computes
/// staleness, and implements the leadership-claim decision rule.
///
/// One long-lived instance per process, constructed at wiring time and
/// shared by reference — never a lazily-created global.
pub struct HeartbeatManager {
    store: Arc<AgentStateStore>,
    identity: ProcessIdentity,
    bus: EventBus,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HeartbeatManager {
    pub fn new(store: Arc<AgentStateStore>, identity: ProcessIdentity, bus: EventBus) -> Self {
        Self {
            store,
            identity,
            bus,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// The one correctness-critical decision point in the core.
    ///
    /// Reads the shared row and decides whether this process may become the
    /// active owner of `agent_key`. The stale threshold should sit at
    /// several multiples of the heartbeat interval so transient scheduling
    /// delays do not trigger false takeovers.
    pub async fn claim_leadership(
        &self,
        agent_key: &str,
        stale_threshold_ms: u64,
    ) -> Result<LeadershipClaim, tokio_rusqlite::Error> {
        let row = match self.store.get(agent_key).await? {
            Some(row) => row,
            None => {
                debug!(agent_key, "no agent row yet — leadership granted (bootstrap)");
                return Ok(LeadershipClaim::GrantedBootstrap);
            }
        };

        if row.is_owned_by(&self.identity) {
            return Ok(LeadershipClaim::GrantedSelf);
        }

        if row.status == DaemonStatus::Running {
            let now = Utc::now();
            if !row.is_heartbeat_stale(now, stale_threshold_ms) {
                debug!(
                    agent_key,
                    owner = row.process_id.as_deref().unwrap_or("unknown"),
                    "leadership denied — owner is actively heartbeating"
                );
                return Ok(LeadershipClaim::Denied {
                    owner: row.process_id.clone(),
                });
            }

            let stale_secs = row
                .heartbeat_age(now)
                .map(|age| age.num_seconds())
                .unwrap_or(i64::MAX);
            warn!(
                agent_key,
                previous_owner = row.process_id.as_deref().unwrap_or("unknown"),
                previous_host = row.host_name.as_deref().unwrap_or("unknown"),
                stale_secs,
                stale_threshold_ms,
                "previous owner is stale — taking over leadership"
            );
            return Ok(LeadershipClaim::GrantedTakeover {
                previous_owner: row.process_id.clone(),
                stale_secs,
            });
        }

        // Row reads stopped or error — free to claim.
        Ok(LeadershipClaim::GrantedIdle)
    }

    /// Start the heartbeat timer for `agent_key`.
    ///
    /// Stops any prior timer for the same key first (idempotent restart),
    /// ensures the row exists, stamps this process's identity on it, beats
    /// once immediately, then schedules a repeating beat every
    /// `interval_ms`.
    pub async fn start(
        &self,
        agent_key: &str,
        interval_ms: u64,
    ) -> Result<(), tokio_rusqlite::Error> {
        self.stop(agent_key);

        self.store.ensure_exists(agent_key, interval_ms).await?;
        self.store
            .adopt(agent_key, &self.identity, interval_ms)
            .await?;
        if !self.store.beat(agent_key, &self.identity).await? {
            // Cannot happen right after adopt unless another process raced
            // an adopt in between; surface it rather than spin.
            warn!(agent_key, "initial heartbeat found the row under new ownership");
        }

        let store = self.store.clone();
        let identity = self.identity.clone();
        let bus = self.bus.clone();
        let key = agent_key.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            // Consume the immediate first tick; the initial beat already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.beat(&key, &identity).await {
                    Ok(true) => {
                        debug!(agent_key = %key, "heartbeat");
                    }
                    Ok(false) => {
                        warn!(
                            agent_key = %key,
                            process_id = %identity.process_id,
                            "heartbeat no longer matches row ownership — stopping local timer"
                        );
                        break;
                    }
                    Err(e) => {
                        // Transient store hiccups must not self-terminate a
                        // healthy process; keep the timer running.
                        error!(agent_key = %key, error = %e, "heartbeat write failed");
                        bus.publish(DaemonEvent::HeartbeatError {
                            agent_key: key.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        });

        let mut timers = self.timers.lock().expect("heartbeat timer lock poisoned");
        timers.insert(agent_key.to_string(), handle);
        info!(agent_key, interval_ms, "heartbeat started");
        Ok(())
    }

    /// Cancel the heartbeat timer for `agent_key`, if any.
    pub fn stop(&self, agent_key: &str) {
        let mut timers = self.timers.lock().expect("heartbeat timer lock poisoned");
        if let Some(handle) = timers.remove(agent_key) {
            handle.abort();
            debug!(agent_key, "heartbeat timer cancelled");
        }
    }

    /// Whether a live timer exists for `agent_key`.
    pub fn is_running(&self, agent_key: &str) -> bool {
        let timers = self.timers.lock().expect("heartbeat timer lock poisoned");
        timers
            .get(agent_key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Durably mark the row running under this process's identity.
    pub async fn mark_started(&self, agent_key: &str) -> Result<(), tokio_rusqlite::Error> {
        self.store.mark_started(agent_key, &self.identity).await
    }

    /// Ownership-guarded stop write; skipped (and logged) when the row now
    /// belongs to another process.
    pub async fn mark_stopped(
        &self,
        agent_key: &str,
        error: Option<&str>,
    ) -> Result<bool, tokio_rusqlite::Error> {
        self.store
            .mark_stopped(agent_key, &self.identity, error)
            .await
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }
}
