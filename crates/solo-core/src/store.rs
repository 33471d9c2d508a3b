use std::path::Path;

use chrono::Utc;
use tokio_rusqlite::Connection;

use crate::types::{AgentState, DaemonStatus, ProcessIdentity};

/// Async SQLite-backed store for the shared `agent_state` rows — the only
/// cross-process shared resource in the system. Every mutation is a
/// single-row, single-statement update, so there is no deadlock surface.
pub struct AgentStateStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn status_to_sql(status: &DaemonStatus) -> String {
    status.as_str().to_string()
}

fn status_from_sql(raw: &str) -> DaemonStatus {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).unwrap_or(DaemonStatus::Error)
}

impl AgentStateStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agent_state (
                        agent_key             TEXT PRIMARY KEY,
                        status                TEXT NOT NULL,
                        started_at            TEXT,
                        stopped_at            TEXT,
                        last_heartbeat_at     TEXT,
                        heartbeat_interval_ms INTEGER NOT NULL,
                        process_id            TEXT,
                        host_name             TEXT,
                        last_error            TEXT,
                        error_count           INTEGER NOT NULL DEFAULT 0,
                        total_tasks_run       INTEGER NOT NULL DEFAULT 0,
                        metadata              TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_agent_state_status
                        ON agent_state(status);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(
        &self,
        agent_key: &str,
    ) -> Result<Option<AgentState>, tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_key, status, started_at, stopped_at, last_heartbeat_at,
                            heartbeat_interval_ms, process_id, host_name, last_error,
                            error_count, total_tasks_run, metadata
                     FROM agent_state WHERE agent_key = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent_state(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Lifecycle writes
    // -----------------------------------------------------------------------

    /// Create the row lazily on first heartbeat start. A no-op when the row
    /// already exists.
    pub async fn ensure_exists(
        &self,
        agent_key: &str,
        heartbeat_interval_ms: u64,
    ) -> Result<(), tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        let status = status_to_sql(&DaemonStatus::Stopped);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO agent_state (agent_key, status, heartbeat_interval_ms)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![key, status, heartbeat_interval_ms as i64],
                )?;
                Ok(())
            })
            .await
    }

    /// The one takeover write: unconditionally stamp the caller's identity,
    /// cadence, and a fresh heartbeat on the row. Performed immediately
    /// after a granted leadership claim so subsequent conditional beats
    /// match the new owner.
    pub async fn adopt(
        &self,
        agent_key: &str,
        identity: &ProcessIdentity,
        heartbeat_interval_ms: u64,
    ) -> Result<(), tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        let pid = identity.process_id.clone();
        let host = identity.host_name.clone();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_state
                     SET process_id = ?2, host_name = ?3, heartbeat_interval_ms = ?4,
                         last_heartbeat_at = ?5
                     WHERE agent_key = ?1",
                    rusqlite::params![key, pid, host, heartbeat_interval_ms as i64, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Liveness pulse. Conditional on ownership: the update only applies
    /// while `process_id` still matches the caller. Returns `false` when
    /// zero rows were affected — the caller has lost ownership and must
    /// stop its own timer.
    pub async fn beat(
        &self,
        agent_key: &str,
        identity: &ProcessIdentity,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        let pid = identity.process_id.clone();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE agent_state SET last_heartbeat_at = ?3
                     WHERE agent_key = ?1 AND process_id = ?2",
                    rusqlite::params![key, pid, now],
                )?;
                Ok(affected > 0)
            })
            .await
    }

    /// Durably mark the row running under the caller's identity.
    pub async fn mark_started(
        &self,
        agent_key: &str,
        identity: &ProcessIdentity,
    ) -> Result<(), tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        let pid = identity.process_id.clone();
        let host = identity.host_name.clone();
        let status = status_to_sql(&DaemonStatus::Running);
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_state
                     SET status = ?2, started_at = ?3, stopped_at = NULL,
                         last_error = NULL, process_id = ?4, host_name = ?5
                     WHERE agent_key = ?1",
                    rusqlite::params![key, status, now, pid, host],
                )?;
                Ok(())
            })
            .await
    }

    /// Ownership-guarded stop write. When the row's `process_id` no longer
    /// matches the caller, the write is skipped (a stale writer must not
    /// clobber a new owner's state) and `false` is returned.
    pub async fn mark_stopped(
        &self,
        agent_key: &str,
        identity: &ProcessIdentity,
        error: Option<&str>,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        let pid = identity.process_id.clone();
        let now = Utc::now().to_rfc3339();
        let status = status_to_sql(if error.is_some() {
            &DaemonStatus::Error
        } else {
            &DaemonStatus::Stopped
        });
        let error = error.map(|e| e.to_string());
        let affected = self
            .conn
            .call(move |conn| {
                let affected = match &error {
                    Some(msg) => conn.execute(
                        "UPDATE agent_state
                         SET status = ?3, stopped_at = ?4, last_error = ?5,
                             error_count = error_count + 1
                         WHERE agent_key = ?1 AND process_id = ?2",
                        rusqlite::params![key, pid, status, now, msg],
                    )?,
                    None => conn.execute(
                        "UPDATE agent_state SET status = ?3, stopped_at = ?4
                         WHERE agent_key = ?1 AND process_id = ?2",
                        rusqlite::params![key, pid, status, now],
                    )?,
                };
                Ok(affected > 0)
            })
            .await?;
        if !affected {
            tracing::warn!(
                agent_key = agent_key,
                process_id = %identity.process_id,
                "skipping stop write — row is owned by another process"
            );
        }
        Ok(affected)
    }

    /// Record a fatal failure on the row: status=error, message, counter.
    pub async fn record_error(
        &self,
        agent_key: &str,
        message: &str,
    ) -> Result<(), tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        let msg = message.to_string();
        let status = status_to_sql(&DaemonStatus::Error);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_state
                     SET status = ?2, last_error = ?3, error_count = error_count + 1
                     WHERE agent_key = ?1",
                    rusqlite::params![key, status, msg],
                )?;
                Ok(())
            })
            .await
    }

    /// Monotonic observability counter for work done by supervised services.
    pub async fn increment_tasks_run(
        &self,
        agent_key: &str,
        n: u64,
    ) -> Result<(), tokio_rusqlite::Error> {
        let key = agent_key.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_state SET total_tasks_run = total_tasks_run + ?2
                     WHERE agent_key = ?1",
                    rusqlite::params![key, n as i64],
                )?;
                Ok(())
            })
            .await
    }

    /// Explicit maintenance action: delete rows whose last activity is older
    /// than `older_than`. Never called automatically by the core. Rows that
    /// currently read `running` are left alone.
    pub async fn purge_stale(
        &self,
        older_than: chrono::Duration,
    ) -> Result<usize, tokio_rusqlite::Error> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let running = status_to_sql(&DaemonStatus::Running);
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM agent_state
                     WHERE status != ?1
                       AND COALESCE(last_heartbeat_at, stopped_at, started_at) < ?2",
                    rusqlite::params![running, cutoff],
                )?;
                Ok(affected)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .expect("valid date")
        .with_timezone(&Utc)
}

fn row_to_agent_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentState> {
    let status_str: String = row.get(1)?;
    let started_at: Option<String> = row.get(2)?;
    let stopped_at: Option<String> = row.get(3)?;
    let last_heartbeat_at: Option<String> = row.get(4)?;
    let interval: i64 = row.get(5)?;
    let error_count: i64 = row.get(9)?;
    let total_tasks_run: i64 = row.get(10)?;
    let metadata_str: Option<String> = row.get(11)?;

    Ok(AgentState {
        agent_key: row.get(0)?,
        status: status_from_sql(&status_str),
        started_at: started_at.map(parse_ts),
        stopped_at: stopped_at.map(parse_ts),
        last_heartbeat_at: last_heartbeat_at.map(parse_ts),
        heartbeat_interval_ms: interval as u64,
        process_id: row.get(6)?,
        host_name: row.get(7)?,
        last_error: row.get(8)?,
        error_count: error_count as u64,
        total_tasks_run: total_tasks_run as u64,
        metadata: metadata_str.map(|s| serde_json::from_str(&s).expect("valid json")),
    })
}
