use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};

use super::models::*;

/// Current wall-clock time in the fixed-width RFC 3339 form stored in every
/// timestamp column. Fixed width keeps SQL string comparisons (expiry,
/// staleness cutoffs) correct.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex is an implementation
/// detail of the SQLite handle, not a coordination mechanism: correctness
/// across processes rests on the conditional updates below.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl StoreHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    current_phase INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    state TEXT NOT NULL DEFAULT '{}',
                    pending_checkpoint TEXT,
                    error TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    phase_index INTEGER NOT NULL,
                    label TEXT NOT NULL,
                    status TEXT NOT NULL,
                    percent INTEGER,
                    output TEXT,
                    error TEXT,
                    duration_ms INTEGER,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    checkpoint_name TEXT NOT NULL,
                    phase_index INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    context TEXT NOT NULL DEFAULT '{}',
                    options TEXT NOT NULL DEFAULT '[]',
                    recommended_option TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    decision TEXT,
                    feedback TEXT,
                    decided_by TEXT,
                    decided_at TEXT,
                    expires_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);
                CREATE INDEX IF NOT EXISTS idx_decisions_run ON decisions(run_id);
                ",
            )
            .context("Failed to create tables")?;

        // At most one pending decision per (run, checkpoint) pair. The whole
        // duplicate-checkpoint failure mode hinges on this index existing.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_pending
                 ON decisions(run_id, checkpoint_name)
                 WHERE status = 'pending';",
            )
            .context("Failed to create pending-decision index")?;

        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        id: &str,
        project_id: &str,
        user_id: &str,
        initial_state: &serde_json::Value,
    ) -> Result<Run> {
        let now = now_rfc3339();
        let state = serde_json::to_string(initial_state)
            .context("Failed to serialize initial state")?;
        self.conn
            .execute(
                "INSERT INTO runs (id, project_id, user_id, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, project_id, user_id, state, now],
            )
            .context("Failed to insert run")?;
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, user_id, current_phase, status, state, pending_checkpoint,
                        error, retry_count, created_at, started_at, completed_at, updated_at
                 FROM runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    user_id: row.get(2)?,
                    current_phase: row.get(3)?,
                    status: row.get(4)?,
                    state: row.get(5)?,
                    pending_checkpoint: row.get(6)?,
                    error: row.get(7)?,
                    retry_count: row.get(8)?,
                    created_at: row.get(9)?,
                    started_at: row.get(10)?,
                    completed_at: row.get(11)?,
                    updated_at: row.get(12)?,
                })
            })
            .context("Failed to query run")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read run row")?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    /// Flip `pending -> running` and stamp `started_at`. Returns the number
    /// of rows matched: zero means another invocation already started it.
    pub fn mark_run_started(&self, id: &str) -> Result<usize> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET status = 'running', started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .context("Failed to mark run started")
    }

    /// Persist a phase's merged snapshot and increment the phase index,
    /// conditional on the run still being at `expected_phase` and running.
    pub fn advance_run_phase(
        &self,
        id: &str,
        expected_phase: i64,
        state: &serde_json::Value,
    ) -> Result<usize> {
        let now = now_rfc3339();
        let state = serde_json::to_string(state).context("Failed to serialize state")?;
        self.conn
            .execute(
                "UPDATE runs SET current_phase = ?1, state = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'running' AND current_phase = ?5",
                params![expected_phase + 1, state, now, id, expected_phase],
            )
            .context("Failed to advance run phase")
    }

    pub fn complete_run(&self, id: &str) -> Result<usize> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET status = 'completed', pending_checkpoint = NULL,
                        completed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now, id],
            )
            .context("Failed to complete run")
    }

    /// Terminal failure from any non-terminal status. Clears the checkpoint
    /// descriptor to hold the terminal-implies-no-checkpoint invariant.
    pub fn fail_run(&self, id: &str, error: &str) -> Result<usize> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET status = 'failed', error = ?1, pending_checkpoint = NULL,
                        completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'running', 'paused')",
                params![error, now, id],
            )
            .context("Failed to fail run")
    }

    /// Suspend a run at a checkpoint, in one transaction:
    /// pause the run (conditional on phase index), cancel any prior pending
    /// decision for the same checkpoint name, insert the new pending row.
    ///
    /// Returns `None` when the run conditional update matched nothing (the
    /// run moved on under us) — nothing is written in that case. A unique
    /// violation on the insert is reported as a "duplicate pending
    /// checkpoint" error; the cancel step makes that unreachable short of a
    /// concurrency bug.
    pub fn suspend_run(
        &self,
        id: &str,
        expected_phase: i64,
        state: &serde_json::Value,
        checkpoint: &Checkpoint,
        expires_at: &str,
    ) -> Result<Option<Decision>> {
        let now = now_rfc3339();
        let state = serde_json::to_string(state).context("Failed to serialize state")?;
        let descriptor =
            serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
        let context = serde_json::to_string(&checkpoint.context)
            .context("Failed to serialize checkpoint context")?;
        let options = serde_json::to_string(&checkpoint.options)
            .context("Failed to serialize checkpoint options")?;

        // StoreHandle's mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin suspend transaction")?;

        let paused = tx
            .execute(
                "UPDATE runs SET status = 'paused', state = ?1, pending_checkpoint = ?2,
                        updated_at = ?3
                 WHERE id = ?4 AND current_phase = ?5 AND status IN ('running', 'paused')",
                params![state, descriptor, now, id, expected_phase],
            )
            .context("Failed to pause run")?;
        if paused == 0 {
            // Run advanced or terminated elsewhere; drop the transaction.
            return Ok(None);
        }

        tx.execute(
            "UPDATE decisions SET status = 'cancelled'
             WHERE run_id = ?1 AND checkpoint_name = ?2 AND status = 'pending'",
            params![id, checkpoint.name],
        )
        .context("Failed to cancel prior pending decision")?;

        let inserted = tx.execute(
            "INSERT INTO decisions (run_id, checkpoint_name, phase_index, title, description,
                                    context, options, recommended_option, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                checkpoint.name,
                expected_phase,
                checkpoint.title,
                checkpoint.description,
                context,
                options,
                checkpoint.recommended_option,
                expires_at,
                now
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                anyhow::bail!(
                    "duplicate pending checkpoint {} for run {}",
                    checkpoint.name,
                    id
                );
            }
            Err(e) => return Err(e).context("Failed to insert pending decision"),
        }
        let decision_id = tx.last_insert_rowid();

        tx.commit().context("Failed to commit suspend transaction")?;

        self.get_decision_by_id(decision_id)?
            .context("Pending decision not found after insert")
            .map(Some)
    }

    /// Resume a paused run: set it running at `next_phase` with the decision
    /// merged into the snapshot. Conditional on `status = 'paused'`.
    pub fn resume_run(
        &self,
        id: &str,
        next_phase: i64,
        state: &serde_json::Value,
    ) -> Result<usize> {
        let now = now_rfc3339();
        let state = serde_json::to_string(state).context("Failed to serialize state")?;
        self.conn
            .execute(
                "UPDATE runs SET status = 'running', current_phase = ?1, state = ?2,
                        pending_checkpoint = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'paused'",
                params![next_phase, state, now, id],
            )
            .context("Failed to resume run")
    }

    /// Run ids stuck in `running` with no progress event (falling back to the
    /// run's own `updated_at`) since `cutoff`.
    pub fn stale_running_runs(&self, cutoff: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.id FROM runs r
                 WHERE r.status = 'running'
                   AND COALESCE(
                         (SELECT MAX(e.created_at) FROM run_events e WHERE e.run_id = r.id),
                         r.updated_at
                       ) < ?1
                 ORDER BY r.id",
            )
            .context("Failed to prepare stale_running_runs")?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))
            .context("Failed to query stale runs")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read stale run id")?);
        }
        Ok(ids)
    }

    // ── Decisions ─────────────────────────────────────────────────────

    /// Settle the pending decision for (run, checkpoint). The `status =
    /// 'pending' AND decided_at IS NULL` guard is the exactly-once
    /// linearization point for resume: the `"iterate"` normalization keeps
    /// status pending, so `decided_at` is what marks a row as consumed.
    pub fn decide(
        &self,
        run_id: &str,
        checkpoint_name: &str,
        status: &DecisionStatus,
        decision: &str,
        feedback: Option<&str>,
        decided_by: &str,
    ) -> Result<usize> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "UPDATE decisions SET status = ?1, decision = ?2, feedback = ?3,
                        decided_by = ?4, decided_at = ?5
                 WHERE run_id = ?6 AND checkpoint_name = ?7
                   AND status = 'pending' AND decided_at IS NULL",
                params![
                    status.as_str(),
                    decision,
                    feedback,
                    decided_by,
                    now,
                    run_id,
                    checkpoint_name
                ],
            )
            .context("Failed to record decision")
    }

    /// Latest decision row for (run, checkpoint), decided or not.
    pub fn get_decision(&self, run_id: &str, checkpoint_name: &str) -> Result<Option<Decision>> {
        self.query_decision(
            "SELECT id, run_id, checkpoint_name, phase_index, title, description, context,
                    options, recommended_option, status, decision, feedback, decided_by,
                    decided_at, expires_at, created_at
             FROM decisions WHERE run_id = ?1 AND checkpoint_name = ?2
             ORDER BY id DESC LIMIT 1",
            params![run_id, checkpoint_name],
        )
    }

    pub fn get_decision_by_id(&self, id: i64) -> Result<Option<Decision>> {
        self.query_decision(
            "SELECT id, run_id, checkpoint_name, phase_index, title, description, context,
                    options, recommended_option, status, decision, feedback, decided_by,
                    decided_at, expires_at, created_at
             FROM decisions WHERE id = ?1",
            params![id],
        )
    }

    pub fn list_decisions(&self, run_id: &str) -> Result<Vec<Decision>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, checkpoint_name, phase_index, title, description, context,
                        options, recommended_option, status, decision, feedback, decided_by,
                        decided_at, expires_at, created_at
                 FROM decisions WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_decisions")?;
        let rows = stmt
            .query_map(params![run_id], decision_row_mapper)
            .context("Failed to query decisions")?;
        let mut decisions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read decision row")?;
            decisions.push(r.into_decision()?);
        }
        Ok(decisions)
    }

    /// Pending decisions whose expiry has passed.
    pub fn overdue_pending_decisions(&self, now: &str) -> Result<Vec<Decision>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, checkpoint_name, phase_index, title, description, context,
                        options, recommended_option, status, decision, feedback, decided_by,
                        decided_at, expires_at, created_at
                 FROM decisions WHERE status = 'pending' AND expires_at < ?1 ORDER BY id",
            )
            .context("Failed to prepare overdue_pending_decisions")?;
        let rows = stmt
            .query_map(params![now], decision_row_mapper)
            .context("Failed to query overdue decisions")?;
        let mut decisions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read decision row")?;
            decisions.push(r.into_decision()?);
        }
        Ok(decisions)
    }

    pub fn expire_decision(&self, id: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE decisions SET status = 'expired' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .context("Failed to expire decision")
    }

    fn query_decision(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Decision>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare query")?;
        let mut rows = stmt
            .query_map(params, decision_row_mapper)
            .context("Failed to query decision")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read decision row")?;
                Ok(Some(r.into_decision()?))
            }
            None => Ok(None),
        }
    }

    // ── Progress events ───────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn record_event(
        &self,
        run_id: &str,
        phase_index: i64,
        label: &str,
        status: &EventStatus,
        percent: Option<i64>,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<RunEvent> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO run_events (run_id, phase_index, label, status, percent, output,
                                         error, duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    phase_index,
                    label,
                    status.as_str(),
                    percent,
                    output,
                    error,
                    duration_ms,
                    now
                ],
            )
            .context("Failed to insert run event")?;
        let id = self.conn.last_insert_rowid();
        Ok(RunEvent {
            id,
            run_id: run_id.to_string(),
            phase_index,
            label: label.to_string(),
            status: *status,
            percent,
            output: output.map(|s| s.to_string()),
            error: error.map(|s| s.to_string()),
            duration_ms,
            created_at: now,
        })
    }

    /// All events for a run in creation order.
    pub fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, phase_index, label, status, percent, output, error,
                        duration_ms, created_at
                 FROM run_events WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })
            .context("Failed to query run events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, run_id, phase_index, label, status_str, percent, output, error, duration_ms, created_at) =
                row.context("Failed to read run event row")?;
            let status = EventStatus::from_str(&status_str)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse event status")?;
            events.push(RunEvent {
                id,
                run_id,
                phase_index,
                label,
                status,
                percent,
                output,
                error,
                duration_ms,
                created_at,
            });
        }
        Ok(events)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading runs from SQLite before converting
/// status / state / pending_checkpoint strings into typed values.
struct RunRow {
    id: String,
    project_id: String,
    user_id: String,
    current_phase: i64,
    status: String,
    state: String,
    pending_checkpoint: Option<String>,
    error: Option<String>,
    retry_count: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        let state: serde_json::Value =
            serde_json::from_str(&self.state).context("Failed to parse run state JSON")?;
        let pending_checkpoint = match self.pending_checkpoint {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("corrupt checkpoint JSON '{}': {}", raw, e))?,
            ),
            None => None,
        };
        Ok(Run {
            id: self.id,
            project_id: self.project_id,
            user_id: self.user_id,
            current_phase: self.current_phase,
            status,
            state,
            pending_checkpoint,
            error: self.error,
            retry_count: self.retry_count,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

struct DecisionRow {
    id: i64,
    run_id: String,
    checkpoint_name: String,
    phase_index: i64,
    title: String,
    description: String,
    context: String,
    options: String,
    recommended_option: Option<String>,
    status: String,
    decision: Option<String>,
    feedback: Option<String>,
    decided_by: Option<String>,
    decided_at: Option<String>,
    expires_at: String,
    created_at: String,
}

fn decision_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRow> {
    Ok(DecisionRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        checkpoint_name: row.get(2)?,
        phase_index: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        context: row.get(6)?,
        options: row.get(7)?,
        recommended_option: row.get(8)?,
        status: row.get(9)?,
        decision: row.get(10)?,
        feedback: row.get(11)?,
        decided_by: row.get(12)?,
        decided_at: row.get(13)?,
        expires_at: row.get(14)?,
        created_at: row.get(15)?,
    })
}

impl DecisionRow {
    fn into_decision(self) -> Result<Decision> {
        let status = DecisionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse decision status")?;
        let context: serde_json::Value = serde_json::from_str(&self.context)
            .map_err(|e| anyhow::anyhow!("corrupt context JSON '{}': {}", self.context, e))?;
        let options: Vec<DecisionOption> = serde_json::from_str(&self.options)
            .map_err(|e| anyhow::anyhow!("corrupt options JSON '{}': {}", self.options, e))?;
        Ok(Decision {
            id: self.id,
            run_id: self.run_id,
            checkpoint_name: self.checkpoint_name,
            phase_index: self.phase_index,
            title: self.title,
            description: self.description,
            context,
            options,
            recommended_option: self.recommended_option,
            status,
            decision: self.decision,
            feedback: self.feedback,
            decided_by: self.decided_by,
            decided_at: self.decided_at,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_checkpoint(name: &str) -> Checkpoint {
        Checkpoint {
            name: name.to_string(),
            title: format!("Approve {}", name),
            description: "needs a human".to_string(),
            context: json!({"k": "v"}),
            options: vec![
                DecisionOption::new("approved", "Approve", "continue"),
                DecisionOption::new("rejected", "Reject", "stop"),
            ],
            recommended_option: Some("approved".to_string()),
        }
    }

    fn make_run(db: &EngineDb) -> Run {
        db.create_run("run-1", "proj-1", "user-1", &json!({"input": {"idea": "x"}}))
            .unwrap()
    }

    #[test]
    fn migrations_create_tables_and_pending_index() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('runs', 'run_events', 'decisions')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3, "Expected 3 tables to exist");

        let index_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index'
             AND name = 'idx_decisions_pending'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 1, "Expected pending-decision index to exist");
        Ok(())
    }

    #[test]
    fn create_and_get_run() {
        let db = EngineDb::new_in_memory().unwrap();
        let run = make_run(&db);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.current_phase, 0);
        assert_eq!(run.state["input"]["idea"], json!("x"));
        assert!(run.pending_checkpoint.is_none());
        assert!(run.started_at.is_none());

        let fetched = db.get_run("run-1").unwrap().expect("run should exist");
        assert_eq!(fetched.project_id, "proj-1");
        assert!(db.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn mark_started_is_conditional() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        assert_eq!(db.mark_run_started("run-1").unwrap(), 1);
        // Second invocation observes the post-transition state and no-ops.
        assert_eq!(db.mark_run_started("run-1").unwrap(), 0);
        let run = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
    }

    #[test]
    fn advance_phase_is_conditional_on_expected_index() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        assert_eq!(db.advance_run_phase("run-1", 0, &json!({"a": 1})).unwrap(), 1);
        // Losing racer presents the stale expected index and matches nothing.
        assert_eq!(db.advance_run_phase("run-1", 0, &json!({"a": 2})).unwrap(), 0);
        let run = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.current_phase, 1);
        assert_eq!(run.state, json!({"a": 1}));
    }

    #[test]
    fn suspend_inserts_pending_and_pauses() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        let decision = db
            .suspend_run("run-1", 0, &json!({"s": 1}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .expect("suspend should match the running run");
        assert_eq!(decision.status, DecisionStatus::Pending);
        assert_eq!(decision.phase_index, 0);
        assert_eq!(decision.options.len(), 2);

        let run = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(run.pending_checkpoint.as_ref().unwrap().name, "gate_a");
        // Suspension does not advance the index; resume decides that.
        assert_eq!(run.current_phase, 0);
    }

    #[test]
    fn suspend_supersedes_prior_pending_decision() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        let first = db
            .suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        // Retried suspend for the same run/phase/checkpoint.
        let second = db
            .suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        assert_ne!(first.id, second.id);

        let all = db.list_decisions("run-1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, DecisionStatus::Cancelled);
        assert_eq!(all[1].status, DecisionStatus::Pending);
        let pending: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM decisions WHERE run_id = 'run-1' AND status = 'pending'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn suspend_against_moved_on_run_writes_nothing() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.advance_run_phase("run-1", 0, &json!({})).unwrap();
        let outcome = db
            .suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap();
        assert!(outcome.is_none());
        assert!(db.list_decisions("run-1").unwrap().is_empty());
        let run = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn pending_index_allows_settled_duplicates() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        db.decide(
            "run-1",
            "gate_a",
            &DecisionStatus::Approved,
            "approved",
            None,
            "alice",
        )
        .unwrap();
        // A fresh pending row for the same checkpoint name is legal once the
        // prior one left 'pending'.
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        assert_eq!(db.list_decisions("run-1").unwrap().len(), 2);
    }

    #[test]
    fn decide_is_exactly_once() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        assert_eq!(
            db.decide("run-1", "gate_a", &DecisionStatus::Approved, "segment_1", Some("fine"), "alice")
                .unwrap(),
            1
        );
        assert_eq!(
            db.decide("run-1", "gate_a", &DecisionStatus::Approved, "segment_1", None, "bob")
                .unwrap(),
            0
        );
        let d = db.get_decision("run-1", "gate_a").unwrap().unwrap();
        assert_eq!(d.status, DecisionStatus::Approved);
        assert_eq!(d.decision.as_deref(), Some("segment_1"));
        assert_eq!(d.decided_by.as_deref(), Some("alice"));
        assert_eq!(d.feedback.as_deref(), Some("fine"));
        assert!(d.decided_at.is_some());
    }

    #[test]
    fn iterate_decide_consumes_the_row_via_decided_at() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        // "iterate" keeps status pending but stamps decided_at, so the second
        // call matches nothing.
        assert_eq!(
            db.decide("run-1", "gate_a", &DecisionStatus::Pending, "iterate", None, "alice")
                .unwrap(),
            1
        );
        assert_eq!(
            db.decide("run-1", "gate_a", &DecisionStatus::Pending, "iterate", None, "alice")
                .unwrap(),
            0
        );
        let d = db.get_decision("run-1", "gate_a").unwrap().unwrap();
        assert_eq!(d.status, DecisionStatus::Pending);
        assert_eq!(d.decision.as_deref(), Some("iterate"));
    }

    #[test]
    fn resume_run_is_conditional_on_paused() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        assert_eq!(db.resume_run("run-1", 1, &json!({"d": 1})).unwrap(), 1);
        assert_eq!(db.resume_run("run-1", 1, &json!({"d": 2})).unwrap(), 0);
        let run = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_phase, 1);
        assert!(run.pending_checkpoint.is_none());
    }

    #[test]
    fn fail_run_clears_checkpoint_and_is_terminal() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        assert_eq!(db.fail_run("run-1", "boom").unwrap(), 1);
        let run = db.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.pending_checkpoint.is_none());
        // Terminal rows accept no further transitions.
        assert_eq!(db.fail_run("run-1", "again").unwrap(), 0);
        assert_eq!(db.complete_run("run-1").unwrap(), 0);
        assert_eq!(db.resume_run("run-1", 2, &json!({})).unwrap(), 0);
    }

    #[test]
    fn events_are_append_only_and_ordered() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.record_event("run-1", 0, "onboarding", &EventStatus::Started, None, None, None, None)
            .unwrap();
        db.record_event("run-1", 0, "onboarding", &EventStatus::Completed, Some(100), None, None, Some(12))
            .unwrap();
        db.record_event("run-1", 1, "discovery", &EventStatus::Started, None, None, None, None)
            .unwrap();
        let events = db.list_events("run-1").unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events[1].status, EventStatus::Completed);
        assert_eq!(events[1].duration_ms, Some(12));
        assert_eq!(events[2].label, "discovery");
    }

    #[test]
    fn overdue_and_expire() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        db.suspend_run("run-1", 0, &json!({}), &test_checkpoint("gate_a"), "2000-01-01T00:00:00.000000Z")
            .unwrap()
            .unwrap();
        let overdue = db.overdue_pending_decisions(&now_rfc3339()).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(db.expire_decision(overdue[0].id).unwrap(), 1);
        assert_eq!(db.expire_decision(overdue[0].id).unwrap(), 0);
        assert!(db.overdue_pending_decisions(&now_rfc3339()).unwrap().is_empty());
    }

    #[test]
    fn suspended_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        // First worker: run up to a checkpoint, then drop the process.
        {
            let db = EngineDb::new(&path).unwrap();
            db.create_run("run-1", "p", "u", &json!({"input": {"idea": "x"}}))
                .unwrap();
            db.mark_run_started("run-1").unwrap();
            db.advance_run_phase("run-1", 0, &json!({"onboarding": "done"}))
                .unwrap();
            db.suspend_run("run-1", 1, &json!({"gate": 1}), &test_checkpoint("gate_a"), "2999-01-01T00:00:00.000000Z")
                .unwrap()
                .unwrap();
        }

        // Second worker reconstructs the full execution context.
        {
            let db = EngineDb::new(&path).unwrap();
            let run = db.get_run("run-1").unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Paused);
            assert_eq!(run.current_phase, 1);
            assert_eq!(run.state, json!({"gate": 1}));
            assert_eq!(run.pending_checkpoint.as_ref().unwrap().name, "gate_a");

            let decision = db.get_decision("run-1", "gate_a").unwrap().unwrap();
            assert_eq!(decision.status, DecisionStatus::Pending);
            assert_eq!(db.resume_run("run-1", 2, &json!({"gate": 1})).unwrap(), 1);
        }
    }

    #[test]
    fn stale_running_runs_uses_latest_event() {
        let db = EngineDb::new_in_memory().unwrap();
        make_run(&db);
        db.mark_run_started("run-1").unwrap();
        let far_future = "2999-01-01T00:00:00.000000Z";
        assert_eq!(db.stale_running_runs(far_future).unwrap(), vec!["run-1".to_string()]);
        // A fresh event moves the run out of the stale window.
        db.record_event("run-1", 0, "onboarding", &EventStatus::Started, None, None, None, None)
            .unwrap();
        assert!(db.stale_running_runs(&"2000-01-01T00:00:00.000000Z".to_string()).unwrap().is_empty());
    }
}
