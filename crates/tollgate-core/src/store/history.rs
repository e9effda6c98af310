//! Execution history: append-only run records keyed by change-set
//! fingerprint and start time, indexed by shape fingerprint.
//!
//! Recording is fire-and-forget from the orchestrator's point of view. A
//! store error is logged and dropped by [`HistoryRecorder`]; it never changes
//! a verdict.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::errors::{TollgateError, TollgateResult};
use crate::gates::guards::MAX_HINT_SAMPLES;
use crate::models::{CheckOutcome, ExecutionRun};
use crate::store::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MEMORY_CAPACITY: usize = 1_000;

/// Narrow persistence interface the orchestrator depends on.
pub trait HistoryStore: Send + Sync {
    /// Persist a finalized run. Recording the same `run_id` twice is a no-op.
    fn record(&self, run: &ExecutionRun) -> TollgateResult<()>;

    /// Most recent runs with the given shape fingerprint, newest first.
    fn query_by_shape(&self, shape_fingerprint: &str, limit: usize)
        -> TollgateResult<Vec<ExecutionRun>>;
}

fn ensure_finalized(run: &ExecutionRun) -> TollgateResult<()> {
    if run.is_finalized() {
        Ok(())
    } else {
        Err(TollgateError::Store(format!(
            "run {} has no verdict yet",
            run.run_id
        )))
    }
}

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if raw.len() > 2 {
                expanded.push(&raw[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Aggregate outcome counts for one check across all recorded runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckStats {
    pub executions: u64,
    pub passes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub skipped: u64,
    /// Mean duration of non-skipped executions.
    pub mean_duration_ms: Option<f64>,
}

impl CheckStats {
    pub fn failure_rate(&self) -> f64 {
        let ran = self.executions.saturating_sub(self.skipped);
        if ran == 0 {
            0.0
        } else {
            (self.failures + self.timeouts) as f64 / ran as f64
        }
    }
}

/// SQLite-backed history. Every call opens its own connection so the store
/// can be shared across threads without holding a connection open.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db_path: PathBuf,
}

impl SqliteHistoryStore {
    /// Resolve the path (tilde and relative paths), create parent
    /// directories, and initialise the schema.
    pub fn open(db_path: impl AsRef<Path>) -> TollgateResult<Self> {
        let expanded = expand_tilde(db_path.as_ref());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path: resolved };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> TollgateResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    fn init_schema(&self) -> TollgateResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    pub fn schema_version(&self) -> TollgateResult<i32> {
        let conn = self.connect()?;
        Ok(schema::get_schema_version(&conn))
    }

    /// Runs of one change set, oldest first.
    pub fn runs_for_change_set(&self, fingerprint: &str) -> TollgateResult<Vec<ExecutionRun>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_json FROM runs WHERE change_set_fingerprint = ?1 \
             ORDER BY started_at_ms ASC, id ASC;",
        )?;
        let rows = stmt.query_map(params![fingerprint], |row| row.get::<_, String>(0))?;
        decode_runs(rows)
    }

    pub fn check_stats(&self, check: &str) -> TollgateResult<CheckStats> {
        let conn = self.connect()?;
        let stats = conn.query_row(
            "SELECT COUNT(*), \
                    SUM(outcome = ?2), SUM(outcome = ?3), SUM(outcome = ?4), SUM(outcome = ?5), \
                    AVG(CASE WHEN outcome != ?5 THEN duration_ms END) \
             FROM run_checks WHERE name = ?1;",
            params![
                check,
                CheckOutcome::Pass.as_str(),
                CheckOutcome::Fail.as_str(),
                CheckOutcome::TimedOut.as_str(),
                CheckOutcome::Skipped.as_str(),
            ],
            |row| {
                let count = |idx: usize| -> rusqlite::Result<u64> {
                    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0).max(0) as u64)
                };
                Ok(CheckStats {
                    executions: count(0)?,
                    passes: count(1)?,
                    failures: count(2)?,
                    timeouts: count(3)?,
                    skipped: count(4)?,
                    mean_duration_ms: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    pub fn count_runs(&self) -> TollgateResult<u64> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM runs;", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

fn decode_runs<I>(rows: I) -> TollgateResult<Vec<ExecutionRun>>
where
    I: Iterator<Item = rusqlite::Result<String>>,
{
    let mut runs = Vec::new();
    for row in rows {
        let json = row?;
        match serde_json::from_str::<ExecutionRun>(&json) {
            Ok(run) => runs.push(run),
            Err(e) => tracing::warn!(error = %e, "skipping undecodable history row"),
        }
    }
    Ok(runs)
}

impl HistoryStore for SqliteHistoryStore {
    fn record(&self, run: &ExecutionRun) -> TollgateResult<()> {
        ensure_finalized(run)?;
        let run_json = serde_json::to_string(run)?;
        let verdict = run.verdict.map(|v| v.as_str()).unwrap_or_default();

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO runs ( \
                 run_id, change_set_fingerprint, shape_fingerprint, selected_level, \
                 final_level, risk_level, verdict, escalated, duration_ms, started_at_ms, run_json \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(run_id) DO NOTHING;",
            params![
                run.run_id,
                run.change_set_fingerprint,
                run.shape_fingerprint,
                run.selected_level,
                run.final_level(),
                run.risk_level.as_str(),
                verdict,
                run.escalated() as i64,
                run.duration.as_millis() as i64,
                run.started_at_ms as i64,
                run_json,
            ],
        )?;
        if inserted == 0 {
            tracing::debug!(run = %run.run_id, "run already recorded");
            return Ok(());
        }
        for result in &run.results {
            tx.execute(
                "INSERT INTO run_checks (run_id, name, level, outcome, duration_ms, attempts) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                params![
                    run.run_id,
                    result.name,
                    result.level,
                    result.outcome.as_str(),
                    result.duration.as_millis() as i64,
                    result.attempts as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn query_by_shape(
        &self,
        shape_fingerprint: &str,
        limit: usize,
    ) -> TollgateResult<Vec<ExecutionRun>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_json FROM runs WHERE shape_fingerprint = ?1 \
             ORDER BY started_at_ms DESC, id DESC LIMIT ?2;",
        )?;
        let rows = stmt.query_map(params![shape_fingerprint, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        decode_runs(rows)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Bounded in-process history; the oldest run is evicted past capacity.
#[derive(Debug)]
pub struct MemoryHistoryStore {
    runs: Mutex<IndexMap<String, ExecutionRun>>,
    capacity: usize,
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryHistoryStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            runs: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }

    pub fn get(&self, run_id: &str) -> Option<ExecutionRun> {
        self.runs.lock().get(run_id).cloned()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn record(&self, run: &ExecutionRun) -> TollgateResult<()> {
        ensure_finalized(run)?;
        let mut runs = self.runs.lock();
        if runs.contains_key(&run.run_id) {
            return Ok(());
        }
        runs.insert(run.run_id.clone(), run.clone());
        while runs.len() > self.capacity {
            runs.shift_remove_index(0);
        }
        Ok(())
    }

    fn query_by_shape(
        &self,
        shape_fingerprint: &str,
        limit: usize,
    ) -> TollgateResult<Vec<ExecutionRun>> {
        let runs = self.runs.lock();
        Ok(runs
            .values()
            .rev()
            .filter(|run| run.shape_fingerprint == shape_fingerprint)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Orchestrator-facing wrapper that never propagates store errors.
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    background: bool,
    query_limit: usize,
}

impl std::fmt::Debug for HistoryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRecorder")
            .field("background", &self.background)
            .field("query_limit", &self.query_limit)
            .finish_non_exhaustive()
    }
}

impl HistoryRecorder {
    /// Records on the rayon global pool.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            background: true,
            query_limit: MAX_HINT_SAMPLES,
        }
    }

    /// Records on the calling thread.
    pub fn inline(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            background: false,
            ..Self::new(store)
        }
    }

    pub fn with_query_limit(mut self, limit: usize) -> Self {
        self.query_limit = limit.clamp(1, MAX_HINT_SAMPLES);
        self
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.store)
    }

    pub fn record(&self, run: &ExecutionRun) {
        if self.background {
            let store = Arc::clone(&self.store);
            let run = run.clone();
            rayon::spawn(move || write_run(store.as_ref(), &run));
        } else {
            write_run(self.store.as_ref(), run);
        }
    }

    /// Past runs for the hint. A failing store yields no history.
    pub fn query(&self, shape_fingerprint: &str) -> Vec<ExecutionRun> {
        match self.store.query_by_shape(shape_fingerprint, self.query_limit) {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(shape = %shape_fingerprint, error = %e, "history query failed");
                Vec::new()
            }
        }
    }
}

fn write_run(store: &dyn HistoryStore, run: &ExecutionRun) {
    match store.record(run) {
        Ok(()) => tracing::debug!(run = %run.run_id, "run recorded"),
        Err(e) => tracing::warn!(run = %run.run_id, error = %e, "failed to record run history"),
    }
}
