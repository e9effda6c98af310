//! History database layout and the versioned steps that bring older
//! databases up to it.

use rusqlite::Connection;

use crate::errors::TollgateResult;

/// Current schema version; the version of the last entry in [`MIGRATIONS`].
pub const SCHEMA_VERSION: i32 = 3;

const RUNS_TABLE: &str = "CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    change_set_fingerprint TEXT NOT NULL,
    shape_fingerprint TEXT NOT NULL,
    selected_level TEXT NOT NULL,
    final_level TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    verdict TEXT NOT NULL,
    escalated INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL,
    started_at_ms INTEGER NOT NULL,
    run_json TEXT NOT NULL,
    recorded_at TEXT DEFAULT CURRENT_TIMESTAMP
);";

const RUN_CHECKS_TABLE: &str = "CREATE TABLE IF NOT EXISTS run_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    name TEXT NOT NULL,
    level TEXT NOT NULL,
    outcome TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1
);";

const RUN_CHECKS_BY_RUN: &str =
    "CREATE INDEX IF NOT EXISTS idx_run_checks_run ON run_checks(run_id);";

const RUN_CHECKS_BY_OUTCOME: &str =
    "CREATE INDEX IF NOT EXISTS idx_run_checks_name_outcome ON run_checks(name, outcome);";

/// Layout of a current database. Every statement is `IF NOT EXISTS`, so the
/// list can be replayed on any existing file before [`migrate_schema`].
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    RUNS_TABLE,
    RUN_CHECKS_TABLE,
    "CREATE INDEX IF NOT EXISTS idx_runs_shape
        ON runs(shape_fingerprint, started_at_ms DESC);",
    "CREATE INDEX IF NOT EXISTS idx_runs_change_set
        ON runs(change_set_fingerprint, started_at_ms);",
    RUN_CHECKS_BY_RUN,
    RUN_CHECKS_BY_OUTCOME,
];

/// One change a migration makes to the history tables.
enum Change {
    /// Idempotent DDL.
    Create(&'static str),
    /// Add `column` to `table` when missing, then fill it for existing rows.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
        backfill: &'static str,
    },
}

/// Changes that take a database to `version`.
struct Migration {
    version: i32,
    changes: &'static [Change],
}

const MIGRATIONS: &[Migration] = &[
    // Runs only; the table itself comes from the layout.
    Migration {
        version: 1,
        changes: &[],
    },
    // Per-check rows for threshold tuning.
    Migration {
        version: 2,
        changes: &[
            Change::Create(RUN_CHECKS_TABLE),
            Change::Create(RUN_CHECKS_BY_RUN),
            Change::Create(RUN_CHECKS_BY_OUTCOME),
        ],
    },
    // Where a run ended and whether it got there by escalating.
    Migration {
        version: 3,
        changes: &[
            Change::AddColumn {
                table: "runs",
                column: "final_level",
                definition: "TEXT NOT NULL DEFAULT ''",
                backfill: "UPDATE runs SET final_level = selected_level WHERE final_level = '';",
            },
            Change::AddColumn {
                table: "runs",
                column: "escalated",
                definition: "INTEGER NOT NULL DEFAULT 0",
                backfill: "UPDATE runs SET escalated = 1 WHERE final_level <> selected_level;",
            },
        ],
    },
];

/// Apply every migration above the stored version, in order. Each one runs
/// inside its own SAVEPOINT; a failing migration is rolled back, logged to
/// `migration_history`, and stops the upgrade.
pub fn migrate_schema(conn: &Connection) -> TollgateResult<()> {
    let mut version = get_schema_version(conn);
    for migration in MIGRATIONS.iter().filter(move |m| m.version > version) {
        conn.execute_batch("SAVEPOINT tollgate_migrate_step;")?;
        match apply(conn, migration) {
            Ok(()) => {
                record_step(conn, version, migration.version, "success", None)?;
                conn.execute_batch("RELEASE SAVEPOINT tollgate_migrate_step;")?;
                tracing::debug!(from = version, to = migration.version, "history schema migrated");
                version = migration.version;
            }
            Err(e) => {
                let _ = conn.execute_batch(
                    "ROLLBACK TO SAVEPOINT tollgate_migrate_step;
                     RELEASE SAVEPOINT tollgate_migrate_step;",
                );
                let message = e.to_string();
                let _ = record_step(conn, version, migration.version, "failed", Some(&message));
                return Err(e);
            }
        }
    }
    Ok(())
}

fn apply(conn: &Connection, migration: &Migration) -> TollgateResult<()> {
    for change in migration.changes {
        match change {
            Change::Create(ddl) => conn.execute_batch(ddl)?,
            Change::AddColumn {
                table,
                column,
                definition,
                backfill,
            } => {
                if !has_column(conn, table, column)? {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {table} ADD COLUMN {column} {definition};"
                    ))?;
                    conn.execute_batch(backfill)?;
                }
            }
        }
    }
    conn.execute(
        "INSERT INTO store_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![migration.version.to_string()],
    )?;
    Ok(())
}

/// Stored schema version, or 0 for a database that predates versioning.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn record_step(
    conn: &Connection,
    from: i32,
    to: i32,
    status: &str,
    error: Option<&str>,
) -> TollgateResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message)
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from, to, status, error],
    )?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> TollgateResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
