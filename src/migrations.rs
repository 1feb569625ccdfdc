//! Additive schema migration engine.
//!
//! The declared model (`schema::MODEL`) is diffed against the live database:
//! missing tables are created, missing columns are added and missing indexes
//! are built. Nothing is ever dropped, renamed or retyped by this path.
//!
//! `plan` is a pure function over descriptors. `apply` runs each step in its
//! own transaction and reports per step, so one failure never blocks the rest.
//! The declared version is recorded in `schema_version` once a run applies
//! cleanly; a live version newer than the declared one is refused.
//!
//! `rebuild` is the only destructive operation and requires the typed
//! confirmation phrase.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use crate::schema::{ColumnDef, DeclaredModel, IndexDef, TableDef, MODEL};

/// Phrase an operator must type to allow `rebuild`.
pub const REBUILD_CONFIRMATION: &str = "DELETE ALL DATA";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(
        "Database schema version ({live}) is newer than this version of Codex supports ({known}). \
         Please update Codex to the latest version."
    )]
    NewerSchema { live: i32, known: i32 },

    #[error("Pre-migration backup failed: {0}")]
    Backup(String),

    #[error("Rebuild refused: type 'DELETE ALL DATA' to confirm")]
    ConfirmationRequired,
}

// ---------------------------------------------------------------------------
// Live schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTable {
    pub columns: Vec<LiveColumn>,
    pub has_rows: bool,
}

impl LiveTable {
    pub fn column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Structure of an existing database, keyed by lower-cased table name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    pub tables: BTreeMap<String, LiveTable>,
    pub indexes: BTreeSet<String>,
}

impl LiveSchema {
    pub fn table(&self, name: &str) -> Option<&LiveTable> {
        self.tables.get(&name.to_ascii_lowercase())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Read tables, columns and indexes from `sqlite_master` and `PRAGMA table_info`.
pub fn introspect(conn: &Connection) -> Result<LiveSchema, rusqlite::Error> {
    let mut schema = LiveSchema::default();

    let table_names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    for name in table_names {
        let columns: Vec<LiveColumn> = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
            let rows = stmt.query_map([], |row| {
                Ok(LiveColumn {
                    name: row.get(1)?,
                    declared_type: row.get(2)?,
                    not_null: row.get::<_, i64>(3)? != 0,
                    default: row.get(4)?,
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })?;
            rows.collect::<Result<_, _>>()?
        };
        let has_rows = conn
            .prepare(&format!("SELECT 1 FROM {} LIMIT 1", quote_ident(&name)))?
            .exists([])?;
        schema
            .tables
            .insert(name.to_ascii_lowercase(), LiveTable { columns, has_rows });
    }

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for name in rows {
        schema.indexes.insert(name?.to_ascii_lowercase());
    }

    Ok(schema)
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Why a declared NOT NULL column is added as nullable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NullableDowngrade {
    /// The table already holds rows that would have no value.
    ExistingRows,
    /// SQLite cannot add a NOT NULL column without a default, even to an empty table.
    MissingDefault,
}

impl fmt::Display for NullableDowngrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExistingRows => f.write_str("table already has rows"),
            Self::MissingDefault => f.write_str("column has no default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    CreateTable(TableDef),
    AddColumn {
        table: &'static str,
        column: ColumnDef,
        downgrade: Option<NullableDowngrade>,
    },
    CreateIndex(IndexDef),
}

impl MigrationStep {
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable(table) => format!("create table {}", table.name),
            Self::AddColumn { table, column, .. } => {
                format!("add column {}.{} {}", table, column.name, column.ty)
            }
            Self::CreateIndex(index) => format!("create index {} on {}", index.name, index.table),
        }
    }

    /// SQL statements for this step, run together in one transaction.
    pub fn statements(&self) -> Vec<String> {
        match self {
            Self::CreateTable(table) => vec![table.create_sql()],
            Self::AddColumn {
                table,
                column,
                downgrade,
            } => {
                let mut effective = *column;
                if downgrade.is_some() {
                    effective.nullable = true;
                }
                // ALTER TABLE cannot add a UNIQUE column; enforce it with an index instead.
                effective.unique = false;
                let mut statements = vec![format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    table,
                    effective.create_sql(false)
                )];
                if column.unique {
                    statements.push(format!(
                        "CREATE UNIQUE INDEX IF NOT EXISTS uq_{table}_{col} ON {table} ({col})",
                        table = table,
                        col = column.name
                    ));
                }
                statements
            }
            Self::CreateIndex(index) => vec![index.create_sql()],
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationPlan {
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Compute the additive diff between the declared model and the live schema.
///
/// Tables come first in declaration order, then missing columns of existing
/// tables, then indexes, so every index step follows the columns it covers.
pub fn plan(model: &DeclaredModel, live: &LiveSchema) -> MigrationPlan {
    let mut steps = Vec::new();

    for table in model.tables {
        if live.table(table.name).is_none() {
            steps.push(MigrationStep::CreateTable(*table));
        }
    }

    for table in model.tables {
        let Some(live_table) = live.table(table.name) else {
            continue;
        };
        for column in table.columns {
            if live_table.column(column.name).is_some() {
                continue;
            }
            let downgrade = if !column.nullable && column.default.is_none() {
                Some(if live_table.has_rows {
                    NullableDowngrade::ExistingRows
                } else {
                    NullableDowngrade::MissingDefault
                })
            } else {
                None
            };
            steps.push(MigrationStep::AddColumn {
                table: table.name,
                column: *column,
                downgrade,
            });
        }
    }

    for index in model.indexes {
        if !live.indexes.contains(&index.name.to_ascii_lowercase()) {
            steps.push(MigrationStep::CreateIndex(*index));
        }
    }

    MigrationPlan { steps }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeNotice {
    pub table: String,
    pub column: String,
    pub reason: NullableDowngrade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub downgraded: Vec<DowngradeNotice>,
    pub failed: Vec<FailedStep>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn apply_step(conn: &Connection, step: &MigrationStep) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    for sql in step.statements() {
        tx.execute_batch(&sql)?;
    }
    tx.commit()
}

/// Apply every step of `plan`, each in its own transaction.
pub fn apply(conn: &Connection, plan: &MigrationPlan) -> MigrationReport {
    let mut report = MigrationReport::default();

    for step in &plan.steps {
        match apply_step(conn, step) {
            Ok(()) => {
                log::info!("Migration: applied {}", step);
                report.applied.push(step.describe());
                if let MigrationStep::AddColumn {
                    table,
                    column,
                    downgrade: Some(reason),
                } = step
                {
                    log::warn!(
                        "Migration: {}.{} added as nullable ({}); backfill and tighten manually",
                        table,
                        column.name,
                        reason
                    );
                    report.downgraded.push(DowngradeNotice {
                        table: table.to_string(),
                        column: column.name.to_string(),
                        reason: *reason,
                    });
                }
            }
            Err(e) => {
                log::error!("Migration: {} failed: {}", step, e);
                report.failed.push(FailedStep {
                    step: step.describe(),
                    error: e.to_string(),
                });
            }
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Version bookkeeping
// ---------------------------------------------------------------------------

fn ensure_schema_version_table(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
}

/// Highest recorded model version, or 0 if none.
pub fn current_version(conn: &Connection) -> Result<i32, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Hot copy of the database at `<db_path>.pre-migration.bak`.
fn backup_before_migration(conn: &Connection) -> Result<(), MigrationError> {
    let db_path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = Connection::open(&backup_path)
        .map_err(|e| MigrationError::Backup(format!("open {}: {}", backup_path, e)))?;
    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| MigrationError::Backup(e.to_string()))?;
    backup
        .step(-1)
        .map_err(|e| MigrationError::Backup(e.to_string()))?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Diff `model` against the live database without changing anything.
pub fn pending_plan(conn: &Connection, model: &DeclaredModel) -> Result<MigrationPlan, MigrationError> {
    let live = introspect(conn)?;
    Ok(plan(model, &live))
}

/// Bring the live schema up to `model`.
pub fn migrate(conn: &Connection, model: &DeclaredModel) -> Result<MigrationReport, MigrationError> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    if current > model.version {
        return Err(MigrationError::NewerSchema {
            live: current,
            known: model.version,
        });
    }

    let plan = pending_plan(conn, model)?;
    let report = if plan.is_empty() {
        MigrationReport::default()
    } else {
        backup_before_migration(conn)?;
        apply(conn, &plan)
    };

    if report.is_clean() && current < model.version {
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            [model.version],
        )?;
        log::info!("Schema at v{}", model.version);
    }

    Ok(report)
}

/// Run the additive migration for the current declared model.
pub fn run_migrations(conn: &Connection) -> Result<MigrationReport, MigrationError> {
    migrate(conn, &MODEL)
}

/// Drop every table and recreate the declared model from scratch.
pub fn rebuild(conn: &Connection, confirmation: &str) -> Result<MigrationReport, MigrationError> {
    if confirmation.trim() != REBUILD_CONFIRMATION {
        return Err(MigrationError::ConfirmationRequired);
    }

    backup_before_migration(conn)?;

    let live = introspect(conn)?;
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let tx = conn.unchecked_transaction()?;
    for name in live.tables.keys() {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
    }
    tx.commit()?;
    log::warn!("Rebuild: dropped {} tables", live.tables.len());

    let report = run_migrations(conn)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{column, ColumnType};

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    const WIDGETS_V1: TableDef = TableDef {
        name: "widgets",
        columns: &[
            column("id", ColumnType::Integer).primary_key(),
            column("name", ColumnType::Text).not_null(),
        ],
    };

    const WIDGETS_V2: TableDef = TableDef {
        name: "widgets",
        columns: &[
            column("id", ColumnType::Integer).primary_key(),
            column("name", ColumnType::Text).not_null(),
            column("serial", ColumnType::Text).unique(),
            column("weight", ColumnType::Real),
            column("owner", ColumnType::Text).not_null(),
            column("active", ColumnType::Integer).not_null().default_sql("1"),
        ],
    };

    const GADGETS: TableDef = TableDef {
        name: "gadgets",
        columns: &[
            column("id", ColumnType::Integer).primary_key(),
            column("widget_id", ColumnType::Integer).not_null(),
        ],
    };

    const MODEL_V1: DeclaredModel = DeclaredModel {
        version: 1,
        tables: &[WIDGETS_V1],
        indexes: &[],
    };

    const MODEL_V2: DeclaredModel = DeclaredModel {
        version: 2,
        tables: &[WIDGETS_V2, GADGETS],
        indexes: &[IndexDef {
            name: "idx_gadgets_widget",
            table: "gadgets",
            columns: &["widget_id"],
            unique: false,
            filter: None,
        }],
    };

    #[test]
    fn test_fresh_db_creates_declared_model() {
        let conn = mem_db();
        let report = run_migrations(&conn).expect("migrations should succeed");
        assert!(report.is_clean(), "failures: {:?}", report.failed);

        for table in MODEL.tables {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table.name), [], |row| row.get(0))
                .unwrap_or_else(|e| panic!("{} should exist: {}", table.name, e));
            assert_eq!(count, 0);
        }
        assert_eq!(current_version(&conn).unwrap(), MODEL.version);
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();
        let first = run_migrations(&conn).expect("first run");
        assert!(!first.applied.is_empty());

        let second = run_migrations(&conn).expect("second run");
        assert!(second.applied.is_empty(), "second run should apply nothing");
        assert!(pending_plan(&conn, &MODEL).unwrap().is_empty());
    }

    #[test]
    fn test_plan_is_pure_diff() {
        let mut live = LiveSchema::default();
        live.tables.insert(
            "widgets".into(),
            LiveTable {
                columns: vec![
                    LiveColumn {
                        name: "id".into(),
                        declared_type: "INTEGER".into(),
                        not_null: false,
                        default: None,
                        primary_key: true,
                    },
                    LiveColumn {
                        name: "NAME".into(),
                        declared_type: "TEXT".into(),
                        not_null: true,
                        default: None,
                        primary_key: false,
                    },
                ],
                has_rows: false,
            },
        );
        // Extra live tables are never touched.
        live.tables.insert("legacy".into(), LiveTable::default());

        let plan = plan(&MODEL_V2, &live);
        let described: Vec<String> = plan.steps.iter().map(|s| s.describe()).collect();
        assert_eq!(
            described,
            vec![
                "create table gadgets",
                "add column widgets.serial TEXT",
                "add column widgets.weight REAL",
                "add column widgets.owner TEXT",
                "add column widgets.active INTEGER",
                "create index idx_gadgets_widget on gadgets",
            ]
        );
        // Empty table but no default: still downgraded.
        assert!(plan.steps.iter().any(|s| matches!(
            s,
            MigrationStep::AddColumn { column, downgrade: Some(NullableDowngrade::MissingDefault), .. }
                if column.name == "owner"
        )));
    }

    #[test]
    fn test_additive_migration_preserves_rows() {
        let conn = mem_db();
        migrate(&conn, &MODEL_V1).expect("v1");
        conn.execute("INSERT INTO widgets (id, name) VALUES (1, 'sprocket')", [])
            .unwrap();

        let report = migrate(&conn, &MODEL_V2).expect("v2");
        assert!(report.is_clean(), "failures: {:?}", report.failed);

        let (name, active): (String, i64) = conn
            .query_row("SELECT name, active FROM widgets WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "sprocket");
        assert_eq!(active, 1, "NOT NULL column with default keeps its default");
        assert_eq!(current_version(&conn).unwrap(), 2);

        // Applying twice produces the same schema.
        let before = introspect(&conn).unwrap();
        let again = migrate(&conn, &MODEL_V2).expect("v2 again");
        assert!(again.applied.is_empty());
        assert_eq!(introspect(&conn).unwrap(), before);
    }

    #[test]
    fn test_nullable_downgrade_on_populated_table() {
        let conn = mem_db();
        migrate(&conn, &MODEL_V1).unwrap();
        conn.execute("INSERT INTO widgets (id, name) VALUES (1, 'sprocket')", [])
            .unwrap();

        let report = migrate(&conn, &MODEL_V2).expect("downgrade instead of failing");
        assert_eq!(
            report.downgraded,
            vec![DowngradeNotice {
                table: "widgets".into(),
                column: "owner".into(),
                reason: NullableDowngrade::ExistingRows,
            }]
        );

        let live = introspect(&conn).unwrap();
        let owner = live.table("widgets").unwrap().column("owner").unwrap();
        assert!(!owner.not_null);

        let owner_value: Option<String> = conn
            .query_row("SELECT owner FROM widgets WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(owner_value, None);
    }

    #[test]
    fn test_added_unique_column_is_enforced_by_index() {
        let conn = mem_db();
        migrate(&conn, &MODEL_V1).unwrap();
        migrate(&conn, &MODEL_V2).unwrap();

        conn.execute("INSERT INTO widgets (name, serial) VALUES ('a', 'S1')", [])
            .unwrap();
        let dup = conn.execute("INSERT INTO widgets (name, serial) VALUES ('b', 'S1')", []);
        assert!(dup.is_err(), "serial should be unique");
        // NULLs stay allowed.
        conn.execute("INSERT INTO widgets (name) VALUES ('c')", []).unwrap();
        conn.execute("INSERT INTO widgets (name) VALUES ('d')", []).unwrap();
    }

    #[test]
    fn test_failed_step_does_not_block_others() {
        const BROKEN: DeclaredModel = DeclaredModel {
            version: 2,
            tables: &[
                TableDef {
                    name: "widgets",
                    columns: &[
                        column("id", ColumnType::Integer).primary_key(),
                        column("name", ColumnType::Text).not_null(),
                        // ALTER TABLE rejects non-constant defaults once the table has rows.
                        column("stamped_at", ColumnType::Text).default_sql("(datetime('now'))"),
                        column("color", ColumnType::Text),
                    ],
                },
                GADGETS,
            ],
            indexes: &[],
        };

        let conn = mem_db();
        migrate(&conn, &MODEL_V1).unwrap();
        conn.execute("INSERT INTO widgets (id, name) VALUES (1, 'sprocket')", [])
            .unwrap();
        let report = migrate(&conn, &BROKEN).expect("report, not error");

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].step, "add column widgets.stamped_at TEXT");
        assert!(report.applied.contains(&"create table gadgets".to_string()));
        assert!(report.applied.contains(&"add column widgets.color TEXT".to_string()));
        assert_eq!(
            current_version(&conn).unwrap(),
            1,
            "version is only recorded on a clean run"
        );
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(
            err.to_string().contains("newer than this version"),
            "error should mention version mismatch: {}",
            err
        );
    }

    #[test]
    fn test_pre_migration_backup_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test_backup.db");

        let conn = Connection::open(&db_path).expect("open db");
        conn.execute_batch("PRAGMA journal_mode=WAL;").unwrap();
        run_migrations(&conn).expect("migrations should succeed");

        let backup_path = dir.path().join("test_backup.db.pre-migration.bak");
        assert!(
            backup_path.exists(),
            "pre-migration backup should be created at {}",
            backup_path.display()
        );
    }

    #[test]
    fn test_rebuild_requires_confirmation() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO companies (name, synced_at) VALUES ('Acme', '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let err = rebuild(&conn, "delete all data").unwrap_err();
        assert!(matches!(err, MigrationError::ConfirmationRequired));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "refused rebuild leaves data alone");

        let report = rebuild(&conn, "DELETE ALL DATA").expect("confirmed rebuild");
        assert!(report.is_clean());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(current_version(&conn).unwrap(), MODEL.version);
    }
}
