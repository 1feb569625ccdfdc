//! SQLite store for the mirrored companies, contacts, assets and tickets.
//!
//! The database lives at `~/.codex/codex.db` unless the config names another
//! path. Opening it always runs the additive migration first, so every caller
//! sees the declared schema. Entity writes go through the sync orchestrator;
//! everything else here is read-only queries and job bookkeeping.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

pub mod entities;
pub mod site_links;
pub mod sync_jobs;
pub mod types;
pub use types::*;

use crate::migrations::{self, MigrationReport};

/// Milliseconds a writer waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 10_000;

pub struct CodexDb {
    conn: Connection,
}

impl CodexDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::Sqlite(e)))?;
        match f(self) {
            Ok(val) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| E::from(DbError::Sqlite(e)))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.codex/codex.db` and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path, migrating it to the declared model.
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let db = Self::open_unmigrated(path)?;

        let report = migrations::run_migrations(&db.conn)?;
        log_migration_report(&report);

        db.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(db)
    }

    /// Open without touching the schema. Used to preview or drive migrations.
    pub fn open_unmigrated(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.codex/codex.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".codex").join("codex.db"))
    }

    /// Resolve a configured path, expanding a leading `~/`.
    pub fn resolve_path(configured: Option<&str>) -> Result<PathBuf, DbError> {
        match configured {
            Some(raw) if !raw.trim().is_empty() => {
                if let Some(rest) = raw.strip_prefix("~/") {
                    let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
                    Ok(home.join(rest))
                } else {
                    Ok(Path::new(raw).to_path_buf())
                }
            }
            _ => Self::default_path(),
        }
    }

    // -----------------------------------------------------------------------
    // Batched writes. A batch is a plain deferred transaction the
    // orchestrator opens before its first write and commits every N records.
    // -----------------------------------------------------------------------

    pub fn begin_batch(&self) -> Result<(), DbError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn commit_batch(&self) -> Result<(), DbError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_batch(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            log::warn!("Rollback failed: {}", e);
        }
    }
}

fn log_migration_report(report: &MigrationReport) {
    if !report.applied.is_empty() {
        log::info!("Schema migration applied {} step(s)", report.applied.len());
    }
    for failure in &report.failed {
        log::warn!(
            "Schema migration step '{}' failed: {}",
            failure.step,
            failure.error
        );
    }
}

// =============================================================================
// Test utilities
// =============================================================================


#[cfg(test)]
mod tests {
    use super::test_utils::{test_db, test_db_path};
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        for table in ["companies", "contacts", "assets", "tickets", "sync_jobs", "site_links"] {
            let count: i64 = db
                .conn_ref()
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap_or_else(|e| panic!("{} should exist: {}", table, e));
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_reopen_is_noop_migration() {
        let path = test_db_path();
        drop(CodexDb::open_at(&path).unwrap());
        let db = CodexDb::open_unmigrated(&path).unwrap();
        let plan = crate::migrations::pending_plan(db.conn_ref(), &crate::schema::MODEL).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref().execute(
                "INSERT INTO site_links (site_uid, company_account_number, updated_at)
                 VALUES ('s1', '100001', '2025-01-01T00:00:00Z')",
                [],
            )?;
            Err(DbError::InvalidValue("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM site_links", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_resolve_path_uses_configured_value() {
        let path = CodexDb::resolve_path(Some("/tmp/codex-test/codex.db")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/codex-test/codex.db"));
    }
}
