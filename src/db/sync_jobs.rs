use rusqlite::{params, OptionalExtension, Row};

use super::*;

const JOB_COLUMNS: &str =
    "id, source, mode, status, started_at, completed_at, success, output, error, watermark";

impl CodexDb {
    fn map_job_row(row: &Row<'_>) -> rusqlite::Result<DbSyncJob> {
        let source: String = row.get(1)?;
        let mode: String = row.get(2)?;
        let status: String = row.get(3)?;
        Ok(DbSyncJob {
            id: row.get(0)?,
            source: source.parse().map_err(|bad| invalid_column(1, "source", bad))?,
            mode: mode.parse().map_err(|bad| invalid_column(2, "mode", bad))?,
            status: status.parse().map_err(|bad| invalid_column(3, "status", bad))?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            success: row.get(6)?,
            output: row.get(7)?,
            error: row.get(8)?,
            watermark: row.get(9)?,
        })
    }

    pub fn insert_sync_job(&self, job: &DbSyncJob) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_jobs (id, source, mode, status, started_at, completed_at,
                                    success, output, error, watermark)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.source.as_str(),
                job.mode.as_str(),
                job.status.as_str(),
                job.started_at,
                job.completed_at,
                job.success,
                job.output,
                job.error,
                job.watermark,
            ],
        )?;
        Ok(())
    }

    /// Move a running job to a terminal state. Returns false when the job
    /// was already terminal (for example reclaimed as stale).
    pub fn finish_sync_job(&self, job: &DbSyncJob) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE sync_jobs
             SET status = ?2, completed_at = ?3, success = ?4, output = ?5,
                 error = ?6, watermark = ?7
             WHERE id = ?1 AND status = 'running'",
            params![
                job.id,
                job.status.as_str(),
                job.completed_at,
                job.success,
                job.output,
                job.error,
                job.watermark,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_sync_job(&self, id: &str) -> Result<Option<DbSyncJob>, DbError> {
        let sql = format!("SELECT {} FROM sync_jobs WHERE id = ?1", JOB_COLUMNS);
        let job = self
            .conn
            .query_row(&sql, [id], Self::map_job_row)
            .optional()?;
        Ok(job)
    }

    pub fn running_sync_job(&self, source: SyncSource) -> Result<Option<DbSyncJob>, DbError> {
        let sql = format!(
            "SELECT {} FROM sync_jobs WHERE source = ?1 AND status = 'running'
             ORDER BY started_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        let job = self
            .conn
            .query_row(&sql, [source.as_str()], Self::map_job_row)
            .optional()?;
        Ok(job)
    }

    /// Fail every running job of `source` that started before `cutoff`.
    pub fn reclaim_stale_jobs(
        &self,
        source: SyncSource,
        cutoff: &str,
        now: &str,
    ) -> Result<usize, DbError> {
        let reclaimed = self.conn.execute(
            "UPDATE sync_jobs
             SET status = 'failed', success = 0, completed_at = ?3,
                 error = 'Abandoned: still running after the stale-job timeout'
             WHERE source = ?1 AND status = 'running' AND started_at < ?2",
            params![source.as_str(), cutoff, now],
        )?;
        Ok(reclaimed)
    }

    /// Latest watermark among completed jobs of `source`.
    pub fn latest_watermark(&self, source: SyncSource) -> Result<Option<String>, DbError> {
        let watermark: Option<String> = self.conn.query_row(
            "SELECT MAX(watermark) FROM sync_jobs
             WHERE source = ?1 AND status = 'completed' AND watermark IS NOT NULL",
            [source.as_str()],
            |row| row.get(0),
        )?;
        Ok(watermark)
    }

    pub fn recent_sync_jobs(&self, source: Option<SyncSource>, limit: usize) -> Result<Vec<DbSyncJob>, DbError> {
        let sql = format!(
            "SELECT {} FROM sync_jobs
             WHERE (?1 IS NULL OR source = ?1)
             ORDER BY started_at DESC LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![source.map(|s| s.as_str()), limit as i64],
            Self::map_job_row,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }
}

fn invalid_column(idx: usize, column: &str, bad: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(DbError::InvalidValue(format!("{} '{}'", column, bad))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn running(id: &str, source: SyncSource, started_at: &str) -> DbSyncJob {
        DbSyncJob {
            id: id.to_string(),
            source,
            mode: SyncMode::Incremental,
            status: JobStatus::Running,
            started_at: started_at.to_string(),
            completed_at: None,
            success: None,
            output: None,
            error: None,
            watermark: None,
        }
    }

    #[test]
    fn test_insert_and_get_job() {
        let db = test_db();
        db.insert_sync_job(&running("j1", SyncSource::Tickets, "2025-01-01T00:00:00.000000Z"))
            .unwrap();
        let job = db.get_sync_job("j1").unwrap().expect("job");
        assert_eq!(job.source, SyncSource::Tickets);
        assert_eq!(job.status, JobStatus::Running);
        assert!(db.get_sync_job("nope").unwrap().is_none());
    }

    #[test]
    fn test_second_running_job_rejected_by_index() {
        let db = test_db();
        db.insert_sync_job(&running("j1", SyncSource::Assets, "2025-01-01T00:00:00.000000Z"))
            .unwrap();
        let dup = db.insert_sync_job(&running("j2", SyncSource::Assets, "2025-01-01T00:01:00.000000Z"));
        assert!(dup.is_err());
        // Other sources are independent.
        db.insert_sync_job(&running("j3", SyncSource::Tickets, "2025-01-01T00:01:00.000000Z"))
            .unwrap();
    }

    #[test]
    fn test_watermark_only_from_completed_jobs() {
        let db = test_db();
        let mut done = running("j1", SyncSource::Companies, "2025-01-01T00:00:00.000000Z");
        db.insert_sync_job(&done).unwrap();
        done.status = JobStatus::Completed;
        done.success = Some(true);
        done.completed_at = Some("2025-01-01T00:05:00.000000Z".into());
        done.watermark = Some(done.started_at.clone());
        assert!(db.finish_sync_job(&done).unwrap());

        let mut failed = running("j2", SyncSource::Companies, "2025-01-02T00:00:00.000000Z");
        db.insert_sync_job(&failed).unwrap();
        failed.status = JobStatus::Failed;
        failed.success = Some(false);
        failed.error = Some("boom".into());
        assert!(db.finish_sync_job(&failed).unwrap());

        assert_eq!(
            db.latest_watermark(SyncSource::Companies).unwrap().as_deref(),
            Some("2025-01-01T00:00:00.000000Z")
        );
        assert!(!db.finish_sync_job(&failed).unwrap(), "terminal jobs stay terminal");
    }

    #[test]
    fn test_reclaim_stale_jobs() {
        let db = test_db();
        db.insert_sync_job(&running("old", SyncSource::Tickets, "2025-01-01T00:00:00.000000Z"))
            .unwrap();
        let reclaimed = db
            .reclaim_stale_jobs(
                SyncSource::Tickets,
                "2025-01-01T06:00:00.000000Z",
                "2025-01-01T07:00:00.000000Z",
            )
            .unwrap();
        assert_eq!(reclaimed, 1);
        let job = db.get_sync_job("old").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(db.running_sync_job(SyncSource::Tickets).unwrap().is_none());
    }

    #[test]
    fn test_recent_jobs_filter() {
        let db = test_db();
        db.insert_sync_job(&running("a", SyncSource::Tickets, "2025-01-01T00:00:00.000000Z"))
            .unwrap();
        db.insert_sync_job(&running("b", SyncSource::Assets, "2025-01-02T00:00:00.000000Z"))
            .unwrap();
        assert_eq!(db.recent_sync_jobs(None, 10).unwrap().len(), 2);
        let tickets = db.recent_sync_jobs(Some(SyncSource::Tickets), 10).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].id, "a");
    }
}
