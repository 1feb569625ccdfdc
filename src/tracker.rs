//! Incremental state: sync job records and per-source watermarks.
//!
//! A watermark is the start time of the last completed run of a source. It
//! only moves when a run completes, so a failed run is retried from the same
//! point next time.

use chrono::{DateTime, Duration, Utc};

use crate::db::{db_timestamp, CodexDb, DbSyncJob, JobStatus, SyncMode, SyncSource, SyncStats};
use crate::error::SyncError;

pub struct StateTracker {
    stale_after: Duration,
}

impl StateTracker {
    pub fn new(stale_job_minutes: i64) -> Self {
        Self {
            stale_after: Duration::minutes(stale_job_minutes.max(1)),
        }
    }

    pub fn get_last_success(&self, db: &CodexDb, source: SyncSource) -> Result<Option<DateTime<Utc>>, SyncError> {
        let Some(raw) = db.latest_watermark(source)? else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| SyncError::Invariant(format!("stored watermark '{}' is invalid: {}", raw, e)))?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }

    /// Open a running job for `source`. Stale running jobs are failed first;
    /// a live running job refuses the new one.
    pub fn begin_job(
        &self,
        db: &CodexDb,
        source: SyncSource,
        mode: SyncMode,
        now: DateTime<Utc>,
    ) -> Result<DbSyncJob, SyncError> {
        db.with_transaction(|tx| {
            let cutoff = db_timestamp(now - self.stale_after);
            let reclaimed = tx.reclaim_stale_jobs(source, &cutoff, &db_timestamp(now))?;
            if reclaimed > 0 {
                log::warn!(
                    "Sync {}: marked {} stale running job(s) as failed",
                    source,
                    reclaimed
                );
            }

            if let Some(running) = tx.running_sync_job(source)? {
                return Err(SyncError::AlreadyRunning {
                    sync: source,
                    job_id: running.id,
                });
            }

            let job = DbSyncJob {
                id: uuid::Uuid::new_v4().to_string(),
                source,
                mode,
                status: JobStatus::Running,
                started_at: db_timestamp(now),
                completed_at: None,
                success: None,
                output: None,
                error: None,
                watermark: None,
            };
            tx.insert_sync_job(&job)?;
            Ok(job)
        })
    }

    /// Move `job` to a terminal state with its stats. Completed jobs take
    /// their start time as the new watermark; failed jobs leave it alone.
    pub fn record_job(
        &self,
        db: &CodexDb,
        job: &DbSyncJob,
        status: JobStatus,
        stats: &SyncStats,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DbSyncJob, SyncError> {
        if !status.is_terminal() {
            return Err(SyncError::Invariant(format!(
                "job {} cannot be recorded as {}",
                job.id,
                status.as_str()
            )));
        }

        let completed = status == JobStatus::Completed;
        let finished = DbSyncJob {
            status,
            completed_at: Some(db_timestamp(now)),
            success: Some(completed),
            output: serde_json::to_string(stats).ok(),
            error,
            watermark: completed.then(|| job.started_at.clone()),
            ..job.clone()
        };

        if !db.finish_sync_job(&finished)? {
            return Err(SyncError::Invariant(format!(
                "job {} was no longer running (reclaimed as stale?)",
                job.id
            )));
        }
        Ok(finished)
    }

    pub fn complete_job(
        &self,
        db: &CodexDb,
        job: &DbSyncJob,
        stats: &SyncStats,
    ) -> Result<DbSyncJob, SyncError> {
        self.record_job(db, job, JobStatus::Completed, stats, None, Utc::now())
    }

    pub fn fail_job(
        &self,
        db: &CodexDb,
        job: &DbSyncJob,
        stats: &SyncStats,
        error: &str,
    ) -> Result<DbSyncJob, SyncError> {
        self.record_job(db, job, JobStatus::Failed, stats, Some(error.to_string()), Utc::now())
    }

    pub fn get_job(&self, db: &CodexDb, id: &str) -> Result<DbSyncJob, SyncError> {
        db.get_sync_job(id)?
            .ok_or_else(|| SyncError::JobNotFound(id.to_string()))
    }
}
