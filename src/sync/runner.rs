//! Job lifecycle and batched writes shared by every source.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::{assets, companies, tickets, SyncOptions};
use crate::db::{db_timestamp, CodexDb, DbError, DbSyncJob, SyncMode, SyncSource, SyncStats};
use crate::error::SyncError;
use crate::psa::TicketingSource;
use crate::reconcile::{self, Matchable, MergeDecision, SkipReason};
use crate::rmm::MonitoringSource;
use crate::tracker::StateTracker;

/// Groups entity writes into transactions of at most `size` writes.
///
/// The transaction opens lazily on the first write. Callers commit at page
/// boundaries so no transaction stays open across a network fetch.
#[derive(Debug)]
pub struct WriteBatch {
    size: usize,
    pending: usize,
    open: bool,
    committed: u64,
}

impl WriteBatch {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            pending: 0,
            open: false,
            committed: 0,
        }
    }

    pub fn write<T>(
        &mut self,
        db: &CodexDb,
        f: impl FnOnce(&CodexDb) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        if !self.open {
            db.begin_batch()?;
            self.open = true;
        }
        let out = f(db)?;
        self.pending += 1;
        if self.pending >= self.size {
            self.commit(db)?;
        }
        Ok(out)
    }

    pub fn commit(&mut self, db: &CodexDb) -> Result<(), DbError> {
        if self.open {
            db.commit_batch()?;
            self.open = false;
            self.committed += self.pending as u64;
            self.pending = 0;
        }
        Ok(())
    }

    /// Discard uncommitted writes.
    pub fn abort(&mut self, db: &CodexDb) {
        if self.open {
            db.rollback_batch();
            log::warn!("Rolled back {} uncommitted write(s)", self.pending);
            self.open = false;
            self.pending = 0;
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }
}

/// Per-run state handed to the source modules.
pub struct RunContext {
    pub job_id: String,
    pub source: SyncSource,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    /// Stamp written to `synced_at` on every row this run touches.
    pub synced_at: String,
    /// Oldest source update this run covers.
    pub window_start: DateTime<Utc>,
    pub stats: SyncStats,
    pub batch: WriteBatch,
}

impl RunContext {
    pub fn new(
        job: &DbSyncJob,
        started_at: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        options: &SyncOptions,
    ) -> Self {
        let window_start = match job.mode {
            SyncMode::Full => started_at - Duration::days(options.full_lookback_days),
            SyncMode::Incremental => last_success
                .unwrap_or_else(|| started_at - Duration::days(options.initial_lookback_days)),
        };
        Self {
            job_id: job.id.clone(),
            source: job.source,
            mode: job.mode,
            started_at,
            synced_at: db_timestamp(started_at),
            window_start,
            stats: SyncStats::default(),
            batch: WriteBatch::new(options.batch_size),
        }
    }

    pub fn is_full(&self) -> bool {
        self.mode == SyncMode::Full
    }

    /// Whether a record last updated at `updated_at` belongs to an
    /// incremental run. Full runs and unparseable stamps always do.
    pub fn is_due(&self, updated_at: Option<&str>) -> bool {
        if self.is_full() {
            return true;
        }
        match updated_at.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()) {
            Some(at) => at.with_timezone(&Utc) > self.window_start,
            None => true,
        }
    }

    pub fn skip(&mut self, what: &str, reason: &SkipReason) {
        self.stats.skipped += 1;
        log::warn!("Sync {}: skipped {}: {}", self.source, what, reason);
    }
}

/// Reconcile `record` and write the outcome. Returns the row id the record
/// now lives in.
pub fn merge_record<E: Matchable>(
    db: &CodexDb,
    ctx: &mut RunContext,
    record: &E,
) -> Result<Option<i64>, SyncError> {
    let decision = reconcile::reconcile(db, record)?;
    match &decision {
        MergeDecision::Create => ctx.stats.created += 1,
        MergeDecision::Update { .. } => ctx.stats.updated += 1,
        MergeDecision::Skip(SkipReason::Unchanged { existing_id }) => {
            ctx.stats.unchanged += 1;
            return Ok(Some(*existing_id));
        }
        MergeDecision::Skip(reason) => {
            ctx.skip(E::TABLE, reason);
            return Ok(None);
        }
    }

    let synced_at = ctx.synced_at.clone();
    ctx.batch
        .write(db, |db| reconcile::apply(db, record, &decision, &synced_at))
        .map_err(|e| {
            ctx.stats.errored += 1;
            SyncError::Db(e)
        })
}

pub struct SyncRunner {
    db: CodexDb,
    psa: Option<Arc<dyn TicketingSource>>,
    rmm: Option<Arc<dyn MonitoringSource>>,
    options: SyncOptions,
    tracker: StateTracker,
}

impl SyncRunner {
    pub fn new(db: CodexDb, options: SyncOptions) -> Self {
        let tracker = StateTracker::new(options.stale_job_minutes);
        Self {
            db,
            psa: None,
            rmm: None,
            options,
            tracker,
        }
    }

    pub fn with_psa(mut self, psa: Arc<dyn TicketingSource>) -> Self {
        self.psa = Some(psa);
        self
    }

    pub fn with_rmm(mut self, rmm: Arc<dyn MonitoringSource>) -> Self {
        self.rmm = Some(rmm);
        self
    }

    pub fn db(&self) -> &CodexDb {
        &self.db
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    fn psa(&self) -> Result<Arc<dyn TicketingSource>, SyncError> {
        self.psa
            .clone()
            .ok_or_else(|| SyncError::Configuration("no ticketing (psa) connection configured".into()))
    }

    fn rmm(&self) -> Result<Arc<dyn MonitoringSource>, SyncError> {
        self.rmm
            .clone()
            .ok_or_else(|| SyncError::Configuration("no monitoring (rmm) connection configured".into()))
    }

    /// Run one sync of `source`.
    ///
    /// A run that fails midway still returns `Ok` with the failed job; `Err`
    /// means no job ran (conflict, missing connection) or the job record
    /// itself could not be written.
    pub async fn run(&mut self, source: SyncSource, mode: SyncMode) -> Result<DbSyncJob, SyncError> {
        match source {
            SyncSource::Companies | SyncSource::Tickets => {
                self.psa()?;
            }
            SyncSource::Assets => {
                self.rmm()?;
            }
        }

        let last_success = self.tracker.get_last_success(&self.db, source)?;
        let started_at = Utc::now();
        let job = self.tracker.begin_job(&self.db, source, mode, started_at)?;
        let mut ctx = RunContext::new(&job, started_at, last_success, &self.options);
        log::info!(
            "Sync {} ({}) started: job {}, window from {}",
            source,
            mode.as_str(),
            job.id,
            ctx.window_start.to_rfc3339()
        );

        let outcome = self.drive(&mut ctx).await;

        match outcome {
            Ok(()) => {
                let done = self.tracker.complete_job(&self.db, &job, &ctx.stats)?;
                log::info!(
                    "Sync {} completed: {} processed, {} created, {} updated, {} unchanged, {} skipped, {} pruned",
                    source,
                    ctx.stats.processed,
                    ctx.stats.created,
                    ctx.stats.updated,
                    ctx.stats.unchanged,
                    ctx.stats.skipped,
                    ctx.stats.pruned
                );
                Ok(done)
            }
            Err(e) => {
                ctx.batch.abort(&self.db);
                log::error!("Sync {} failed (job {}): {}", source, job.id, e);
                self.tracker.fail_job(&self.db, &job, &ctx.stats, &e.to_string())
            }
        }
    }

    async fn drive(&mut self, ctx: &mut RunContext) -> Result<(), SyncError> {
        match ctx.source {
            SyncSource::Companies => {
                let psa = self.psa()?;
                companies::sync_companies(psa.as_ref(), &mut self.db, ctx).await?;
            }
            SyncSource::Assets => {
                let rmm = self.rmm()?;
                assets::sync_assets(rmm.as_ref(), &mut self.db, ctx).await?;
            }
            SyncSource::Tickets => {
                let psa = self.psa()?;
                tickets::sync_tickets(psa.as_ref(), &mut self.db, ctx).await?;
            }
        }
        ctx.batch.commit(&self.db)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{DbAsset, JobStatus};

    fn asset(uid: &str) -> DbAsset {
        DbAsset {
            external_id: uid.into(),
            hostname: uid.to_uppercase(),
            company_account_number: "100001".into(),
            site_uid: "s1".into(),
            ..Default::default()
        }
    }

    fn count(db: &CodexDb, table: &str) -> i64 {
        db.conn_ref()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    fn context(mode: SyncMode, batch_size: usize) -> RunContext {
        let job = DbSyncJob {
            id: "job-1".into(),
            source: SyncSource::Assets,
            mode,
            status: JobStatus::Running,
            started_at: "2025-03-01T00:00:00.000000Z".into(),
            completed_at: None,
            success: None,
            output: None,
            error: None,
            watermark: None,
        };
        let options = SyncOptions {
            batch_size,
            ..SyncOptions::default()
        };
        let started = DateTime::parse_from_rfc3339("2025-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        RunContext::new(&job, started, None, &options)
    }

    #[test]
    fn test_batch_commits_every_n_writes() {
        let db = test_db();
        let mut ctx = context(SyncMode::Full, 2);
        for uid in ["a", "b", "c"] {
            merge_record(&db, &mut ctx, &asset(uid)).unwrap();
        }
        assert_eq!(ctx.batch.committed(), 2);

        // The third write is still open and is lost on abort.
        ctx.batch.abort(&db);
        assert_eq!(count(&db, "assets"), 2);
        assert_eq!(ctx.stats.created, 3);
    }

    #[test]
    fn test_merge_counts_unchanged_without_writing() {
        let db = test_db();
        let mut ctx = context(SyncMode::Full, 50);
        let first = merge_record(&db, &mut ctx, &asset("a")).unwrap();
        ctx.batch.commit(&db).unwrap();
        let second = merge_record(&db, &mut ctx, &asset("a")).unwrap();

        assert_eq!(first, second);
        assert_eq!(ctx.stats.created, 1);
        assert_eq!(ctx.stats.unchanged, 1);
        assert_eq!(ctx.batch.committed(), 1);
    }

    #[test]
    fn test_window_defaults() {
        let full = context(SyncMode::Full, 50);
        assert_eq!(full.window_start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(full.is_due(Some("2001-01-01T00:00:00Z")));

        let incremental = context(SyncMode::Incremental, 50);
        assert_eq!(incremental.window_start.to_rfc3339(), "2024-12-01T00:00:00+00:00");
        assert!(!incremental.is_due(Some("2024-11-30T23:59:59Z")));
        assert!(incremental.is_due(Some("2025-01-15T00:00:00Z")));
        assert!(incremental.is_due(None));
    }

    #[tokio::test]
    async fn test_missing_connection_creates_no_job() {
        let mut runner = SyncRunner::new(test_db(), SyncOptions::default());
        let err = runner.run(SyncSource::Tickets, SyncMode::Full).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(runner.db().recent_sync_jobs(None, 10).unwrap().is_empty());
    }
}
