// Sync service: trigger runs and report on them.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db::{CodexDb, DbSyncJob, SyncMode, SyncSource};
use crate::error::SyncError;
use crate::psa::FreshserviceClient;
use crate::rmm::DattoClient;
use crate::sync::SyncRunner;
use crate::tracker::StateTracker;

/// Open the configured database, migrating it if needed.
pub fn open_db(config: &Config) -> Result<CodexDb, SyncError> {
    let path = config.database_path().map_err(SyncError::Configuration)?;
    Ok(CodexDb::open_at(path)?)
}

/// A runner wired to every connection the config defines.
pub fn build_runner(config: &Config) -> Result<SyncRunner, SyncError> {
    let mut runner = SyncRunner::new(open_db(config)?, config.sync.clone());
    if let Some(psa) = &config.psa {
        runner = runner.with_psa(Arc::new(FreshserviceClient::new(psa)?));
    }
    if let Some(rmm) = &config.rmm {
        runner = runner.with_rmm(Arc::new(DattoClient::new(rmm)?));
    }
    Ok(runner)
}

/// Run one sync of `source` to completion.
///
/// Fails with `AlreadyRunning` when another run of the source holds the job
/// slot. A run that starts and then fails returns its failed job.
pub async fn trigger_sync(
    config: &Config,
    source: SyncSource,
    mode: SyncMode,
) -> Result<DbSyncJob, SyncError> {
    let mut runner = build_runner(config)?;
    runner.run(source, mode).await
}

pub fn job_status(config: &Config, job_id: &str) -> Result<DbSyncJob, SyncError> {
    let db = open_db(config)?;
    tracker(config).get_job(&db, job_id)
}

pub fn last_watermark(config: &Config, source: SyncSource) -> Result<Option<DateTime<Utc>>, SyncError> {
    let db = open_db(config)?;
    tracker(config).get_last_success(&db, source)
}

pub fn recent_jobs(
    config: &Config,
    source: Option<SyncSource>,
    limit: usize,
) -> Result<Vec<DbSyncJob>, SyncError> {
    let db = open_db(config)?;
    Ok(db.recent_sync_jobs(source, limit)?)
}

fn tracker(config: &Config) -> StateTracker {
    StateTracker::new(config.sync.stale_job_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db_path;
    use crate::db::JobStatus;
    use crate::psa::PsaConfig;
    use crate::remote::RetryPolicy;

    fn config() -> Config {
        Config {
            database_path: Some(test_db_path().to_string_lossy().into_owned()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_trigger_without_connection_is_configuration_error() {
        let config = config();
        let err = trigger_sync(&config, SyncSource::Assets, SyncMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(recent_jobs(&config, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_status_and_watermark_on_fresh_store() {
        let config = config();
        assert!(matches!(
            job_status(&config, "nope"),
            Err(SyncError::JobNotFound(_))
        ));
        assert_eq!(last_watermark(&config, SyncSource::Tickets).unwrap(), None);
    }

    #[test]
    fn test_status_reads_recorded_job() {
        let config = config();
        let db = open_db(&config).unwrap();
        let job = tracker(&config)
            .begin_job(&db, SyncSource::Companies, SyncMode::Full, Utc::now())
            .unwrap();
        let found = job_status(&config, &job.id).unwrap();
        assert_eq!(found.status, JobStatus::Running);
        assert_eq!(found.source, SyncSource::Companies);
    }

    #[test]
    fn test_blank_api_key_rejected_when_building() {
        let config = Config {
            psa: Some(PsaConfig {
                domain: "acme.freshservice.com".into(),
                api_key: String::new(),
                requests_per_second: 1.0,
                retry: RetryPolicy::default(),
            }),
            ..config()
        };
        assert!(matches!(build_runner(&config), Err(SyncError::Remote(_))));
    }
}
