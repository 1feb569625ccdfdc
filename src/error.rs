//! Error types for sync runs
//!
//! Errors are classified by recoverability:
//! - Retryable: remote failures that outlasted the retry budget, lock contention
//! - NonRetryable: invariant violations, unknown jobs, bad stored data
//! - RequiresUserAction: missing or rejected credentials, configuration errors

use thiserror::Error;

use crate::db::{DbError, SyncSource};
use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("A {sync} sync is already running (job {job_id})")]
    AlreadyRunning { sync: SyncSource, job_id: String },

    #[error("Sync job not found: {0}")]
    JobNotFound(String),

    #[error("Unknown sync source: {0}")]
    UnknownSource(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl SyncError {
    /// Returns true if running the same sync again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => match e {
                RemoteError::Page { source, .. } => !matches!(**source, RemoteError::Auth(_)),
                RemoteError::Auth(_) | RemoteError::Url(_) => false,
                _ => true,
            },
            SyncError::Db(DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            SyncError::AlreadyRunning { .. } => true,
            _ => false,
        }
    }

    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_) | SyncError::UnknownSource(_)
        ) || matches!(self, SyncError::Remote(RemoteError::Auth(_)))
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::Remote(RemoteError::Auth(_)) => {
                "Check the API credentials in ~/.codex/config.json"
            }
            SyncError::Remote(RemoteError::Throttled { .. }) => {
                "The remote API kept rate limiting. Lower requestsPerSecond or try later."
            }
            SyncError::Remote(_) => "Check connectivity to the remote API and run the sync again.",
            SyncError::Db(_) => "Check the database file permissions and disk space.",
            SyncError::AlreadyRunning { .. } => "Wait for the running job to finish.",
            SyncError::JobNotFound(_) => "List recent jobs with `codex jobs`.",
            SyncError::UnknownSource(_) => "Use one of: companies, assets, tickets.",
            SyncError::Configuration(_) => "Check your configuration in ~/.codex/config.json",
            SyncError::Invariant(_) => "Inspect the job error and the local database.",
        }
    }
}

/// Serializable error representation for CLI output
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&SyncError> for ErrorReport {
    fn from(err: &SyncError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorReport {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
