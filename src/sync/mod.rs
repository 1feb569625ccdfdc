//! Sync orchestrator: one sequential run per source.
//!
//! A run opens a job, pulls pages from the source client, reconciles each
//! record against the store and writes in small transactions. The job ends
//! `completed` (watermark advanced) or `failed` (batch rolled back, watermark
//! untouched).

pub mod assets;
pub mod companies;
pub mod runner;
pub mod tickets;

use serde::{Deserialize, Serialize};

pub use runner::{SyncRunner, WriteBatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Records written per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Window a full ticket run covers.
    #[serde(default = "default_full_lookback_days")]
    pub full_lookback_days: i64,
    /// Window of the first incremental run, before any watermark exists.
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: i64,
    /// Running jobs older than this are considered abandoned.
    #[serde(default = "default_stale_job_minutes")]
    pub stale_job_minutes: i64,
}

fn default_batch_size() -> usize {
    50
}

fn default_full_lookback_days() -> i64 {
    365
}

fn default_initial_lookback_days() -> i64 {
    90
}

fn default_stale_job_minutes() -> i64 {
    360
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            full_lookback_days: default_full_lookback_days(),
            initial_lookback_days: default_initial_lookback_days(),
            stale_job_minutes: default_stale_job_minutes(),
        }
    }
}
