//! Shared type definitions for the database layer.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::migrations::MigrationError;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("Stored value is invalid: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Sync bookkeeping
// ---------------------------------------------------------------------------

/// A data feed that runs as one sequential sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    /// PSA departments and requesters.
    Companies,
    /// RMM sites and devices.
    Assets,
    /// Closed PSA tickets with conversations and time entries.
    Tickets,
}

impl SyncSource {
    pub const ALL: [SyncSource; 3] = [Self::Companies, Self::Assets, Self::Tickets];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Companies => "companies",
            Self::Assets => "assets",
            Self::Tickets => "tickets",
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "companies" | "contacts" | "psa" => Ok(Self::Companies),
            "assets" | "devices" | "rmm" => Ok(Self::Assets),
            "tickets" => Ok(Self::Tickets),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// Per-run counters, persisted as the job's captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    /// Matched an existing row with nothing to change.
    pub unchanged: u64,
    pub skipped: u64,
    pub errored: u64,
    /// Rows removed by a full run because the source no longer returned them.
    #[serde(default)]
    pub pruned: u64,
}

/// A row from the `sync_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSyncJob {
    pub id: String,
    pub source: SyncSource,
    pub mode: SyncMode,
    pub status: JobStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub success: Option<bool>,
    /// JSON-encoded `SyncStats`.
    pub output: Option<String>,
    pub error: Option<String>,
    /// Set only on completed runs: the run's start time.
    pub watermark: Option<String>,
}

impl DbSyncJob {
    pub fn stats(&self) -> Option<SyncStats> {
        self.output
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// A row from `site_links`: RMM site to company account number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSiteLink {
    pub site_uid: String,
    pub site_name: Option<String>,
    pub company_account_number: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Mirrored entities
// ---------------------------------------------------------------------------

/// A stored entity row: surrogate id, last sync time and the mirrored fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stored<T> {
    pub id: i64,
    pub synced_at: String,
    #[serde(flatten)]
    pub record: T,
}

/// Company fields mirrored from a PSA department.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCompany {
    pub account_number: Option<String>,
    /// PSA department id.
    pub external_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub plan_selected: Option<String>,
    pub managed_users: Option<String>,
    pub managed_devices: Option<String>,
    /// Normalized: `1 Year`, `2 Year`, `3 Year` or `Month to Month`.
    pub contract_term: Option<String>,
    pub contract_start_date: Option<String>,
    pub contract_end_date: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub head_user_id: Option<i64>,
    pub prime_user_id: Option<i64>,
    /// JSON array of email domains.
    pub domains: String,
    pub source_created_at: Option<String>,
    pub source_updated_at: Option<String>,
}

/// Contact fields mirrored from a PSA requester.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbContact {
    pub external_id: Option<i64>,
    pub email: Option<String>,
    pub name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub job_title: Option<String>,
    pub work_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub active: bool,
    pub source_created_at: Option<String>,
    pub source_updated_at: Option<String>,
}

/// Asset fields mirrored from an RMM device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAsset {
    /// RMM device uid.
    pub external_id: String,
    pub hostname: String,
    pub company_account_number: String,
    pub site_uid: String,
    pub site_name: Option<String>,
    pub device_type: Option<String>,
    pub operating_system: Option<String>,
    pub last_logged_in_user: Option<String>,
    pub ip_internal: Option<String>,
    pub ip_external: Option<String>,
    pub domain: Option<String>,
    pub online: Option<bool>,
    pub patch_status: Option<String>,
    pub antivirus_product: Option<String>,
    pub last_seen: Option<String>,
    pub last_reboot: Option<String>,
    pub last_audit_date: Option<String>,
    pub backup_usage_tb: Option<f64>,
    pub portal_url: Option<String>,
    pub web_remote_url: Option<String>,
}

const BYTES_PER_TB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;

impl DbAsset {
    /// Backup usage converted from stored terabytes to bytes.
    pub fn backup_usage_bytes(&self) -> Option<u64> {
        self.backup_usage_tb.map(|tb| (tb * BYTES_PER_TB).round() as u64)
    }

    pub fn tb_from_bytes(bytes: f64) -> f64 {
        bytes / BYTES_PER_TB
    }
}

/// One entry of a ticket's conversation thread or private notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub id: i64,
    /// Sender email.
    pub author: Option<String>,
    pub user_id: Option<i64>,
    #[serde(default)]
    pub to_emails: Vec<String>,
    pub created_at: String,
    /// Plain text with markup stripped.
    pub body: String,
    pub body_html: Option<String>,
    pub incoming: bool,
    pub private: bool,
}

/// A closed ticket snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTicket {
    pub ticket_id: i64,
    pub company_account_number: Option<String>,
    pub subject: String,
    pub description_text: Option<String>,
    pub status: String,
    pub status_id: i64,
    pub priority: String,
    pub priority_id: i64,
    pub ticket_type: Option<String>,
    pub requester_id: Option<i64>,
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
    pub responder_id: Option<i64>,
    pub group_id: Option<i64>,
    pub source_created_at: Option<String>,
    pub source_updated_at: String,
    pub closed_at: Option<String>,
    pub due_by: Option<String>,
    pub fr_due_by: Option<String>,
    pub first_responded_at: Option<String>,
    pub agent_responded_at: Option<String>,
    pub total_hours_spent: f64,
    pub conversations: Vec<ConversationEntry>,
    pub notes: Vec<ConversationEntry>,
}

// ---------------------------------------------------------------------------
// Column <-> value helpers shared by the entity modules
// ---------------------------------------------------------------------------

pub(crate) fn text(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

pub(crate) fn int(value: Option<i64>) -> Value {
    match value {
        Some(n) => Value::Integer(n),
        None => Value::Null,
    }
}

pub(crate) fn real(value: Option<f64>) -> Value {
    match value {
        Some(n) => Value::Real(n),
        None => Value::Null,
    }
}

pub(crate) fn flag(value: Option<bool>) -> Value {
    int(value.map(i64::from))
}

pub(crate) fn json_text<T: Serialize>(value: &T) -> Value {
    match serde_json::to_string(value) {
        Ok(s) => Value::Text(s),
        Err(e) => {
            log::error!("Failed to encode column as JSON: {}", e);
            Value::Null
        }
    }
}

/// Canonical stored timestamp: RFC 3339 UTC with microseconds, so that
/// lexical order matches chronological order.
pub fn db_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
