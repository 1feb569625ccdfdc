//! Configuration file: connections, sync tuning and schedules.
//!
//! Looked up at `--config <path>`, then `$CODEX_CONFIG`, then
//! `~/.codex/config.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::{CodexDb, SyncSource};
use crate::psa::PsaConfig;
use crate::rmm::RmmConfig;
use crate::sync::SyncOptions;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "CODEX_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// SQLite file; `~/.codex/codex.db` when unset.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub psa: Option<PsaConfig>,
    #[serde(default)]
    pub rmm: Option<RmmConfig>,
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default)]
    pub schedules: Schedules,
}

impl Config {
    pub fn database_path(&self) -> Result<PathBuf, String> {
        CodexDb::resolve_path(self.database_path.as_deref()).map_err(|e| e.to_string())
    }
}

/// Schedule configuration for the sync sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    #[serde(default = "ScheduleEntry::default_companies")]
    pub companies: ScheduleEntry,
    #[serde(default = "ScheduleEntry::default_assets")]
    pub assets: ScheduleEntry,
    #[serde(default = "ScheduleEntry::default_tickets")]
    pub tickets: ScheduleEntry,
}

impl Schedules {
    pub fn entry(&self, source: SyncSource) -> &ScheduleEntry {
        match source {
            SyncSource::Companies => &self.companies,
            SyncSource::Assets => &self.assets,
            SyncSource::Tickets => &self.tickets,
        }
    }
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            companies: ScheduleEntry::default_companies(),
            assets: ScheduleEntry::default_assets(),
            tickets: ScheduleEntry::default_tickets(),
        }
    }
}

/// A single schedule entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    /// Five-field cron expression.
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ScheduleEntry {
    /// Companies and contacts: 2 AM daily
    pub fn default_companies() -> Self {
        Self {
            enabled: true,
            cron: "0 2 * * *".to_string(),
            timezone: default_timezone(),
        }
    }

    /// Assets: 3 AM daily
    pub fn default_assets() -> Self {
        Self {
            enabled: true,
            cron: "0 3 * * *".to_string(),
            timezone: default_timezone(),
        }
    }

    /// Closed tickets: hourly
    pub fn default_tickets() -> Self {
        Self {
            enabled: true,
            cron: "0 * * * *".to_string(),
            timezone: default_timezone(),
        }
    }
}

/// Get the canonical config file path (~/.codex/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".codex").join("config.json"))
}

/// Load configuration from `explicit`, `$CODEX_CONFIG` or the default path.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, String> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match std::env::var_os(CONFIG_ENV) {
            Some(raw) if !raw.is_empty() => PathBuf::from(raw),
            _ => config_path()?,
        },
    };
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        return Err(format!(
            "Config file not found at {}. Create it with: {{ \"psa\": {{ \"domain\": \"...\", \"apiKey\": \"...\" }} }}",
            path.display()
        ));
    }

    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;

    let config: Config = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;

    if config.sync.batch_size == 0 {
        return Err(format!("{}: sync.batchSize must be at least 1", path.display()));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> PathBuf {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        std::mem::forget(dir);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let path = write_config(r#"{ "psa": { "domain": "acme.freshservice.com", "apiKey": "k" } }"#);
        let config = load_config(Some(&path)).unwrap();

        let psa = config.psa.unwrap();
        assert_eq!(psa.base_url(), "https://acme.freshservice.com");
        assert_eq!(psa.requests_per_second, 1.0);
        assert!(config.rmm.is_none());
        assert_eq!(config.sync, SyncOptions::default());
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.schedules.tickets.cron, "0 * * * *");
        assert_eq!(config.schedules.entry(SyncSource::Assets).cron, "0 3 * * *");
    }

    #[test]
    fn test_partial_overrides() {
        let path = write_config(
            r#"{
                "databasePath": "/tmp/codex-config-test/hub.db",
                "sync": { "batchSize": 10, "staleJobMinutes": 30 },
                "schedules": { "assets": { "enabled": false, "cron": "30 4 * * *" } }
            }"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.full_lookback_days, 365);
        assert_eq!(config.sync.stale_job_minutes, 30);
        assert!(!config.schedules.assets.enabled);
        assert_eq!(config.schedules.assets.timezone, "UTC");
        assert!(config.schedules.companies.enabled);
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/tmp/codex-config-test/hub.db")
        );
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let missing = PathBuf::from("/nonexistent/codex/config.json");
        assert!(load_config(Some(&missing)).unwrap_err().contains("not found"));

        let bad = write_config("{ not json");
        assert!(load_config(Some(&bad)).unwrap_err().contains("Failed to parse"));

        let zero = write_config(r#"{ "sync": { "batchSize": 0 } }"#);
        assert!(load_config(Some(&zero)).unwrap_err().contains("batchSize"));
    }
}
