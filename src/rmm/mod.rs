//! Remote monitoring (RMM) source: sites, site variables and devices.

pub mod client;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::DbAsset;
use crate::remote::{Page, PageCursor, RemoteError, RetryPolicy};

pub use client::DattoClient;

/// Site variable carrying the owning company's account number.
pub const ACCOUNT_VARIABLE: &str = "AccountNumber";

/// Device user-defined field holding backup usage in bytes.
const BACKUP_BYTES_UDF: &str = "udf6";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RmmConfig {
    /// API root, e.g. `https://concord-api.centrastage.net`.
    pub api_endpoint: String,
    pub public_key: String,
    pub secret_key: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_requests_per_second() -> f64 {
    1.0
}

#[async_trait]
pub trait MonitoringSource: Send + Sync {
    async fn sites_page(&self, cursor: PageCursor) -> Result<Page<Site>, RemoteError>;

    async fn site_variables(&self, site_uid: &str) -> Result<Vec<SiteVariable>, RemoteError>;

    async fn set_site_variable(&self, site_uid: &str, name: &str, value: &str) -> Result<(), RemoteError>;

    /// Devices across every site of the account.
    async fn devices_page(&self, cursor: PageCursor) -> Result<Page<Device>, RemoteError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteVariable {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// The trimmed, non-empty `AccountNumber` value among `variables`.
pub fn account_number_variable(variables: &[SiteVariable]) -> Option<String> {
    variables
        .iter()
        .find(|v| v.name == ACCOUNT_VARIABLE)
        .and_then(|v| v.value.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceType {
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchManagement {
    #[serde(default)]
    pub patch_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Antivirus {
    #[serde(default)]
    pub antivirus_product: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub uid: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub site_uid: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub operating_system: Option<String>,
    #[serde(default)]
    pub int_ip_address: Option<String>,
    #[serde(default)]
    pub ext_ip_address: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub last_logged_in_user: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub last_seen: Option<serde_json::Value>,
    #[serde(default)]
    pub last_reboot: Option<serde_json::Value>,
    #[serde(default)]
    pub last_audit_date: Option<serde_json::Value>,
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub patch_management: Option<PatchManagement>,
    #[serde(default)]
    pub antivirus: Option<Antivirus>,
    #[serde(default)]
    pub udf: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub portal_url: Option<String>,
    #[serde(default)]
    pub web_remote_url: Option<String>,
}

impl Device {
    pub fn site_uid(&self) -> Option<&str> {
        self.site_uid.as_deref().filter(|s| !s.is_empty())
    }

    /// Backup usage in terabytes, rounded to two decimals.
    pub fn backup_usage_tb(&self) -> Option<f64> {
        let raw = self.udf.as_ref()?.get(BACKUP_BYTES_UDF)?;
        let bytes = match raw {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if bytes <= 0.0 {
            return None;
        }
        Some((DbAsset::tb_from_bytes(bytes) * 100.0).round() / 100.0)
    }

    pub fn to_asset(&self, account_number: &str) -> DbAsset {
        DbAsset {
            external_id: self.uid.clone(),
            hostname: self
                .hostname
                .clone()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| self.uid.clone()),
            company_account_number: account_number.to_string(),
            site_uid: self.site_uid().unwrap_or_default().to_string(),
            site_name: self.site_name.clone(),
            device_type: self.device_type.as_ref().and_then(|t| t.category.clone()),
            operating_system: self.operating_system.clone(),
            last_logged_in_user: self.last_logged_in_user.clone(),
            ip_internal: self.int_ip_address.clone(),
            ip_external: self.ext_ip_address.clone(),
            domain: self.domain.clone(),
            online: self.online,
            patch_status: self
                .patch_management
                .as_ref()
                .and_then(|p| p.patch_status.clone()),
            antivirus_product: self
                .antivirus
                .as_ref()
                .and_then(|a| a.antivirus_product.clone()),
            last_seen: epoch_millis_to_rfc3339(self.last_seen.as_ref()),
            last_reboot: epoch_millis_to_rfc3339(self.last_reboot.as_ref()),
            last_audit_date: epoch_millis_to_rfc3339(self.last_audit_date.as_ref()),
            backup_usage_tb: self.backup_usage_tb(),
            portal_url: self.portal_url.clone(),
            web_remote_url: self.web_remote_url.clone(),
        }
    }
}

/// RFC 3339 UTC for an epoch-milliseconds value given as a number or
/// numeric string. Zero and unparseable values are `None`.
pub fn epoch_millis_to_rfc3339(value: Option<&serde_json::Value>) -> Option<String> {
    let millis = match value? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if millis <= 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}
