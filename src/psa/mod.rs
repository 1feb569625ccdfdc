//! Ticketing system (PSA) source: wire types, normalization tables and the
//! `TicketingSource` seam the orchestrator pulls from.

pub mod client;

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::{DbCompany, DbContact};
use crate::remote::{Page, PageCursor, RemoteError, RetryPolicy};

pub use client::FreshserviceClient;

/// Department custom field holding the company account number.
pub const ACCOUNT_NUMBER_FIELD: &str = "account_number";

/// Results per page on every listing endpoint.
pub const PER_PAGE: usize = 100;

/// Status ids treated as closed: Resolved and Closed.
pub const CLOSED_STATUS_IDS: [i64; 2] = [4, 5];

const STATUS_CLOSED: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsaConfig {
    /// Helpdesk domain, with or without scheme.
    pub domain: String,
    pub api_key: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_requests_per_second() -> f64 {
    1.0
}

impl PsaConfig {
    pub fn base_url(&self) -> String {
        let domain = self.domain.trim().trim_end_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        }
    }
}

#[async_trait]
pub trait TicketingSource: Send + Sync {
    async fn departments_page(&self, cursor: PageCursor) -> Result<Page<Department>, RemoteError>;

    async fn requesters_page(&self, cursor: PageCursor) -> Result<Page<Requester>, RemoteError>;

    /// Closed tickets updated strictly after `since`.
    async fn closed_tickets_page(
        &self,
        since: DateTime<Utc>,
        cursor: PageCursor,
    ) -> Result<Page<RemoteTicket>, RemoteError>;

    /// Full conversation thread, oldest first. A missing ticket has none.
    async fn ticket_conversations(&self, ticket_id: i64) -> Result<Vec<Conversation>, RemoteError>;

    async fn ticket_time_entries(&self, ticket_id: i64) -> Result<Vec<TimeEntry>, RemoteError>;

    async fn set_department_account_number(
        &self,
        department_id: i64,
        account_number: &str,
    ) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub head_user_id: Option<i64>,
    #[serde(default)]
    pub prime_user_id: Option<i64>,
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub custom_fields: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Department {
    /// A custom field as trimmed text. Numbers are rendered; blanks are `None`.
    pub fn custom_str(&self, key: &str) -> Option<String> {
        let value = self.custom_fields.as_ref()?.get(key)?;
        let text = match value {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    pub fn account_number(&self) -> Option<String> {
        self.custom_str(ACCOUNT_NUMBER_FIELD)
    }

    pub fn to_company(&self) -> DbCompany {
        let contract_term = self
            .custom_str("contract_term")
            .map(|raw| normalize_contract_term(&raw));
        let contract_start_date = self.custom_str("contract_start_date");
        let contract_end_date = match (&contract_start_date, &contract_term) {
            (Some(start), Some(term)) => contract_end_date(start, term),
            _ => None,
        };
        let domains = self.domains.clone().unwrap_or_default();

        DbCompany {
            account_number: self.account_number(),
            external_id: Some(self.id),
            name: self.name.trim().to_string(),
            description: self.description.clone().filter(|d| !d.trim().is_empty()),
            plan_selected: self.custom_str("plan_selected"),
            managed_users: self.custom_str("managed_users"),
            managed_devices: self.custom_str("managed_devices"),
            contract_term,
            contract_start_date,
            contract_end_date,
            address: self.custom_str("address"),
            phone: self.custom_str("company_main_number"),
            head_user_id: self.head_user_id,
            prime_user_id: self.prime_user_id,
            domains: serde_json::to_string(&domains).unwrap_or_else(|_| "[]".to_string()),
            source_created_at: self.created_at.clone(),
            source_updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub primary_email: Option<String>,
    #[serde(default)]
    pub department_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub work_phone_number: Option<String>,
    #[serde(default)]
    pub mobile_phone_number: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Requester {
    pub fn department_ids(&self) -> &[i64] {
        self.department_ids.as_deref().unwrap_or(&[])
    }

    /// "First Last", falling back to the email local part.
    pub fn display_name(&self) -> String {
        let full = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or("").trim(),
            self.last_name.as_deref().unwrap_or("").trim()
        )
        .trim()
        .to_string();
        if !full.is_empty() {
            return full;
        }
        self.primary_email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .unwrap_or("")
            .to_string()
    }

    pub fn to_contact(&self) -> DbContact {
        let blank_to_none = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        DbContact {
            external_id: Some(self.id),
            email: blank_to_none(&self.primary_email).map(|e| e.trim().to_string()),
            name: self.display_name(),
            first_name: blank_to_none(&self.first_name),
            last_name: blank_to_none(&self.last_name),
            job_title: blank_to_none(&self.job_title),
            work_phone: blank_to_none(&self.work_phone_number),
            mobile_phone: blank_to_none(&self.mobile_phone_number),
            active: self.active.unwrap_or(true),
            source_created_at: self.created_at.clone(),
            source_updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketRequester {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketStats {
    #[serde(default)]
    pub first_responded_at: Option<String>,
    #[serde(default)]
    pub agent_responded_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteTicket {
    pub id: i64,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_text: Option<String>,
    pub status: i64,
    #[serde(default)]
    pub status_name: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub priority_name: Option<String>,
    #[serde(default, rename = "type")]
    pub ticket_type: Option<String>,
    #[serde(default)]
    pub requester_id: Option<i64>,
    #[serde(default)]
    pub requester: Option<TicketRequester>,
    #[serde(default)]
    pub responder_id: Option<i64>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub department_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    pub updated_at: String,
    #[serde(default)]
    pub due_by: Option<String>,
    #[serde(default)]
    pub fr_due_by: Option<String>,
    #[serde(default)]
    pub stats: Option<TicketStats>,
}

impl RemoteTicket {
    pub fn is_closed(&self) -> bool {
        CLOSED_STATUS_IDS.contains(&self.status)
    }

    /// Closure time: the last update of a ticket in the Closed status.
    pub fn closed_at(&self) -> Option<String> {
        (self.status == STATUS_CLOSED).then(|| self.updated_at.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub to_emails: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub created_at: String,
    #[serde(default)]
    pub incoming: bool,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    #[serde(default)]
    pub id: Option<i64>,
    /// `HH:MM` or `HH:MM:SS`.
    #[serde(default)]
    pub time_spent: Option<String>,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

pub fn status_name(status_id: i64) -> Option<&'static str> {
    let name = match status_id {
        2 => "Open",
        3 => "Pending",
        4 => "Resolved",
        5 => "Closed",
        8 => "Scheduled",
        9 => "Waiting on Customer",
        10 => "Waiting on Third Party",
        13 => "Under Investigation",
        15 => "Job Complete - Bill",
        16 => "Billing Complete - Close",
        19 => "Update Needed",
        23 => "On Hold",
        26 => "Customer Replied",
        27 => "Pending Hubspot",
        _ => return None,
    };
    Some(name)
}

pub fn priority_name(priority_id: i64) -> Option<&'static str> {
    match priority_id {
        1 => Some("Low"),
        2 => Some("Medium"),
        3 => Some("High"),
        4 => Some("Urgent"),
        _ => None,
    }
}

/// Canonical contract term. Unrecognized values are kept as entered.
pub fn normalize_contract_term(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    match lowered.as_str() {
        "1 year" | "1 years" | "1 year(s)" | "one year" | "annual" => "1 Year".to_string(),
        "2 year" | "2 years" | "2 year(s)" | "two year" => "2 Year".to_string(),
        "3 year" | "3 years" | "3 year(s)" | "three year" => "3 Year".to_string(),
        "month to month" | "month-to-month" | "monthly" => "Month to Month".to_string(),
        _ => raw.trim().to_string(),
    }
}

fn term_years(term: &str) -> Option<u32> {
    match term {
        "1 Year" => Some(1),
        "2 Year" => Some(2),
        "3 Year" => Some(3),
        _ => None,
    }
}

/// Last day of a fixed-term contract: start plus the term, minus one day.
/// Month-to-month and unknown terms have no end date.
pub fn contract_end_date(start: &str, term: &str) -> Option<String> {
    let years = term_years(term)?;
    let date_part = start.trim().get(..10)?;
    let start = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let anniversary = start.checked_add_months(Months::new(12 * years))?;
    // A Feb 29 start clamps to Feb 28, which is already the day before Mar 1.
    let end = if anniversary.day() == start.day() {
        anniversary.pred_opt()?
    } else {
        anniversary
    };
    Some(end.format("%Y-%m-%d").to_string())
}

fn re_tags() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

fn re_whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Markup-free, whitespace-collapsed text.
pub fn strip_html(html: &str) -> String {
    let without_tags = re_tags().replace_all(html, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    re_whitespace().replace_all(&decoded, " ").trim().to_string()
}

/// Hours in an `HH:MM` or `HH:MM:SS` duration. Malformed values count as zero.
pub fn parse_time_spent(raw: &str) -> f64 {
    let parts: Vec<Option<u32>> = raw.trim().split(':').map(|p| p.parse().ok()).collect();
    match parts.as_slice() {
        [Some(h), Some(m)] => *h as f64 + *m as f64 / 60.0,
        [Some(h), Some(m), Some(s)] => *h as f64 + *m as f64 / 60.0 + *s as f64 / 3600.0,
        _ => 0.0,
    }
}

pub fn total_hours(entries: &[TimeEntry]) -> f64 {
    entries
        .iter()
        .filter_map(|e| e.time_spent.as_deref())
        .map(parse_time_spent)
        .sum()
}
