//! Column mapping and queries for the mirrored entity tables.
//!
//! Every entity exposes its columns as `rusqlite` values in declaration
//! order. The reconciler compares those values field by field, and the
//! orchestrator writes only the fields that changed.

use std::collections::HashMap;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Row};

use super::types::{flag, int, json_text, real, text};
use super::{CodexDb, DbAsset, DbCompany, DbContact, DbError, DbTicket, Stored};

/// A mirrored entity stored in one table.
pub trait Entity: Sized + Clone {
    const TABLE: &'static str;
    /// Mirrored columns, excluding `id` and `synced_at`.
    const COLUMNS: &'static [&'static str];
    /// Columns written once and never overwritten while the stored value is non-null.
    const IDENTITY: &'static [&'static str];

    /// Column values aligned with `COLUMNS`.
    fn values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// A natural key used to look up local rows for an inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKey {
    AccountNumber(String),
    /// PSA numeric id (department or requester).
    ExternalId(i64),
    /// RMM device uid.
    DeviceUid(String),
    TicketId(i64),
    /// Case-insensitive.
    Email(String),
}

impl MatchKey {
    fn predicate(&self) -> (&'static str, Value) {
        match self {
            Self::AccountNumber(n) => ("account_number = ?1", Value::Text(n.clone())),
            Self::ExternalId(id) => ("external_id = ?1", Value::Integer(*id)),
            Self::DeviceUid(uid) => ("external_id = ?1", Value::Text(uid.clone())),
            Self::TicketId(id) => ("ticket_id = ?1", Value::Integer(*id)),
            Self::Email(email) => ("email = ?1 COLLATE NOCASE", Value::Text(email.clone())),
        }
    }
}

fn stored_from_row<E: Entity>(row: &Row<'_>) -> rusqlite::Result<Stored<E>> {
    Ok(Stored {
        id: row.get("id")?,
        synced_at: row.get("synced_at")?,
        record: E::from_row(row)?,
    })
}

fn select_sql<E: Entity>() -> String {
    format!(
        "SELECT id, synced_at, {} FROM {}",
        E::COLUMNS.join(", "),
        E::TABLE
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

impl CodexDb {
    /// Local rows matching `key`, most recently synced first.
    pub fn find_matches<E: Entity>(&self, key: &MatchKey) -> Result<Vec<Stored<E>>, DbError> {
        let (predicate, value) = key.predicate();
        let sql = format!(
            "{} WHERE {} ORDER BY synced_at DESC, id DESC",
            select_sql::<E>(),
            predicate
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([value], stored_from_row::<E>)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_entity<E: Entity>(&self, record: &E, synced_at: &str) -> Result<i64, DbError> {
        let placeholders: Vec<String> = (1..=E::COLUMNS.len() + 1).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}, synced_at) VALUES ({})",
            E::TABLE,
            E::COLUMNS.join(", "),
            placeholders.join(", ")
        );
        let mut values = record.values();
        values.push(Value::Text(synced_at.to_string()));
        self.conn_ref().execute(&sql, params_from_iter(values))?;
        Ok(self.conn_ref().last_insert_rowid())
    }

    /// Overwrite the given fields of one row and stamp its sync time.
    pub fn update_entity_fields<E: Entity>(
        &self,
        id: i64,
        fields: &[(&'static str, Value)],
        synced_at: &str,
    ) -> Result<(), DbError> {
        let mut assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", name, i + 1))
            .collect();
        assignments.push(format!("synced_at = ?{}", fields.len() + 1));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            E::TABLE,
            assignments.join(", "),
            fields.len() + 2
        );
        let mut values: Vec<Value> = fields.iter().map(|(_, v)| v.clone()).collect();
        values.push(Value::Text(synced_at.to_string()));
        values.push(Value::Integer(id));
        let changed = self.conn_ref().execute(&sql, params_from_iter(values))?;
        if changed != 1 {
            return Err(DbError::InvalidValue(format!(
                "{} row {} vanished during update",
                E::TABLE,
                id
            )));
        }
        Ok(())
    }

    pub fn delete_entities<E: Entity>(&self, ids: &[i64]) -> Result<usize, DbError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", E::TABLE);
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute([id])?;
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Companies
    // -----------------------------------------------------------------------

    pub fn get_company(&self, account_number: &str) -> Result<Option<Stored<DbCompany>>, DbError> {
        let matches = self.find_matches::<DbCompany>(&MatchKey::AccountNumber(account_number.to_string()))?;
        Ok(matches.into_iter().next())
    }

    pub fn list_companies(&self) -> Result<Vec<Stored<DbCompany>>, DbError> {
        let sql = format!("{} ORDER BY name COLLATE NOCASE, id", select_sql::<DbCompany>());
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([], stored_from_row::<DbCompany>)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// PSA department id to account number, for companies that have one.
    pub fn department_account_map(&self) -> Result<HashMap<i64, String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT external_id, account_number FROM companies
             WHERE external_id IS NOT NULL AND account_number IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (dept, account) = row?;
            map.insert(dept, account);
        }
        Ok(map)
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    /// Associate a contact with a company. Existing links are never removed.
    pub fn link_contact_company(
        &self,
        contact_id: i64,
        account_number: &str,
        linked_at: &str,
    ) -> Result<bool, DbError> {
        let inserted = self.conn_ref().execute(
            "INSERT OR IGNORE INTO contact_companies (contact_id, company_account_number, linked_at)
             VALUES (?1, ?2, ?3)",
            params![contact_id, account_number, linked_at],
        )?;
        Ok(inserted > 0)
    }

    pub fn contact_account_numbers(&self, contact_id: i64) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT company_account_number FROM contact_companies
             WHERE contact_id = ?1 ORDER BY company_account_number",
        )?;
        let rows = stmt.query_map([contact_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn company_contacts(&self, account_number: &str) -> Result<Vec<Stored<DbContact>>, DbError> {
        let sql = format!(
            "SELECT c.id, c.synced_at, {} FROM contacts c
             JOIN contact_companies cc ON cc.contact_id = c.id
             WHERE cc.company_account_number = ?1
             ORDER BY c.name COLLATE NOCASE, c.id",
            DbContact::COLUMNS
                .iter()
                .map(|col| format!("c.{}", col))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([account_number], stored_from_row::<DbContact>)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------------

    pub fn company_assets(&self, account_number: &str) -> Result<Vec<Stored<DbAsset>>, DbError> {
        let sql = format!(
            "{} WHERE company_account_number = ?1 ORDER BY hostname COLLATE NOCASE, id",
            select_sql::<DbAsset>()
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([account_number], stored_from_row::<DbAsset>)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Row id and device uid of every stored asset.
    pub fn asset_device_uids(&self) -> Result<Vec<(i64, String)>, DbError> {
        let mut stmt = self.conn_ref().prepare("SELECT id, external_id FROM assets")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Tickets
    // -----------------------------------------------------------------------

    pub fn company_tickets(&self, account_number: &str) -> Result<Vec<Stored<DbTicket>>, DbError> {
        let sql = format!(
            "{} WHERE company_account_number = ?1 ORDER BY source_updated_at DESC, id DESC",
            select_sql::<DbTicket>()
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map([account_number], stored_from_row::<DbTicket>)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_ticket(&self, ticket_id: i64) -> Result<Option<Stored<DbTicket>>, DbError> {
        let matches = self.find_matches::<DbTicket>(&MatchKey::TicketId(ticket_id))?;
        Ok(matches.into_iter().next())
    }

    /// Row id and ticket id of tickets last updated at or after `since`.
    pub fn ticket_ids_updated_since(&self, since: &str) -> Result<Vec<(i64, i64)>, DbError> {
        let mut stmt = self
            .conn_ref()
            .prepare("SELECT id, ticket_id FROM tickets WHERE source_updated_at >= ?1")?;
        let rows = stmt.query_map([since], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Entity impls
// ---------------------------------------------------------------------------

impl Entity for DbCompany {
    const TABLE: &'static str = "companies";
    const COLUMNS: &'static [&'static str] = &[
        "account_number",
        "external_id",
        "name",
        "description",
        "plan_selected",
        "managed_users",
        "managed_devices",
        "contract_term",
        "contract_start_date",
        "contract_end_date",
        "address",
        "phone",
        "head_user_id",
        "prime_user_id",
        "domains",
        "source_created_at",
        "source_updated_at",
    ];
    const IDENTITY: &'static [&'static str] = &["account_number", "external_id"];

    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.account_number),
            int(self.external_id),
            Value::Text(self.name.clone()),
            text(&self.description),
            text(&self.plan_selected),
            text(&self.managed_users),
            text(&self.managed_devices),
            text(&self.contract_term),
            text(&self.contract_start_date),
            text(&self.contract_end_date),
            text(&self.address),
            text(&self.phone),
            int(self.head_user_id),
            int(self.prime_user_id),
            Value::Text(self.domains.clone()),
            text(&self.source_created_at),
            text(&self.source_updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_number: row.get("account_number")?,
            external_id: row.get("external_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            plan_selected: row.get("plan_selected")?,
            managed_users: row.get("managed_users")?,
            managed_devices: row.get("managed_devices")?,
            contract_term: row.get("contract_term")?,
            contract_start_date: row.get("contract_start_date")?,
            contract_end_date: row.get("contract_end_date")?,
            address: row.get("address")?,
            phone: row.get("phone")?,
            head_user_id: row.get("head_user_id")?,
            prime_user_id: row.get("prime_user_id")?,
            domains: row.get("domains")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
        })
    }
}

impl Entity for DbContact {
    const TABLE: &'static str = "contacts";
    const COLUMNS: &'static [&'static str] = &[
        "external_id",
        "email",
        "name",
        "first_name",
        "last_name",
        "job_title",
        "work_phone",
        "mobile_phone",
        "active",
        "source_created_at",
        "source_updated_at",
    ];
    const IDENTITY: &'static [&'static str] = &["external_id"];

    fn values(&self) -> Vec<Value> {
        vec![
            int(self.external_id),
            text(&self.email),
            Value::Text(self.name.clone()),
            text(&self.first_name),
            text(&self.last_name),
            text(&self.job_title),
            text(&self.work_phone),
            text(&self.mobile_phone),
            flag(Some(self.active)),
            text(&self.source_created_at),
            text(&self.source_updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            external_id: row.get("external_id")?,
            email: row.get("email")?,
            name: row.get("name")?,
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            job_title: row.get("job_title")?,
            work_phone: row.get("work_phone")?,
            mobile_phone: row.get("mobile_phone")?,
            active: row.get("active")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
        })
    }
}

impl Entity for DbAsset {
    const TABLE: &'static str = "assets";
    const COLUMNS: &'static [&'static str] = &[
        "external_id",
        "hostname",
        "company_account_number",
        "site_uid",
        "site_name",
        "device_type",
        "operating_system",
        "last_logged_in_user",
        "ip_internal",
        "ip_external",
        "domain",
        "online",
        "patch_status",
        "antivirus_product",
        "last_seen",
        "last_reboot",
        "last_audit_date",
        "backup_usage_tb",
        "portal_url",
        "web_remote_url",
    ];
    const IDENTITY: &'static [&'static str] = &["external_id", "hostname"];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.external_id.clone()),
            Value::Text(self.hostname.clone()),
            Value::Text(self.company_account_number.clone()),
            Value::Text(self.site_uid.clone()),
            text(&self.site_name),
            text(&self.device_type),
            text(&self.operating_system),
            text(&self.last_logged_in_user),
            text(&self.ip_internal),
            text(&self.ip_external),
            text(&self.domain),
            flag(self.online),
            text(&self.patch_status),
            text(&self.antivirus_product),
            text(&self.last_seen),
            text(&self.last_reboot),
            text(&self.last_audit_date),
            real(self.backup_usage_tb),
            text(&self.portal_url),
            text(&self.web_remote_url),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            external_id: row.get("external_id")?,
            hostname: row.get("hostname")?,
            company_account_number: row.get("company_account_number")?,
            site_uid: row.get("site_uid")?,
            site_name: row.get("site_name")?,
            device_type: row.get("device_type")?,
            operating_system: row.get("operating_system")?,
            last_logged_in_user: row.get("last_logged_in_user")?,
            ip_internal: row.get("ip_internal")?,
            ip_external: row.get("ip_external")?,
            domain: row.get("domain")?,
            online: row.get("online")?,
            patch_status: row.get("patch_status")?,
            antivirus_product: row.get("antivirus_product")?,
            last_seen: row.get("last_seen")?,
            last_reboot: row.get("last_reboot")?,
            last_audit_date: row.get("last_audit_date")?,
            backup_usage_tb: row.get("backup_usage_tb")?,
            portal_url: row.get("portal_url")?,
            web_remote_url: row.get("web_remote_url")?,
        })
    }
}

impl Entity for DbTicket {
    const TABLE: &'static str = "tickets";
    const COLUMNS: &'static [&'static str] = &[
        "ticket_id",
        "company_account_number",
        "subject",
        "description_text",
        "status",
        "status_id",
        "priority",
        "priority_id",
        "ticket_type",
        "requester_id",
        "requester_name",
        "requester_email",
        "responder_id",
        "group_id",
        "source_created_at",
        "source_updated_at",
        "closed_at",
        "due_by",
        "fr_due_by",
        "first_responded_at",
        "agent_responded_at",
        "total_hours_spent",
        "conversations",
        "notes",
    ];
    const IDENTITY: &'static [&'static str] = &["ticket_id"];

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.ticket_id),
            text(&self.company_account_number),
            Value::Text(self.subject.clone()),
            text(&self.description_text),
            Value::Text(self.status.clone()),
            Value::Integer(self.status_id),
            Value::Text(self.priority.clone()),
            Value::Integer(self.priority_id),
            text(&self.ticket_type),
            int(self.requester_id),
            text(&self.requester_name),
            text(&self.requester_email),
            int(self.responder_id),
            int(self.group_id),
            text(&self.source_created_at),
            Value::Text(self.source_updated_at.clone()),
            text(&self.closed_at),
            text(&self.due_by),
            text(&self.fr_due_by),
            text(&self.first_responded_at),
            text(&self.agent_responded_at),
            Value::Real(self.total_hours_spent),
            json_text(&self.conversations),
            json_text(&self.notes),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ticket_id: row.get("ticket_id")?,
            company_account_number: row.get("company_account_number")?,
            subject: row.get("subject")?,
            description_text: row.get("description_text")?,
            status: row.get("status")?,
            status_id: row.get("status_id")?,
            priority: row.get("priority")?,
            priority_id: row.get("priority_id")?,
            ticket_type: row.get("ticket_type")?,
            requester_id: row.get("requester_id")?,
            requester_name: row.get("requester_name")?,
            requester_email: row.get("requester_email")?,
            responder_id: row.get("responder_id")?,
            group_id: row.get("group_id")?,
            source_created_at: row.get("source_created_at")?,
            source_updated_at: row.get("source_updated_at")?,
            closed_at: row.get("closed_at")?,
            due_by: row.get("due_by")?,
            fr_due_by: row.get("fr_due_by")?,
            first_responded_at: row.get("first_responded_at")?,
            agent_responded_at: row.get("agent_responded_at")?,
            total_hours_spent: row.get("total_hours_spent")?,
            conversations: json_column(row, "conversations")?,
            notes: json_column(row, "notes")?,
        })
    }
}
