//! Declared data model.
//!
//! The store's schema is an explicit, versioned list of table, column and
//! index descriptors. The migration engine diffs this list against the live
//! database; nothing here is derived from runtime reflection.
//!
//! Tables are listed base-first: association tables come after the tables
//! they reference so a fresh database can be created in declaration order.

use std::fmt;

/// Bump whenever a table, column or index is added below.
pub const SCHEMA_VERSION: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// SQL literal used as the column default.
    pub default: Option<&'static str>,
    pub primary_key: bool,
    pub unique: bool,
}

/// A nullable column with no default. Chain the builders to tighten it.
pub const fn column(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: true,
        default: None,
        primary_key: false,
        unique: false,
    }
}

impl ColumnDef {
    pub const fn not_null(self) -> Self {
        Self {
            nullable: false,
            ..self
        }
    }

    pub const fn default_sql(self, literal: &'static str) -> Self {
        Self {
            default: Some(literal),
            ..self
        }
    }

    pub const fn primary_key(self) -> Self {
        Self {
            primary_key: true,
            nullable: false,
            ..self
        }
    }

    pub const fn unique(self) -> Self {
        Self {
            unique: true,
            ..self
        }
    }

    /// Column definition as used inside `CREATE TABLE`. A lone primary key
    /// is declared inline; composite keys are emitted as a table constraint.
    pub fn create_sql(&self, inline_pk: bool) -> String {
        let mut sql = format!("{} {}", self.name, self.ty);
        if self.primary_key && inline_pk {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn create_sql(&self) -> String {
        let pk: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name)
            .collect();
        let inline_pk = pk.len() == 1;
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.create_sql(inline_pk))
            .collect();
        if pk.len() > 1 {
            parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }
        format!("CREATE TABLE {} (\n    {}\n)", self.name, parts.join(",\n    "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    /// Column expressions, e.g. `email COLLATE NOCASE`.
    pub columns: &'static [&'static str],
    pub unique: bool,
    /// Partial-index predicate.
    pub filter: Option<&'static str>,
}

impl IndexDef {
    pub fn create_sql(&self) -> String {
        let mut sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns.join(", ")
        );
        if let Some(filter) = self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        sql
    }

    /// Bare column names the index depends on.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .filter_map(|expr| expr.split_whitespace().next())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeclaredModel {
    pub version: i32,
    pub tables: &'static [TableDef],
    pub indexes: &'static [IndexDef],
}

impl DeclaredModel {
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

use ColumnType::{Integer, Real, Text};

const COMPANIES: TableDef = TableDef {
    name: "companies",
    columns: &[
        column("id", Integer).primary_key(),
        column("account_number", Text).unique(),
        column("external_id", Integer).unique(),
        column("name", Text).not_null(),
        column("description", Text),
        column("plan_selected", Text),
        column("managed_users", Text),
        column("managed_devices", Text),
        column("contract_term", Text),
        column("contract_start_date", Text),
        column("contract_end_date", Text),
        column("address", Text),
        column("phone", Text),
        column("head_user_id", Integer),
        column("prime_user_id", Integer),
        column("domains", Text).not_null().default_sql("'[]'"),
        column("source_created_at", Text),
        column("source_updated_at", Text),
        column("synced_at", Text).not_null(),
    ],
};

const CONTACTS: TableDef = TableDef {
    name: "contacts",
    columns: &[
        column("id", Integer).primary_key(),
        column("external_id", Integer).unique(),
        column("email", Text),
        column("name", Text).not_null(),
        column("first_name", Text),
        column("last_name", Text),
        column("job_title", Text),
        column("work_phone", Text),
        column("mobile_phone", Text),
        column("active", Integer).not_null().default_sql("1"),
        column("source_created_at", Text),
        column("source_updated_at", Text),
        column("synced_at", Text).not_null(),
    ],
};

const SITE_LINKS: TableDef = TableDef {
    name: "site_links",
    columns: &[
        column("site_uid", Text).primary_key(),
        column("site_name", Text),
        column("company_account_number", Text).not_null(),
        column("updated_at", Text).not_null(),
    ],
};

const ASSETS: TableDef = TableDef {
    name: "assets",
    columns: &[
        column("id", Integer).primary_key(),
        column("external_id", Text).not_null().unique(),
        column("hostname", Text).not_null(),
        column("company_account_number", Text).not_null(),
        column("site_uid", Text).not_null(),
        column("site_name", Text),
        column("device_type", Text),
        column("operating_system", Text),
        column("last_logged_in_user", Text),
        column("ip_internal", Text),
        column("ip_external", Text),
        column("domain", Text),
        column("online", Integer),
        column("patch_status", Text),
        column("antivirus_product", Text),
        column("last_seen", Text),
        column("last_reboot", Text),
        column("last_audit_date", Text),
        column("backup_usage_tb", Real),
        column("portal_url", Text),
        column("web_remote_url", Text),
        column("synced_at", Text).not_null(),
    ],
};

const TICKETS: TableDef = TableDef {
    name: "tickets",
    columns: &[
        column("id", Integer).primary_key(),
        column("ticket_id", Integer).not_null().unique(),
        column("company_account_number", Text),
        column("subject", Text).not_null(),
        column("description_text", Text),
        column("status", Text).not_null(),
        column("status_id", Integer).not_null(),
        column("priority", Text).not_null(),
        column("priority_id", Integer).not_null(),
        column("ticket_type", Text),
        column("requester_id", Integer),
        column("requester_name", Text),
        column("requester_email", Text),
        column("responder_id", Integer),
        column("group_id", Integer),
        column("source_created_at", Text),
        column("source_updated_at", Text).not_null(),
        column("closed_at", Text),
        column("due_by", Text),
        column("fr_due_by", Text),
        column("first_responded_at", Text),
        column("agent_responded_at", Text),
        column("total_hours_spent", Real).not_null().default_sql("0"),
        column("conversations", Text).not_null().default_sql("'[]'"),
        column("notes", Text).not_null().default_sql("'[]'"),
        column("synced_at", Text).not_null(),
    ],
};

const SYNC_JOBS: TableDef = TableDef {
    name: "sync_jobs",
    columns: &[
        column("id", Text).primary_key(),
        column("source", Text).not_null(),
        column("mode", Text).not_null(),
        column("status", Text).not_null(),
        column("started_at", Text).not_null(),
        column("completed_at", Text),
        column("success", Integer),
        column("output", Text),
        column("error", Text),
        column("watermark", Text),
    ],
};

const CONTACT_COMPANIES: TableDef = TableDef {
    name: "contact_companies",
    columns: &[
        column("contact_id", Integer).primary_key(),
        column("company_account_number", Text).primary_key(),
        column("linked_at", Text).not_null(),
    ],
};

const INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "idx_contacts_email",
        table: "contacts",
        columns: &["email COLLATE NOCASE"],
        unique: false,
        filter: None,
    },
    IndexDef {
        name: "idx_assets_company",
        table: "assets",
        columns: &["company_account_number"],
        unique: false,
        filter: None,
    },
    IndexDef {
        name: "idx_tickets_company",
        table: "tickets",
        columns: &["company_account_number"],
        unique: false,
        filter: None,
    },
    IndexDef {
        name: "idx_tickets_updated",
        table: "tickets",
        columns: &["source_updated_at"],
        unique: false,
        filter: None,
    },
    IndexDef {
        name: "idx_sync_jobs_source_status",
        table: "sync_jobs",
        columns: &["source", "status"],
        unique: false,
        filter: None,
    },
    // At most one running job per source.
    IndexDef {
        name: "idx_sync_jobs_one_running",
        table: "sync_jobs",
        columns: &["source"],
        unique: true,
        filter: Some("status = 'running'"),
    },
    IndexDef {
        name: "idx_contact_companies_account",
        table: "contact_companies",
        columns: &["company_account_number"],
        unique: false,
        filter: None,
    },
];

/// The schema this build of Codex expects.
pub const MODEL: DeclaredModel = DeclaredModel {
    version: SCHEMA_VERSION,
    tables: &[
        COMPANIES,
        CONTACTS,
        SITE_LINKS,
        ASSETS,
        TICKETS,
        SYNC_JOBS,
        CONTACT_COMPANIES,
    ],
    indexes: INDEXES,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sql_inline_primary_key() {
        let sql = SITE_LINKS.create_sql();
        assert!(sql.starts_with("CREATE TABLE site_links"));
        assert!(sql.contains("site_uid TEXT PRIMARY KEY"));
        assert!(sql.contains("company_account_number TEXT NOT NULL"));
    }

    #[test]
    fn test_create_sql_composite_primary_key() {
        let sql = CONTACT_COMPANIES.create_sql();
        assert!(sql.contains("PRIMARY KEY (contact_id, company_account_number)"));
        assert!(sql.contains("contact_id INTEGER NOT NULL"));
    }

    #[test]
    fn test_partial_unique_index_sql() {
        let index = MODEL
            .indexes
            .iter()
            .find(|i| i.name == "idx_sync_jobs_one_running")
            .unwrap();
        assert_eq!(
            index.create_sql(),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_one_running ON sync_jobs (source) WHERE status = 'running'"
        );
    }

    #[test]
    fn test_index_column_names_strip_collation() {
        let index = &INDEXES[0];
        assert_eq!(index.column_names().collect::<Vec<_>>(), vec!["email"]);
    }

    #[test]
    fn test_association_tables_follow_base_tables() {
        let position = |name: &str| MODEL.tables.iter().position(|t| t.name == name).unwrap();
        assert!(position("contact_companies") > position("contacts"));
        assert!(position("contact_companies") > position("companies"));
    }

    #[test]
    fn test_every_index_targets_declared_columns() {
        for index in MODEL.indexes {
            let table = MODEL.table(index.table).expect("index table declared");
            for col in index.column_names() {
                assert!(table.column(col).is_some(), "{} missing {}", index.name, col);
            }
        }
    }
}
