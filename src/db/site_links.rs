//! RMM site to company account number mapping.
//!
//! Refreshed from each site's `AccountNumber` variable at the start of every
//! asset sync. Devices resolve their owning company through this table.

use std::collections::HashMap;

use rusqlite::params;

use super::{CodexDb, DbError, DbSiteLink};

impl CodexDb {
    pub fn upsert_site_link(&self, link: &DbSiteLink) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO site_links (site_uid, site_name, company_account_number, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(site_uid) DO UPDATE SET
                site_name = excluded.site_name,
                company_account_number = excluded.company_account_number,
                updated_at = excluded.updated_at",
            params![
                link.site_uid,
                link.site_name,
                link.company_account_number,
                link.updated_at
            ],
        )?;
        Ok(())
    }

    /// Forget a site whose account variable was cleared upstream.
    pub fn remove_site_link(&self, site_uid: &str) -> Result<bool, DbError> {
        let removed = self
            .conn_ref()
            .execute("DELETE FROM site_links WHERE site_uid = ?1", [site_uid])?;
        Ok(removed > 0)
    }

    pub fn account_for_site(&self, site_uid: &str) -> Result<Option<String>, DbError> {
        let mut stmt = self
            .conn_ref()
            .prepare("SELECT company_account_number FROM site_links WHERE site_uid = ?1")?;
        let mut rows = stmt.query_map([site_uid], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn site_account_map(&self) -> Result<HashMap<String, String>, DbError> {
        let mut stmt = self
            .conn_ref()
            .prepare("SELECT site_uid, company_account_number FROM site_links")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (site, account) = row?;
            map.insert(site, account);
        }
        Ok(map)
    }

    pub fn list_site_links(&self) -> Result<Vec<DbSiteLink>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT site_uid, site_name, company_account_number, updated_at
             FROM site_links ORDER BY site_name COLLATE NOCASE, site_uid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DbSiteLink {
                site_uid: row.get(0)?,
                site_name: row.get(1)?,
                company_account_number: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn link(site: &str, account: &str) -> DbSiteLink {
        DbSiteLink {
            site_uid: site.to_string(),
            site_name: Some(format!("Site {}", site)),
            company_account_number: account.to_string(),
            updated_at: "2025-02-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_upsert_replaces_account() {
        let db = test_db();
        db.upsert_site_link(&link("s-1", "100001")).unwrap();
        db.upsert_site_link(&link("s-1", "100002")).unwrap();

        assert_eq!(db.account_for_site("s-1").unwrap().as_deref(), Some("100002"));
        assert_eq!(db.list_site_links().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_site_has_no_account() {
        let db = test_db();
        assert_eq!(db.account_for_site("missing").unwrap(), None);
        assert!(!db.remove_site_link("missing").unwrap());
    }

    #[test]
    fn test_site_account_map() {
        let db = test_db();
        db.upsert_site_link(&link("a", "1")).unwrap();
        db.upsert_site_link(&link("b", "2")).unwrap();
        let map = db.site_account_map().unwrap();
        assert_eq!(map.get("b").map(String::as_str), Some("2"));
        assert_eq!(map.len(), 2);
    }
}
