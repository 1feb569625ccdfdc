//! Companies source: PSA departments become companies, requesters become
//! contacts linked to the companies of their departments.

use crate::db::CodexDb;
use crate::error::SyncError;
use crate::psa::{Department, Requester, TicketingSource};
use crate::reconcile::SkipReason;
use crate::remote::Paginator;

use super::runner::{merge_record, RunContext};

pub async fn sync_companies(
    psa: &dyn TicketingSource,
    db: &mut CodexDb,
    ctx: &mut RunContext,
) -> Result<(), SyncError> {
    let mut departments = Paginator::new("/departments");
    while let Some(page) = departments.next_page(|cursor| psa.departments_page(cursor)).await? {
        store_departments(db, ctx, &page)?;
        ctx.batch.commit(db)?;
        log::info!(
            "Sync companies: department page {} ({} records)",
            departments.pages_fetched(),
            page.len()
        );
    }

    // Departments are committed first so requesters resolve against them.
    let mut requesters = Paginator::new("/requesters");
    while let Some(page) = requesters.next_page(|cursor| psa.requesters_page(cursor)).await? {
        store_requesters(db, ctx, &page)?;
        ctx.batch.commit(db)?;
        log::info!(
            "Sync companies: requester page {} ({} records)",
            requesters.pages_fetched(),
            page.len()
        );
    }
    Ok(())
}

fn store_departments(db: &CodexDb, ctx: &mut RunContext, page: &[Department]) -> Result<(), SyncError> {
    for department in page {
        if !ctx.is_due(department.updated_at.as_deref()) {
            continue;
        }
        ctx.stats.processed += 1;
        let company = department.to_company();
        if company.account_number.is_none() {
            log::debug!(
                "Department {} ({}) has no account number yet",
                department.id,
                company.name
            );
        }
        merge_record(db, ctx, &company)?;
    }
    Ok(())
}

fn store_requesters(db: &CodexDb, ctx: &mut RunContext, page: &[Requester]) -> Result<(), SyncError> {
    let accounts = db.department_account_map()?;
    for requester in page {
        if !ctx.is_due(requester.updated_at.as_deref()) {
            continue;
        }
        ctx.stats.processed += 1;

        let mut linked: Vec<&String> = requester
            .department_ids()
            .iter()
            .filter_map(|id| accounts.get(id))
            .collect();
        linked.sort();
        linked.dedup();
        if linked.is_empty() {
            let reason = SkipReason::UnmappedDepartment {
                department_ids: requester.department_ids().to_vec(),
            };
            ctx.skip(&format!("requester {}", requester.id), &reason);
            continue;
        }

        let Some(contact_id) = merge_record(db, ctx, &requester.to_contact())? else {
            continue;
        };
        let linked_at = ctx.synced_at.clone();
        for account in linked {
            ctx.batch
                .write(db, |db| db.link_contact_company(contact_id, account, &linked_at))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{JobStatus, SyncMode, SyncSource};
    use crate::psa::{Conversation, RemoteTicket, TimeEntry};
    use crate::remote::{Page, PageCursor, RemoteError};
    use crate::sync::{SyncOptions, SyncRunner};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::Arc;

    struct FakePsa {
        departments: Vec<Department>,
        requesters: Vec<Requester>,
    }

    #[async_trait]
    impl TicketingSource for FakePsa {
        async fn departments_page(&self, _cursor: PageCursor) -> Result<Page<Department>, RemoteError> {
            Ok(Page::last(self.departments.clone()))
        }

        async fn requesters_page(&self, _cursor: PageCursor) -> Result<Page<Requester>, RemoteError> {
            Ok(Page::last(self.requesters.clone()))
        }

        async fn closed_tickets_page(
            &self,
            _since: DateTime<Utc>,
            _cursor: PageCursor,
        ) -> Result<Page<RemoteTicket>, RemoteError> {
            Ok(Page::last(Vec::new()))
        }

        async fn ticket_conversations(&self, _id: i64) -> Result<Vec<Conversation>, RemoteError> {
            Ok(Vec::new())
        }

        async fn ticket_time_entries(&self, _id: i64) -> Result<Vec<TimeEntry>, RemoteError> {
            Ok(Vec::new())
        }

        async fn set_department_account_number(&self, _id: i64, _account: &str) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn department(id: i64, name: &str, account: Option<&str>) -> Department {
        let mut fields = std::collections::HashMap::new();
        if let Some(account) = account {
            fields.insert("account_number".to_string(), json!(account));
        }
        Department {
            id,
            name: name.into(),
            custom_fields: Some(fields),
            ..Default::default()
        }
    }

    fn requester(id: i64, email: &str, departments: Vec<i64>) -> Requester {
        Requester {
            id,
            first_name: Some("Pat".into()),
            primary_email: Some(email.into()),
            department_ids: Some(departments),
            ..Default::default()
        }
    }

    fn runner(psa: FakePsa) -> SyncRunner {
        SyncRunner::new(test_db(), SyncOptions::default()).with_psa(Arc::new(psa))
    }

    #[tokio::test]
    async fn test_departments_and_requesters_are_mirrored() {
        let mut runner = runner(FakePsa {
            departments: vec![
                department(1, "Acme", Some("100001")),
                department(2, "Globex", Some("100002")),
                department(3, "Initech", None),
            ],
            requesters: vec![
                requester(10, "pat@acme.example", vec![1, 2]),
                requester(11, "lone@nowhere.example", vec![3, 99]),
            ],
        });

        let job = runner.run(SyncSource::Companies, SyncMode::Full).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let stats = job.stats().unwrap();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.created, 4);
        assert_eq!(stats.skipped, 1, "requester without a mapped department");

        let db = runner.db();
        assert_eq!(db.list_companies().unwrap().len(), 3);
        assert_eq!(db.company_contacts("100001").unwrap().len(), 1);
        assert_eq!(db.company_contacts("100002").unwrap().len(), 1);

        // A second pass writes nothing.
        let again = runner.run(SyncSource::Companies, SyncMode::Full).await.unwrap();
        let stats = again.stats().unwrap();
        assert_eq!(stats.created + stats.updated, 0);
        assert_eq!(stats.unchanged, 4);
    }

    #[tokio::test]
    async fn test_requesters_sharing_email_are_stored_separately() {
        let mut alice = requester(10, "shared@acme.example", vec![1]);
        alice.first_name = Some("Alice".into());
        let mut bob = requester(11, "shared@acme.example", vec![1]);
        bob.first_name = Some("Bob".into());
        let mut runner = runner(FakePsa {
            departments: vec![department(1, "Acme", Some("100001"))],
            requesters: vec![alice, bob],
        });

        let first = runner.run(SyncSource::Companies, SyncMode::Full).await.unwrap();
        let stats = first.stats().unwrap();
        assert_eq!((stats.created, stats.updated), (3, 0));

        let contacts = runner.db().company_contacts("100001").unwrap();
        let mut ids: Vec<Option<i64>> = contacts.iter().map(|c| c.record.external_id).collect();
        ids.sort();
        assert_eq!(ids, vec![Some(10), Some(11)]);

        let again = runner.run(SyncSource::Companies, SyncMode::Full).await.unwrap();
        let stats = again.stats().unwrap();
        assert_eq!((stats.created, stats.updated, stats.unchanged), (0, 0, 3));
    }

    #[tokio::test]
    async fn test_account_number_backfilled_on_existing_company() {
        let mut runner = runner(FakePsa {
            departments: vec![department(3, "Initech", None)],
            requesters: Vec::new(),
        });
        runner.run(SyncSource::Companies, SyncMode::Full).await.unwrap();
        assert_eq!(runner.db().list_companies().unwrap()[0].record.account_number, None);

        let mut runner = runner.with_psa(Arc::new(FakePsa {
            departments: vec![department(3, "Initech", Some("100003"))],
            requesters: Vec::new(),
        }));
        let job = runner.run(SyncSource::Companies, SyncMode::Full).await.unwrap();
        assert_eq!(job.stats().unwrap().updated, 1);

        let companies = runner.db().list_companies().unwrap();
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].record.account_number.as_deref(), Some("100003"));
    }
}
