//! Account numbers: assigning them to PSA departments and pushing them to
//! RMM sites.
//!
//! A company's account number is the key every other entity links through.
//! Departments created in the PSA without one get a random six-digit number;
//! RMM sites get the number of the company whose name they contain.

use std::collections::HashSet;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;

use crate::db::{db_timestamp, CodexDb, DbSiteLink};
use crate::error::SyncError;
use crate::psa::{Department, TicketingSource};
use crate::remote::Paginator;
use crate::rmm::{account_number_variable, MonitoringSource, ACCOUNT_VARIABLE};
use crate::sync::WriteBatch;

const ACCOUNT_NUMBER_MIN: u32 = 100_000;
const ACCOUNT_NUMBER_MAX: u32 = 999_999;
const MAX_DRAWS: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub department_id: i64,
    pub name: String,
    pub account_number: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentReport {
    pub assigned: Vec<Assignment>,
    pub already_numbered: usize,
    /// Department id and error text for updates the PSA rejected.
    pub failed: Vec<(i64, String)>,
}

/// Draw a six-digit number not in `taken`.
pub fn generate_account_number(rng: &mut impl Rng, taken: &HashSet<String>) -> Option<String> {
    (0..MAX_DRAWS)
        .map(|_| rng.gen_range(ACCOUNT_NUMBER_MIN..=ACCOUNT_NUMBER_MAX).to_string())
        .find(|candidate| !taken.contains(candidate))
}

/// Give every PSA department without an account number a fresh one.
///
/// The numbers are written back to the PSA only; the next companies sync
/// mirrors them into the store.
pub async fn assign_account_numbers(psa: &dyn TicketingSource) -> Result<AssignmentReport, SyncError> {
    let mut departments: Vec<Department> = Vec::new();
    let mut pages = Paginator::new("/departments");
    while let Some(page) = pages.next_page(|cursor| psa.departments_page(cursor)).await? {
        departments.extend(page);
    }

    let mut taken: HashSet<String> = departments.iter().filter_map(Department::account_number).collect();
    let mut report = AssignmentReport {
        already_numbered: taken.len(),
        ..Default::default()
    };

    // Numbers are drawn up front so the rng never lives across an await.
    let mut planned = Vec::new();
    {
        let mut rng = rand::thread_rng();
        for department in departments.iter().filter(|d| d.account_number().is_none()) {
            let account_number = generate_account_number(&mut rng, &taken).ok_or_else(|| {
                SyncError::Invariant("account number space exhausted".to_string())
            })?;
            taken.insert(account_number.clone());
            planned.push(Assignment {
                department_id: department.id,
                name: department.name.clone(),
                account_number,
            });
        }
    }

    for assignment in planned {
        match psa
            .set_department_account_number(assignment.department_id, &assignment.account_number)
            .await
        {
            Ok(()) => {
                log::info!(
                    "Assigned account number {} to department {} ({})",
                    assignment.account_number,
                    assignment.department_id,
                    assignment.name
                );
                report.assigned.push(assignment);
            }
            Err(e) => {
                log::warn!("Department {}: account number not saved: {}", assignment.department_id, e);
                report.failed.push((assignment.department_id, e.to_string()));
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SitePush {
    pub site_uid: String,
    pub site_name: String,
    pub company: String,
    pub account_number: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SitePushReport {
    pub dry_run: bool,
    pub pushed: Vec<SitePush>,
    pub already_set: usize,
    /// Sites no company name matched.
    pub unmatched: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// The company whose name is the longest case-insensitive substring of
/// `site_name`.
pub fn match_company<'a>(site_name: &str, companies: &'a [(String, String)]) -> Option<&'a (String, String)> {
    let site = site_name.to_lowercase();
    companies
        .iter()
        .filter(|(name, _)| !name.trim().is_empty() && site.contains(&name.to_lowercase()))
        .max_by_key(|(name, _)| name.len())
}

/// Set the `AccountNumber` variable on RMM sites that lack one.
///
/// With `dry_run` nothing is written to either side; the report lists what
/// would have been pushed.
pub async fn push_site_account_numbers(
    rmm: &dyn MonitoringSource,
    db: &mut CodexDb,
    dry_run: bool,
) -> Result<SitePushReport, SyncError> {
    let companies: Vec<(String, String)> = db
        .list_companies()?
        .into_iter()
        .filter_map(|c| c.record.account_number.map(|account| (c.record.name, account)))
        .collect();
    let mut report = SitePushReport {
        dry_run,
        ..Default::default()
    };

    // One write per transaction: the variable is already set remotely, so the
    // link must not wait on later sites.
    let mut links = WriteBatch::new(1);
    let mut sites = Paginator::new("/account/sites");
    while let Some(page) = sites.next_page(|cursor| rmm.sites_page(cursor)).await? {
        for site in page {
            let variables = match rmm.site_variables(&site.uid).await {
                Ok(variables) => variables,
                Err(e) => {
                    report.failed.push((site.uid.clone(), e.to_string()));
                    continue;
                }
            };
            if account_number_variable(&variables).is_some() {
                report.already_set += 1;
                continue;
            }

            let site_name = site.name.clone().unwrap_or_default();
            let Some((company, account)) = match_company(&site_name, &companies) else {
                log::debug!("Site {} ({}) matches no company", site.uid, site_name);
                report.unmatched.push(site.uid.clone());
                continue;
            };
            let push = SitePush {
                site_uid: site.uid.clone(),
                site_name,
                company: company.clone(),
                account_number: account.clone(),
            };

            if !dry_run {
                if let Err(e) = rmm.set_site_variable(&site.uid, ACCOUNT_VARIABLE, account).await {
                    log::warn!("Site {}: account number not pushed: {}", site.uid, e);
                    report.failed.push((site.uid.clone(), e.to_string()));
                    continue;
                }
                let link = DbSiteLink {
                    site_uid: site.uid.clone(),
                    site_name: site.name.clone(),
                    company_account_number: account.clone(),
                    updated_at: db_timestamp(Utc::now()),
                };
                links.write(db, |db| db.upsert_site_link(&link))?;
                log::info!("Site {} linked to {} ({})", site.uid, company, account);
            }
            report.pushed.push(push);
        }
    }
    Ok(report)
}
