//! Assets source: RMM sites refresh the site links, devices become assets
//! owned by the company their site links to.

use std::collections::HashSet;

use crate::db::{CodexDb, DbAsset, DbSiteLink};
use crate::error::SyncError;
use crate::reconcile::SkipReason;
use crate::remote::Paginator;
use crate::rmm::{account_number_variable, Device, MonitoringSource, Site};

use super::runner::{merge_record, RunContext};

pub async fn sync_assets(
    rmm: &dyn MonitoringSource,
    db: &mut CodexDb,
    ctx: &mut RunContext,
) -> Result<(), SyncError> {
    let mut sites = Paginator::new("/account/sites");
    while let Some(page) = sites.next_page(|cursor| rmm.sites_page(cursor)).await? {
        for site in &page {
            match rmm.site_variables(&site.uid).await {
                Ok(variables) => {
                    if let Some(account) = account_number_variable(&variables) {
                        refresh_site_link(db, ctx, site, &account)?;
                    }
                }
                // The previous link, if any, stays in place.
                Err(e) => log::warn!("Sync assets: variables of site {} unavailable: {}", site.uid, e),
            }
        }
        ctx.batch.commit(db)?;
    }

    let mut seen = HashSet::new();
    let mut devices = Paginator::new("/account/devices");
    while let Some(page) = devices.next_page(|cursor| rmm.devices_page(cursor)).await? {
        store_devices(db, ctx, &page, &mut seen)?;
        ctx.batch.commit(db)?;
        log::info!(
            "Sync assets: device page {} ({} records)",
            devices.pages_fetched(),
            page.len()
        );
    }

    if ctx.is_full() {
        prune_unseen(db, ctx, &seen)?;
    }
    Ok(())
}

fn refresh_site_link(db: &CodexDb, ctx: &mut RunContext, site: &Site, account: &str) -> Result<(), SyncError> {
    if db.account_for_site(&site.uid)?.as_deref() == Some(account) {
        return Ok(());
    }
    let link = DbSiteLink {
        site_uid: site.uid.clone(),
        site_name: site.name.clone(),
        company_account_number: account.to_string(),
        updated_at: ctx.synced_at.clone(),
    };
    ctx.batch.write(db, |db| db.upsert_site_link(&link))?;
    log::info!("Site {} linked to account {}", site.uid, account);
    Ok(())
}

fn store_devices(
    db: &CodexDb,
    ctx: &mut RunContext,
    page: &[Device],
    seen: &mut HashSet<String>,
) -> Result<(), SyncError> {
    let site_accounts = db.site_account_map()?;
    for device in page {
        ctx.stats.processed += 1;
        seen.insert(device.uid.clone());

        let site_uid = device.site_uid().unwrap_or_default();
        let Some(account) = site_accounts.get(site_uid) else {
            let reason = SkipReason::UnmappedSite {
                site_uid: site_uid.to_string(),
            };
            ctx.skip(&format!("device {}", device.uid), &reason);
            continue;
        };
        merge_record(db, ctx, &device.to_asset(account))?;
    }
    Ok(())
}

/// Delete assets whose device the source no longer lists.
fn prune_unseen(db: &CodexDb, ctx: &mut RunContext, seen: &HashSet<String>) -> Result<(), SyncError> {
    let stale: Vec<i64> = db
        .asset_device_uids()?
        .into_iter()
        .filter(|(_, uid)| !seen.contains(uid))
        .map(|(id, _)| id)
        .collect();
    if stale.is_empty() {
        return Ok(());
    }
    let removed = ctx.batch.write(db, |db| db.delete_entities::<DbAsset>(&stale))?;
    ctx.stats.pruned += removed as u64;
    log::info!("Sync assets: pruned {} asset(s) no longer in the RMM", removed);
    Ok(())
}
