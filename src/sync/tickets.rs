//! Tickets source: closed PSA tickets with their conversation thread and
//! time entries, stored as one denormalized row per ticket.

use std::collections::HashSet;

use crate::db::{CodexDb, ConversationEntry, DbTicket};
use crate::error::SyncError;
use crate::psa::{
    priority_name, status_name, strip_html, total_hours, Conversation, RemoteTicket,
    TicketingSource, TimeEntry,
};
use crate::reconcile::SkipReason;
use crate::remote::{Paginator, RemoteError};

use super::runner::{merge_record, RunContext};

/// A ticket with its sub-resources, or the reason it will not be stored.
enum Fetched {
    Ready {
        ticket: RemoteTicket,
        conversations: Vec<Conversation>,
        time_entries: Vec<TimeEntry>,
    },
    Skipped {
        ticket_id: i64,
        reason: SkipReason,
    },
}

pub async fn sync_tickets(
    psa: &dyn TicketingSource,
    db: &mut CodexDb,
    ctx: &mut RunContext,
) -> Result<(), SyncError> {
    let since = ctx.window_start;
    let mut seen = HashSet::new();
    let mut pages = Paginator::new("/tickets/filter");

    while let Some(page) = pages
        .next_page(|cursor| psa.closed_tickets_page(since, cursor))
        .await?
    {
        let count = page.len();
        let mut fetched = Vec::with_capacity(count);
        for ticket in page {
            if !ticket.is_closed() {
                fetched.push(Fetched::Skipped {
                    ticket_id: ticket.id,
                    reason: SkipReason::NotClosed {
                        status_id: ticket.status,
                    },
                });
                continue;
            }
            seen.insert(ticket.id);
            fetched.push(match fetch_details(psa, ticket.id).await {
                Ok((conversations, time_entries)) => Fetched::Ready {
                    ticket,
                    conversations,
                    time_entries,
                },
                Err(e) => Fetched::Skipped {
                    ticket_id: ticket.id,
                    reason: SkipReason::SubResourceFailed {
                        detail: e.to_string(),
                    },
                },
            });
        }

        store_tickets(db, ctx, fetched)?;
        ctx.batch.commit(db)?;
        log::info!(
            "Sync tickets: page {} ({} tickets)",
            pages.pages_fetched(),
            count
        );
    }

    if ctx.is_full() {
        prune_unseen(db, ctx, &seen)?;
    }
    Ok(())
}

async fn fetch_details(
    psa: &dyn TicketingSource,
    ticket_id: i64,
) -> Result<(Vec<Conversation>, Vec<TimeEntry>), RemoteError> {
    let conversations = psa.ticket_conversations(ticket_id).await?;
    let time_entries = psa.ticket_time_entries(ticket_id).await?;
    Ok((conversations, time_entries))
}

fn store_tickets(db: &CodexDb, ctx: &mut RunContext, fetched: Vec<Fetched>) -> Result<(), SyncError> {
    let accounts = db.department_account_map()?;
    for item in fetched {
        ctx.stats.processed += 1;
        match item {
            Fetched::Skipped { ticket_id, reason } => {
                ctx.skip(&format!("ticket #{}", ticket_id), &reason);
            }
            Fetched::Ready {
                ticket,
                conversations,
                time_entries,
            } => {
                let account = ticket
                    .department_id
                    .and_then(|dept| accounts.get(&dept).cloned());
                if account.is_none() {
                    log::info!(
                        "Ticket #{}: no account number for department {:?}, stored unlinked",
                        ticket.id,
                        ticket.department_id
                    );
                }
                let row = build_ticket(&ticket, account, &conversations, &time_entries);
                merge_record(db, ctx, &row)?;
            }
        }
    }
    Ok(())
}

/// Delete stored tickets inside the run's window that the source no longer
/// returns as closed.
fn prune_unseen(db: &CodexDb, ctx: &mut RunContext, seen: &HashSet<i64>) -> Result<(), SyncError> {
    let since = ctx.window_start.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let stale: Vec<i64> = db
        .ticket_ids_updated_since(&since)?
        .into_iter()
        .filter(|(_, ticket_id)| !seen.contains(ticket_id))
        .map(|(id, _)| id)
        .collect();
    if stale.is_empty() {
        return Ok(());
    }
    let removed = ctx.batch.write(db, |db| db.delete_entities::<DbTicket>(&stale))?;
    ctx.stats.pruned += removed as u64;
    log::info!("Sync tickets: pruned {} ticket(s) no longer closed upstream", removed);
    Ok(())
}

/// Denormalized ticket row.
pub fn build_ticket(
    ticket: &RemoteTicket,
    account_number: Option<String>,
    conversations: &[Conversation],
    time_entries: &[TimeEntry],
) -> DbTicket {
    let (public, private) = split_conversations(conversations);
    let priority_id = ticket.priority.unwrap_or(2);
    let requester = ticket.requester.clone().unwrap_or_default();
    let stats = ticket.stats.clone().unwrap_or_default();
    let description = ticket
        .description_text
        .as_deref()
        .or(ticket.description.as_deref())
        .map(strip_html)
        .filter(|text| !text.is_empty());

    DbTicket {
        ticket_id: ticket.id,
        company_account_number: account_number,
        subject: ticket
            .subject
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "No Subject".to_string()),
        description_text: description,
        status: status_name(ticket.status)
            .map(str::to_string)
            .or_else(|| ticket.status_name.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        status_id: ticket.status,
        priority: priority_name(priority_id)
            .map(str::to_string)
            .or_else(|| ticket.priority_name.clone())
            .unwrap_or_else(|| "Medium".to_string()),
        priority_id,
        ticket_type: ticket.ticket_type.clone().or_else(|| Some("Incident".to_string())),
        requester_id: ticket.requester_id,
        requester_name: requester.name,
        requester_email: requester.email,
        responder_id: ticket.responder_id,
        group_id: ticket.group_id,
        source_created_at: ticket.created_at.clone(),
        source_updated_at: ticket.updated_at.clone(),
        closed_at: ticket.closed_at(),
        due_by: ticket.due_by.clone(),
        fr_due_by: ticket.fr_due_by.clone(),
        first_responded_at: stats.first_responded_at,
        agent_responded_at: stats.agent_responded_at,
        total_hours_spent: total_hours(time_entries),
        conversations: public,
        notes: private,
    }
}

/// Public entries and private notes, each in source order. Repeated entry
/// ids keep their first occurrence.
pub fn split_conversations(conversations: &[Conversation]) -> (Vec<ConversationEntry>, Vec<ConversationEntry>) {
    let mut seen = HashSet::new();
    let mut public = Vec::new();
    let mut private = Vec::new();
    for conv in conversations {
        if !seen.insert(conv.id) {
            continue;
        }
        let html = conv.body.clone().or_else(|| conv.body_text.clone());
        let entry = ConversationEntry {
            id: conv.id,
            author: conv.from_email.clone(),
            user_id: conv.user_id,
            to_emails: conv.to_emails.clone().unwrap_or_default(),
            created_at: conv.created_at.clone(),
            body: html.as_deref().map(strip_html).unwrap_or_default(),
            body_html: conv.body.clone(),
            incoming: conv.incoming,
            private: conv.private,
        };
        if conv.private {
            private.push(entry);
        } else {
            public.push(entry);
        }
    }
    (public, private)
}
