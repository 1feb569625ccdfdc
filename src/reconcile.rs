//! Match inbound records against local rows and decide how to merge them.
//!
//! Matching is key-based and ordered: the first key that finds any local
//! row decides the candidates. When several rows match, the most recently
//! synced one wins (then the highest id). Identity columns are set once and
//! only filled while empty; every other column is last-write-wins.

use rusqlite::types::Value;

use crate::db::entities::{Entity, MatchKey};
use crate::db::{CodexDb, DbAsset, DbCompany, DbContact, DbError, DbTicket, Stored};

/// Why a record was not written.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Matched a row that already holds the same values.
    Unchanged { existing_id: i64 },
    /// Device site has no account-number link.
    UnmappedSite { site_uid: String },
    /// None of the record's departments maps to a known company.
    UnmappedDepartment { department_ids: Vec<i64> },
    /// Ticket is not in a closed status.
    NotClosed { status_id: i64 },
    /// A per-record sub-resource could not be fetched.
    SubResourceFailed { detail: String },
}

impl SkipReason {
    /// Unchanged matches are counted separately from genuine skips.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged { .. })
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged { existing_id } => write!(f, "unchanged (row {})", existing_id),
            Self::UnmappedSite { site_uid } => write!(f, "site {} has no account number", site_uid),
            Self::UnmappedDepartment { department_ids } => {
                write!(f, "no company for department(s) {:?}", department_ids)
            }
            Self::NotClosed { status_id } => write!(f, "status {} is not closed", status_id),
            Self::SubResourceFailed { detail } => write!(f, "sub-resource fetch failed: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    Create,
    Update {
        existing_id: i64,
        changed_fields: Vec<(&'static str, Value)>,
    },
    Skip(SkipReason),
}

/// An entity that can be looked up by natural keys.
pub trait Matchable: Entity {
    /// Lookup keys in priority order.
    fn match_keys(&self) -> Vec<MatchKey>;
}

impl Matchable for DbCompany {
    fn match_keys(&self) -> Vec<MatchKey> {
        let mut keys = Vec::new();
        if let Some(account) = &self.account_number {
            keys.push(MatchKey::AccountNumber(account.clone()));
        }
        if let Some(dept) = self.external_id {
            keys.push(MatchKey::ExternalId(dept));
        }
        keys
    }
}

impl Matchable for DbContact {
    fn match_keys(&self) -> Vec<MatchKey> {
        // Email only identifies contacts the PSA gave no id; requesters may
        // share a mailbox.
        match (self.external_id, &self.email) {
            (Some(id), _) => vec![MatchKey::ExternalId(id)],
            (None, Some(email)) => vec![MatchKey::Email(email.clone())],
            (None, None) => Vec::new(),
        }
    }
}

impl Matchable for DbAsset {
    fn match_keys(&self) -> Vec<MatchKey> {
        vec![MatchKey::DeviceUid(self.external_id.clone())]
    }
}

impl Matchable for DbTicket {
    fn match_keys(&self) -> Vec<MatchKey> {
        vec![MatchKey::TicketId(self.ticket_id)]
    }
}

/// Rows matching the first key that matches anything.
pub fn lookup<E: Matchable>(db: &CodexDb, record: &E) -> Result<Vec<Stored<E>>, DbError> {
    for key in record.match_keys() {
        let found = db.find_matches::<E>(&key)?;
        if !found.is_empty() {
            return Ok(found);
        }
    }
    Ok(Vec::new())
}

/// Most recently synced candidate; ties go to the highest id.
pub fn pick_winner<E>(candidates: &[Stored<E>]) -> Option<&Stored<E>> {
    candidates
        .iter()
        .max_by(|a, b| a.synced_at.cmp(&b.synced_at).then(a.id.cmp(&b.id)))
}

/// Pure merge decision for `record` given its matching local rows.
pub fn decide<E: Entity>(record: &E, candidates: &[Stored<E>]) -> MergeDecision {
    let Some(existing) = pick_winner(candidates) else {
        return MergeDecision::Create;
    };
    if candidates.len() > 1 {
        log::debug!(
            "{}: {} rows match, merging into most recently synced row {}",
            E::TABLE,
            candidates.len(),
            existing.id
        );
    }

    let changed_fields = changed_fields(record, &existing.record);
    if changed_fields.is_empty() {
        MergeDecision::Skip(SkipReason::Unchanged {
            existing_id: existing.id,
        })
    } else {
        MergeDecision::Update {
            existing_id: existing.id,
            changed_fields,
        }
    }
}

/// Columns whose incoming value should replace the stored one.
pub fn changed_fields<E: Entity>(incoming: &E, existing: &E) -> Vec<(&'static str, Value)> {
    E::COLUMNS
        .iter()
        .zip(incoming.values())
        .zip(existing.values())
        .filter_map(|((column, new), old)| {
            if E::IDENTITY.contains(column) && (old != Value::Null || new == Value::Null) {
                return None;
            }
            (new != old).then_some((*column, new))
        })
        .collect()
}

/// Look up and decide in one step.
pub fn reconcile<E: Matchable>(db: &CodexDb, record: &E) -> Result<MergeDecision, DbError> {
    let candidates = lookup(db, record)?;
    Ok(decide(record, &candidates))
}

/// Write a decision. Returns the affected row id, or `None` for skips other
/// than `Unchanged`.
pub fn apply<E: Entity>(
    db: &CodexDb,
    record: &E,
    decision: &MergeDecision,
    synced_at: &str,
) -> Result<Option<i64>, DbError> {
    match decision {
        MergeDecision::Create => db.insert_entity(record, synced_at).map(Some),
        MergeDecision::Update {
            existing_id,
            changed_fields,
        } => {
            db.update_entity_fields::<E>(*existing_id, changed_fields, synced_at)?;
            Ok(Some(*existing_id))
        }
        MergeDecision::Skip(SkipReason::Unchanged { existing_id }) => Ok(Some(*existing_id)),
        MergeDecision::Skip(_) => Ok(None),
    }
}
