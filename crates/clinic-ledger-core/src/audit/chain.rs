//! Recording, querying and verifying the chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{AuditRow, Database};
use crate::models::{AuditEntry, AuditEvent};

use super::{compute_entry_hash, AuditResult, GENESIS_HASH};

/// Result of recording an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReceipt {
    pub sequence: i64,
    pub entry_hash: String,
    pub recorded_at: DateTime<Utc>,
    /// True if an entry with the same idempotency key already existed
    pub duplicate: bool,
}

/// Latest entry of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub sequence: i64,
    pub entry_hash: String,
}

/// How the chain is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Stored hash does not match the recomputed hash
    HashMismatch,
    /// `prev_hash` does not match the previous entry's hash
    LinkMismatch,
    /// A sequence number is missing
    SequenceGap,
    /// The first entry does not link to the genesis hash
    MissingGenesis,
}

/// First point at which verification failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub sequence: i64,
    pub kind: BreakKind,
}

/// Outcome of verifying all or part of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub entries_checked: usize,
    pub from_sequence: i64,
    pub to_sequence: i64,
    pub first_break: Option<ChainBreak>,
}

/// Audit ledger manager.
pub struct AuditLedger<'a> {
    db: &'a Database,
}

impl<'a> AuditLedger<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub(super) fn db(&self) -> &Database {
        self.db
    }

    /// Append an event to the chain.
    ///
    /// Reading the head and inserting the new entry happen in one immediate
    /// transaction, so concurrent writers cannot fork the chain.
    pub fn record(&self, event: &AuditEvent) -> AuditResult<AuditReceipt> {
        let tx = self.db.begin_immediate()?;

        if let Some(key) = &event.idempotency_key {
            if let Some(existing) = self.db.find_audit_row_by_key(key)? {
                debug!(sequence = existing.sequence, "Audit idempotency key already recorded");
                return Ok(AuditReceipt {
                    sequence: existing.sequence,
                    entry_hash: existing.entry_hash,
                    recorded_at: existing.recorded_at,
                    duplicate: true,
                });
            }
        }

        let (prev_sequence, prev_hash) = self
            .db
            .get_audit_head()?
            .unwrap_or((0, GENESIS_HASH.to_string()));
        let sequence = prev_sequence + 1;
        let payload = serde_json::to_string(event)?;
        let entry_hash = compute_entry_hash(sequence, &prev_hash, &payload)?;

        let row = AuditRow {
            sequence,
            prev_hash,
            entry_hash,
            payload,
            recorded_at: Utc::now(),
        };
        self.db.insert_audit_row(&row, event)?;
        tx.commit()?;

        debug!(
            sequence,
            action = event.action.as_str(),
            resource_type = %event.resource_type,
            "Recorded audit entry"
        );
        Ok(AuditReceipt {
            sequence,
            entry_hash: row.entry_hash,
            recorded_at: row.recorded_at,
            duplicate: false,
        })
    }

    pub fn head(&self) -> AuditResult<Option<ChainHead>> {
        Ok(self
            .db
            .get_audit_head()?
            .map(|(sequence, entry_hash)| ChainHead { sequence, entry_hash }))
    }

    pub fn get_entry(&self, sequence: i64) -> AuditResult<Option<AuditEntry>> {
        self.db.get_audit_row(sequence)?.map(to_entry).transpose()
    }

    /// Entries `from_seq..=to_seq` in chain order.
    pub fn entries_in_range(&self, from_seq: i64, to_seq: i64) -> AuditResult<Vec<AuditEntry>> {
        self.db
            .audit_rows_in_range(from_seq, to_seq)?
            .into_iter()
            .map(to_entry)
            .collect()
    }

    /// Every entry that touched a patient, in chain order.
    pub fn entries_for_patient(&self, patient_id: &str) -> AuditResult<Vec<AuditEntry>> {
        self.db
            .audit_rows_for_patient(patient_id)?
            .into_iter()
            .map(to_entry)
            .collect()
    }

    pub fn entries_for_actor(&self, actor_id: &str) -> AuditResult<Vec<AuditEntry>> {
        self.db
            .audit_rows_for_actor(actor_id)?
            .into_iter()
            .map(to_entry)
            .collect()
    }

    /// Entries whose event occurred in `[start, end)`.
    pub fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AuditResult<Vec<AuditEntry>> {
        self.db
            .audit_rows_between(&start, &end)?
            .into_iter()
            .map(to_entry)
            .collect()
    }

    /// Verify the whole chain.
    pub fn verify_integrity(&self) -> AuditResult<IntegrityReport> {
        match self.db.get_audit_head()? {
            Some((last, _)) => self.verify_range(1, last),
            None => Ok(IntegrityReport {
                valid: true,
                entries_checked: 0,
                from_sequence: 0,
                to_sequence: 0,
                first_break: None,
            }),
        }
    }

    /// Verify entries `from_seq..=to_seq`, linking the first to its predecessor.
    pub fn verify_range(&self, from_seq: i64, to_seq: i64) -> AuditResult<IntegrityReport> {
        let from_seq = from_seq.max(1);
        let mut report = IntegrityReport {
            valid: true,
            entries_checked: 0,
            from_sequence: from_seq,
            to_sequence: to_seq,
            first_break: None,
        };
        if to_seq < from_seq {
            return Ok(report);
        }

        let mut expected_prev = if from_seq == 1 {
            Some(GENESIS_HASH.to_string())
        } else {
            self.db.get_audit_row(from_seq - 1)?.map(|row| row.entry_hash)
        };
        let mut expected_seq = from_seq;

        for row in self.db.audit_rows_in_range(from_seq, to_seq)? {
            report.entries_checked += 1;
            if let Some(kind) = check_row(&row, expected_seq, expected_prev.as_deref()) {
                report.valid = false;
                report.first_break = Some(ChainBreak {
                    sequence: expected_seq.min(row.sequence),
                    kind,
                });
                break;
            }
            expected_prev = Some(row.entry_hash);
            expected_seq += 1;
        }

        if report.valid && expected_seq <= to_seq {
            // Rows missing at the tail of the requested range
            report.valid = false;
            report.first_break = Some(ChainBreak {
                sequence: expected_seq,
                kind: BreakKind::SequenceGap,
            });
        }

        if let Some(found) = &report.first_break {
            warn!(
                sequence = found.sequence,
                kind = ?found.kind,
                "Audit chain integrity failure"
            );
        }
        Ok(report)
    }
}

/// Check one row against what the chain expects at this position.
fn check_row(row: &AuditRow, expected_seq: i64, expected_prev: Option<&str>) -> Option<BreakKind> {
    if row.sequence != expected_seq {
        return Some(BreakKind::SequenceGap);
    }
    if row.sequence == 1 && row.prev_hash != GENESIS_HASH {
        return Some(BreakKind::MissingGenesis);
    }
    match expected_prev {
        Some(prev) if prev == row.prev_hash => {}
        Some(_) => return Some(BreakKind::LinkMismatch),
        // Predecessor row is gone
        None => return Some(BreakKind::SequenceGap),
    }
    match compute_entry_hash(row.sequence, &row.prev_hash, &row.payload) {
        Ok(hash) if hash == row.entry_hash => None,
        _ => Some(BreakKind::HashMismatch),
    }
}

fn to_entry(row: AuditRow) -> AuditResult<AuditEntry> {
    let event: AuditEvent = serde_json::from_str(&row.payload)?;
    Ok(AuditEntry {
        sequence: row.sequence,
        prev_hash: row.prev_hash,
        entry_hash: row.entry_hash,
        event,
        recorded_at: row.recorded_at,
    })
}
