//! Sealed chain heads.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::AuditCheckpoint;

use super::{AuditError, AuditLedger, AuditResult};

/// Why a checkpoint no longer matches the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMismatch {
    /// The sealed entry no longer exists
    Truncated,
    /// The sealed entry exists with a different hash
    Rewritten,
    /// Entries up to the sealed head were removed or added
    CountChanged,
}

/// One checkpoint that failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFailure {
    pub checkpoint_id: i64,
    pub sequence: i64,
    pub mismatch: CheckpointMismatch,
}

/// Outcome of checking every checkpoint against the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub checkpoints_checked: usize,
    pub failures: Vec<CheckpointFailure>,
}

impl CheckpointReport {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<'a> AuditLedger<'a> {
    /// Seal the current head.
    pub fn seal_checkpoint(&self, sealed_by: &str) -> AuditResult<AuditCheckpoint> {
        let db = self.db();
        let tx = db.begin_immediate()?;
        let (sequence, entry_hash) = db.get_audit_head()?.ok_or(AuditError::EmptyLedger)?;
        let entry_count = db.audit_entry_count()?;
        let sealed_at = Utc::now();
        let id = db.insert_audit_checkpoint(sequence, &entry_hash, entry_count, sealed_by, &sealed_at)?;
        tx.commit()?;

        info!(checkpoint_id = id, sequence, "Sealed audit checkpoint");
        Ok(AuditCheckpoint {
            id,
            sequence,
            entry_hash,
            entry_count,
            sealed_by: sealed_by.to_string(),
            sealed_at,
        })
    }

    pub fn checkpoints(&self) -> AuditResult<Vec<AuditCheckpoint>> {
        Ok(self.db().list_audit_checkpoints()?)
    }

    /// Check that every sealed head is still present with the same hash, and
    /// that the entries up to it are as many as when it was sealed.
    pub fn verify_checkpoints(&self) -> AuditResult<CheckpointReport> {
        let mut report = CheckpointReport::default();
        for checkpoint in self.db().list_audit_checkpoints()? {
            report.checkpoints_checked += 1;
            let mismatch = match self.db().get_audit_row(checkpoint.sequence)? {
                None => Some(CheckpointMismatch::Truncated),
                Some(row) if row.entry_hash != checkpoint.entry_hash => {
                    Some(CheckpointMismatch::Rewritten)
                }
                Some(_) => {
                    let count = self.db().audit_entry_count_through(checkpoint.sequence)?;
                    (count != checkpoint.entry_count).then_some(CheckpointMismatch::CountChanged)
                }
            };
            if let Some(mismatch) = mismatch {
                warn!(
                    checkpoint_id = checkpoint.id,
                    sequence = checkpoint.sequence,
                    ?mismatch,
                    "Audit checkpoint mismatch"
                );
                report.failures.push(CheckpointFailure {
                    checkpoint_id: checkpoint.id,
                    sequence: checkpoint.sequence,
                    mismatch,
                });
            }
        }
        Ok(report)
    }
}
