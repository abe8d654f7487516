//! Compliance export with full audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLedger, AuditResult, CheckpointReport, IntegrityReport};
use crate::db::Database;
use crate::models::{AuditAction, AuditEntry};

/// Audit ledger export for an auditor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditComplianceExport {
    pub metadata: ComplianceMetadata,
    /// Verification of the whole chain at export time
    pub integrity: IntegrityReport,
    pub checkpoints: CheckpointReport,
    pub entries: Vec<AuditEntry>,
}

/// Compliance export metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceMetadata {
    pub format_version: String,
    pub exported_at: String,
    pub hash_algorithm: String,
    /// Head of the chain at export time
    pub head_sequence: i64,
    pub head_hash: String,
    /// Entries in the whole ledger, not only this export
    pub entry_count: i64,
    /// Exporting system identifier
    pub system_id: Option<String>,
    /// Time window, for range exports
    pub range_start: Option<String>,
    pub range_end: Option<String>,
}

impl AuditComplianceExport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Whether the chain and every checkpoint verified.
    pub fn is_verified(&self) -> bool {
        self.integrity.valid && self.checkpoints.is_valid()
    }
}

/// One access to a patient's PHI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disclosure {
    pub sequence: i64,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: String,
    pub actor_role: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub entry_hash: String,
}

/// Accounting of disclosures for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisclosureAccounting {
    pub patient_id: String,
    pub generated_at: String,
    pub disclosures: Vec<Disclosure>,
}

/// Compliance exporter.
pub struct AuditExporter<'a> {
    db: &'a Database,
    ledger: AuditLedger<'a>,
    system_id: Option<String>,
}

impl<'a> AuditExporter<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            ledger: AuditLedger::new(db),
            system_id: None,
        }
    }

    /// Set the system identifier for exports.
    pub fn with_system_id(mut self, system_id: String) -> Self {
        self.system_id = Some(system_id);
        self
    }

    /// Export every entry.
    pub fn export_all(&self) -> AuditResult<AuditComplianceExport> {
        let entries = match self.ledger.head()? {
            Some(head) => self.ledger.entries_in_range(1, head.sequence)?,
            None => Vec::new(),
        };
        self.build(entries, None)
    }

    /// Export entries whose event occurred in `[start, end)`.
    pub fn export_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AuditResult<AuditComplianceExport> {
        let entries = self.ledger.entries_between(start, end)?;
        self.build(entries, Some((start, end)))
    }

    /// Every PHI access recorded for a patient, oldest first.
    pub fn accounting_of_disclosures(&self, patient_id: &str) -> AuditResult<DisclosureAccounting> {
        let disclosures = self
            .ledger
            .entries_for_patient(patient_id)?
            .into_iter()
            .filter(|entry| entry.event.phi_accessed)
            .map(|entry| Disclosure {
                sequence: entry.sequence,
                occurred_at: entry.event.occurred_at,
                actor_id: entry.event.actor_id,
                actor_role: entry.event.actor_role,
                action: entry.event.action,
                resource_type: entry.event.resource_type,
                resource_id: entry.event.resource_id,
                entry_hash: entry.entry_hash,
            })
            .collect();

        Ok(DisclosureAccounting {
            patient_id: patient_id.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            disclosures,
        })
    }

    fn build(
        &self,
        entries: Vec<AuditEntry>,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> AuditResult<AuditComplianceExport> {
        let head = self.ledger.head()?;
        let integrity = self.ledger.verify_integrity()?;
        let checkpoints = self.ledger.verify_checkpoints()?;

        Ok(AuditComplianceExport {
            metadata: ComplianceMetadata {
                format_version: "1.0".to_string(),
                exported_at: Utc::now().to_rfc3339(),
                hash_algorithm: "SHA-256".to_string(),
                head_sequence: head.as_ref().map_or(0, |h| h.sequence),
                head_hash: head.map(|h| h.entry_hash).unwrap_or_default(),
                entry_count: self.db.audit_entry_count()?,
                system_id: self.system_id.clone(),
                range_start: range.map(|(start, _)| start.to_rfc3339()),
                range_end: range.map(|(_, end)| end.to_rfc3339()),
            },
            integrity,
            checkpoints,
            entries,
        })
    }
}
