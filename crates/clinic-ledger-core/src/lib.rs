//! Clinic Ledger Core Library
//!
//! Commission calculation, HIPAA audit ledger and clinic-scoped patient
//! numbering for a multi-tenant telehealth platform.
//!
//! # Architecture
//!
//! ```text
//!  Billing events      Prescriptions      Timesheets
//!        │                   │                 │
//!        └──────────┬────────┴─────────────────┘
//!                   ▼
//!        [processed_inputs: exactly once]
//!                   │
//!          plan in force at occurred_at
//!                   │
//!                   ▼
//!          Commission events ──hold──▶ approved ──▶ payout
//!                   ▲
//!          refunds / chargebacks (reverse or claw back)
//!
//!  Every PHI access ──▶ audit_log (hash chain) ──▶ checkpoints ──▶ compliance export
//! ```
//!
//! # Modules
//!
//! - [`db`]: SQLite store; integrity rules live in the schema
//! - [`models`]: Domain types
//! - [`audit`]: Hash-chained, append-only audit ledger
//! - [`numbering`]: Per-clinic sequential patient numbers
//! - [`commission`]: Compensation plans and the commission engine
//! - [`fees`]: Platform fee waivers
//! - [`refills`]: Refill queue
//! - [`export`]: Payout and compliance exports
//! - [`config`]: YAML configuration

pub mod audit;
pub mod commission;
pub mod config;
pub mod db;
pub mod export;
pub mod fees;
pub mod models;
pub mod numbering;
pub mod refills;

// Re-export commonly used types
pub use audit::{AuditLedger, AuditReceipt, IntegrityReport};
pub use commission::{CommissionEngine, ProcessingOutcome};
pub use config::LedgerConfig;
pub use db::Database;
pub use fees::FeeEngine;
pub use numbering::PatientNumberAllocator;
pub use refills::RefillQueue;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use audit::{AuditError, CheckpointReport};
use commission::CommissionError;
use db::{AuditCheckpoint, DbError};
use export::{AuditComplianceExport, AuditExporter, DisclosureAccounting, PayoutExport};
use fees::FeeError;
use models::{
    AuditAction, AuditEvent, BillingEvent, Clinic, CommissionBalance, CommissionEvent,
    CompensationPlan, FeeAssessment, FeeWaiverRule, HoursEntry, NewPatient, NewRefill, Patient,
    PayoutStatement, PrescriptionEvent, Recipient, RefillEntry, RefillStatus,
};
use numbering::{BackfillReport, CounterDrift, NumberingError};
use refills::{RefillApproval, RefillError};

// =========================================================================
// Facade Error Type
// =========================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Numbering error: {0}")]
    Numbering(#[from] NumberingError),

    #[error("Commission error: {0}")]
    Commission(#[from] CommissionError),

    #[error("Fee error: {0}")]
    Fee(#[from] FeeError),

    #[error("Refill error: {0}")]
    Refill(#[from] RefillError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for LedgerError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        LedgerError::LockPoisoned(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// =========================================================================
// Main API Object
// =========================================================================

/// Thread-safe handle over one ledger database.
///
/// Operations that touch PHI record an audit entry as they run.
#[derive(Clone)]
pub struct ClinicLedger {
    db: Arc<Mutex<Database>>,
    config: Arc<LedgerConfig>,
}

impl ClinicLedger {
    /// Open or create a ledger at the given path.
    pub fn open<P: AsRef<Path>>(path: P, config: LedgerConfig) -> LedgerResult<Self> {
        Ok(Self::from_database(Database::open(path)?, config))
    }

    /// In-memory ledger (for testing).
    pub fn open_in_memory(config: LedgerConfig) -> LedgerResult<Self> {
        Ok(Self::from_database(Database::open_in_memory()?, config))
    }

    fn from_database(db: Database, config: LedgerConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // =========================================================================
    // Clinics and Patients
    // =========================================================================

    pub fn add_clinic(&self, name: &str, patient_prefix: &str) -> LedgerResult<Clinic> {
        let db = self.db.lock()?;
        let clinic = Clinic::new(name.to_string(), patient_prefix.to_string());
        db.insert_clinic(&clinic)?;
        info!(clinic_id = %clinic.id, "Added clinic");
        Ok(clinic)
    }

    /// Create a numbered patient. Nothing persists unless the audit entry does.
    pub fn create_patient(&self, actor_id: &str, new: NewPatient) -> LedgerResult<Patient> {
        let db = self.db.lock()?;
        let tx = db.begin_immediate()?;
        let patient = PatientNumberAllocator::new(&db, self.config.numbering.clone()).create_patient(new)?;

        let mut event = AuditEvent::new(actor_id, AuditAction::Create, "patient")
            .for_patient(&patient.clinic_id, &patient.id);
        event.details = json!({ "patient_number": patient.patient_number });
        AuditLedger::new(&db).record(&event)?;
        tx.commit().map_err(DbError::from)?;
        Ok(patient)
    }

    /// Read a patient. Only an existing record counts as a disclosure.
    pub fn get_patient(&self, actor_id: &str, patient_id: &str) -> LedgerResult<Option<Patient>> {
        let db = self.db.lock()?;
        let patient = db.get_patient(patient_id)?;
        if let Some(p) = &patient {
            let event = AuditEvent::new(actor_id, AuditAction::Read, "patient").for_patient(&p.clinic_id, &p.id);
            AuditLedger::new(&db).record(&event)?;
        }
        Ok(patient)
    }

    /// Soft-delete a patient. Returns false if it was already deleted or unknown.
    pub fn delete_patient(&self, actor_id: &str, patient_id: &str) -> LedgerResult<bool> {
        let db = self.db.lock()?;
        let tx = db.begin_immediate()?;
        let Some(patient) = db.get_patient(patient_id)? else {
            return Ok(false);
        };
        let deleted = db.soft_delete_patient(patient_id)?;
        if deleted {
            let event = AuditEvent::new(actor_id, AuditAction::Delete, "patient")
                .for_patient(&patient.clinic_id, &patient.id);
            AuditLedger::new(&db).record(&event)?;
        }
        tx.commit().map_err(DbError::from)?;
        Ok(deleted)
    }

    pub fn backfill_patient_numbers(&self, clinic_id: &str) -> LedgerResult<BackfillReport> {
        let db = self.db.lock()?;
        Ok(PatientNumberAllocator::new(&db, self.config.numbering.clone()).backfill(clinic_id)?)
    }

    pub fn reconcile_patient_counter(&self, clinic_id: &str) -> LedgerResult<CounterDrift> {
        let db = self.db.lock()?;
        Ok(PatientNumberAllocator::new(&db, self.config.numbering.clone()).reconcile(clinic_id)?)
    }

    // =========================================================================
    // Audit Ledger
    // =========================================================================

    pub fn record_audit(&self, event: &AuditEvent) -> LedgerResult<AuditReceipt> {
        let db = self.db.lock()?;
        Ok(AuditLedger::new(&db).record(event)?)
    }

    pub fn verify_audit_chain(&self) -> LedgerResult<IntegrityReport> {
        let db = self.db.lock()?;
        Ok(AuditLedger::new(&db).verify_integrity()?)
    }

    pub fn seal_audit_checkpoint(&self, sealed_by: &str) -> LedgerResult<AuditCheckpoint> {
        let db = self.db.lock()?;
        Ok(AuditLedger::new(&db).seal_checkpoint(sealed_by)?)
    }

    pub fn verify_audit_checkpoints(&self) -> LedgerResult<CheckpointReport> {
        let db = self.db.lock()?;
        Ok(AuditLedger::new(&db).verify_checkpoints()?)
    }

    /// Export the whole ledger. The export itself is recorded first.
    pub fn export_compliance(&self, actor_id: &str) -> LedgerResult<AuditComplianceExport> {
        let db = self.db.lock()?;
        let mut event = AuditEvent::new(actor_id, AuditAction::Export, "audit_log");
        event.phi_accessed = true;
        AuditLedger::new(&db).record(&event)?;
        Ok(self.exporter(&db).export_all()?)
    }

    /// Export entries whose event occurred in `[start, end)`.
    pub fn export_compliance_range(
        &self,
        actor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<AuditComplianceExport> {
        let db = self.db.lock()?;
        let mut event = AuditEvent::new(actor_id, AuditAction::Export, "audit_log");
        event.phi_accessed = true;
        event.details = json!({ "start": start.to_rfc3339(), "end": end.to_rfc3339() });
        AuditLedger::new(&db).record(&event)?;
        Ok(self.exporter(&db).export_date_range(start, end)?)
    }

    pub fn accounting_of_disclosures(&self, patient_id: &str) -> LedgerResult<DisclosureAccounting> {
        let db = self.db.lock()?;
        Ok(self.exporter(&db).accounting_of_disclosures(patient_id)?)
    }

    fn exporter<'a>(&self, db: &'a Database) -> AuditExporter<'a> {
        AuditExporter::new(db).with_system_id(self.config.audit.system_id.clone())
    }

    // =========================================================================
    // Commissions
    // =========================================================================

    pub fn publish_plan(&self, plan: &CompensationPlan) -> LedgerResult<()> {
        let db = self.db.lock()?;
        Ok(self.commissions(&db).publish_plan(plan)?)
    }

    /// Process a billing event and record it in the audit ledger.
    ///
    /// Commission writes and the audit entry commit together. The entry is
    /// keyed by the event id, so a retried delivery leaves exactly one.
    pub fn process_billing_event(&self, event: &BillingEvent) -> LedgerResult<ProcessingOutcome> {
        let db = self.db.lock()?;
        let tx = db.begin_immediate()?;
        let outcome = self.commissions(&db).process_billing_event(event)?;

        let mut audit = AuditEvent::new("system", AuditAction::PaymentProcessed, "billing_event");
        audit.clinic_id = Some(event.clinic_id.clone());
        audit.resource_id = Some(event.event_id.clone());
        audit.patient_id = Some(event.patient_id.clone());
        audit.occurred_at = event.occurred_at;
        audit.details = json!({ "kind": event.kind.as_str(), "amount_cents": event.amount_cents });
        audit.idempotency_key = Some(format!("billing:{}", event.event_id));
        AuditLedger::new(&db).record(&audit)?;
        tx.commit().map_err(DbError::from)?;
        Ok(outcome)
    }

    /// Credit the prescribing provider and assess the platform fee.
    pub fn process_prescription(
        &self,
        event: &PrescriptionEvent,
    ) -> LedgerResult<(ProcessingOutcome, FeeAssessment)> {
        let db = self.db.lock()?;
        let tx = db.begin_immediate()?;
        let outcome = self.commissions(&db).process_prescription(event)?;
        let assessment = FeeEngine::new(&db, self.config.fees.clone()).assess_script(event)?;

        let mut audit = AuditEvent::new(&event.provider_id, AuditAction::PrescriptionSent, "prescription")
            .for_patient(&event.clinic_id, &event.patient_id);
        audit.actor_role = "provider".to_string();
        audit.resource_id = Some(event.script_id.clone());
        audit.occurred_at = event.occurred_at;
        audit.idempotency_key = Some(format!("script:{}", event.script_id));
        AuditLedger::new(&db).record(&audit)?;
        tx.commit().map_err(DbError::from)?;
        Ok((outcome, assessment))
    }

    pub fn record_hours(&self, entry: &HoursEntry) -> LedgerResult<ProcessingOutcome> {
        let db = self.db.lock()?;
        Ok(self.commissions(&db).record_hours(entry)?)
    }

    pub fn release_matured(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let db = self.db.lock()?;
        Ok(self.commissions(&db).release_matured(now)?)
    }

    pub fn create_payout(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
        period_end: DateTime<Utc>,
    ) -> LedgerResult<Option<PayoutStatement>> {
        let db = self.db.lock()?;
        Ok(self.commissions(&db).create_payout(clinic_id, recipient, period_end)?)
    }

    pub fn commission_balance(&self, clinic_id: &str, recipient: &Recipient) -> LedgerResult<CommissionBalance> {
        let db = self.db.lock()?;
        Ok(self.commissions(&db).balance(clinic_id, recipient)?)
    }

    /// Every commission event of a recipient, oldest first.
    pub fn commission_events(&self, clinic_id: &str, recipient: &Recipient) -> LedgerResult<Vec<CommissionEvent>> {
        let db = self.db.lock()?;
        Ok(self.commissions(&db).events_for_recipient(clinic_id, recipient)?)
    }

    pub fn export_payout(&self, payout_id: &str) -> LedgerResult<PayoutExport> {
        let db = self.db.lock()?;
        Ok(export::PayoutExporter::new(&db).export(payout_id)?)
    }

    fn commissions<'a>(&self, db: &'a Database) -> CommissionEngine<'a> {
        CommissionEngine::new(db, self.config.commissions.clone())
    }

    // =========================================================================
    // Fees
    // =========================================================================

    pub fn add_fee_rule(&self, rule: &FeeWaiverRule) -> LedgerResult<()> {
        let db = self.db.lock()?;
        Ok(FeeEngine::new(&db, self.config.fees.clone()).add_rule(rule)?)
    }

    // =========================================================================
    // Refill Queue
    // =========================================================================

    pub fn schedule_refill(&self, new: NewRefill) -> LedgerResult<RefillEntry> {
        let db = self.db.lock()?;
        Ok(RefillQueue::new(&db).schedule(new)?)
    }

    pub fn promote_due_refills(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let db = self.db.lock()?;
        Ok(RefillQueue::new(&db).promote_due(now)?)
    }

    pub fn record_refill_payment(&self, refill_id: &str) -> LedgerResult<RefillEntry> {
        let db = self.db.lock()?;
        Ok(RefillQueue::new(&db).record_payment(refill_id)?)
    }

    pub fn approve_refill(&self, refill_id: &str, provider_id: &str) -> LedgerResult<RefillApproval> {
        let db = self.db.lock()?;
        Ok(RefillQueue::new(&db).approve(refill_id, provider_id)?)
    }

    pub fn cancel_refill(&self, refill_id: &str, reason: &str) -> LedgerResult<RefillEntry> {
        let db = self.db.lock()?;
        Ok(RefillQueue::new(&db).cancel(refill_id, reason)?)
    }

    pub fn list_refills(&self, clinic_id: &str, status: RefillStatus) -> LedgerResult<Vec<RefillEntry>> {
        let db = self.db.lock()?;
        Ok(RefillQueue::new(&db).list_by_status(clinic_id, status)?)
    }
}
