//! Refill, audit and numbering operations through the ledger facade.

mod common;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use clinic_ledger_core::models::{
    AuditAction, AuditEvent, CommissionComponent, CommissionStatus, CompensationPlan, HoursEntry,
    NewPatient, NewRefill, PlanTerms, Recipient, RefillStatus, SalesRepTerms,
};
use clinic_ledger_core::refills::RefillError;
use clinic_ledger_core::{ClinicLedger, LedgerConfig, LedgerError};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

fn ledger() -> ClinicLedger {
    common::init_test_tracing();
    ClinicLedger::open_in_memory(LedgerConfig::default()).unwrap()
}

#[test]
fn test_refill_lifecycle() {
    let ledger = ledger();
    let clinic = ledger.add_clinic("Northside", "NS").unwrap();
    let refill = ledger
        .schedule_refill(NewRefill {
            clinic_id: clinic.id.clone(),
            patient_id: "p1".into(),
            prescription_ref: "rx-1".into(),
            interval_days: 28,
            due_at: start(),
            remaining_refills: 1,
        })
        .unwrap();

    // Not due yet
    assert_eq!(ledger.promote_due_refills(start() - Duration::days(1)).unwrap(), 0);
    assert_eq!(ledger.promote_due_refills(start()).unwrap(), 1);
    assert_eq!(
        ledger.list_refills(&clinic.id, RefillStatus::PendingPayment).unwrap().len(),
        1
    );

    // Approval before payment is out of order
    assert!(matches!(
        ledger.approve_refill(&refill.id, "dr-1"),
        Err(LedgerError::Refill(RefillError::InvalidTransition { .. }))
    ));

    ledger.record_refill_payment(&refill.id).unwrap();
    let approval = ledger.approve_refill(&refill.id, "dr-1").unwrap();
    assert_eq!(approval.approved.status, RefillStatus::Approved);
    assert_eq!(approval.approved.approved_by.as_deref(), Some("dr-1"));

    let next = approval.next.unwrap();
    assert_eq!(next.due_at, start() + Duration::days(28));
    assert_eq!(next.remaining_refills, 0);
    assert_eq!(next.previous_id.as_deref(), Some(refill.id.as_str()));

    let cancelled = ledger.cancel_refill(&next.id, "patient paused treatment").unwrap();
    assert_eq!(cancelled.status, RefillStatus::Cancelled);
    assert!(ledger.cancel_refill(&next.id, "again").is_err());
    assert!(ledger
        .list_refills(&clinic.id, RefillStatus::Scheduled)
        .unwrap()
        .is_empty());
}

#[test]
fn test_checkpoints_and_range_export() {
    let ledger = ledger();
    for day in 0..4 {
        let mut event = AuditEvent::new("dr-1", AuditAction::Read, "patient").for_patient("c1", "p1");
        event.occurred_at = start() + Duration::days(day);
        ledger.record_audit(&event).unwrap();
    }
    let checkpoint = ledger.seal_audit_checkpoint("compliance-officer").unwrap();
    assert_eq!(checkpoint.sequence, 4);
    assert!(ledger.verify_audit_checkpoints().unwrap().is_valid());

    let export = ledger
        .export_compliance_range("auditor-1", start() + Duration::days(1), start() + Duration::days(3))
        .unwrap();
    let sequences: Vec<i64> = export.entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![2, 3]);
    // The export is itself on the chain
    assert_eq!(export.metadata.entry_count, 5);
    assert!(export.is_verified());
}

#[test]
fn test_backfill_and_reconcile_on_clean_clinic() {
    let ledger = ledger();
    let clinic = ledger.add_clinic("Westside", "WS").unwrap();
    for i in 0..3 {
        ledger
            .create_patient("front-desk", NewPatient::new(&clinic.id, "Pat", &format!("Doe{}", i)))
            .unwrap();
    }

    let report = ledger.backfill_patient_numbers(&clinic.id).unwrap();
    assert_eq!(report.assigned, 0);
    assert_eq!(report.last_number, 3);

    let drift = ledger.reconcile_patient_counter(&clinic.id).unwrap();
    assert_eq!(drift.counter, 3);
    assert_eq!(drift.max_assigned, 3);
    assert!(!drift.repaired);
}

#[test]
fn test_hours_credit_listed_for_rep() {
    let ledger = ledger();
    let clinic = ledger.add_clinic("Southside", "SS").unwrap();
    ledger
        .publish_plan(&CompensationPlan::new(
            &clinic.id,
            "rep-1",
            PlanTerms::SalesRep(SalesRepTerms {
                hourly_rate_cents: Some(3_000),
                ..Default::default()
            }),
            start(),
        ))
        .unwrap();

    let entry = HoursEntry {
        entry_id: "ts-1".into(),
        clinic_id: clinic.id.clone(),
        sales_rep_id: "rep-1".into(),
        work_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
        minutes: 90,
    };
    ledger.record_hours(&entry).unwrap();
    assert!(ledger.record_hours(&entry).unwrap().is_duplicate());

    let events = ledger
        .commission_events(&clinic.id, &Recipient::sales_rep("rep-1"))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].component, CommissionComponent::Hourly);
    assert_eq!(events[0].amount_cents, 4_500);
    assert_eq!(events[0].status, CommissionStatus::Approved);
}
