//! Audit ledger integration and property tests.

mod common;

use std::thread;

use chrono::{Duration, TimeZone, Utc};
use clinic_ledger_core::audit::{AuditLedger, BreakKind, CheckpointMismatch};
use clinic_ledger_core::db::Database;
use clinic_ledger_core::models::{AuditAction, AuditEvent};
use proptest::prelude::*;

fn record_n(db: &Database, n: usize) {
    let ledger = AuditLedger::new(db);
    let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    for i in 0..n {
        let mut event = AuditEvent::new(&format!("dr-{}", i % 3), AuditAction::Read, "patient")
            .for_patient("c1", &format!("p{}", i % 4));
        event.occurred_at = base + Duration::minutes(i as i64);
        ledger.record(&event).unwrap();
    }
}

fn allow_tampering(db: &Database) {
    db.conn()
        .execute_batch("DROP TRIGGER audit_log_no_update; DROP TRIGGER audit_log_no_delete;")
        .unwrap();
}

#[test]
fn test_ledger_rejects_update_and_delete() {
    let db = Database::open_in_memory().unwrap();
    record_n(&db, 2);

    assert!(db
        .conn()
        .execute("UPDATE audit_log SET payload = '{}' WHERE seq = 1", [])
        .is_err());
    assert!(db.conn().execute("DELETE FROM audit_log WHERE seq = 2", []).is_err());
    assert!(AuditLedger::new(&db).verify_integrity().unwrap().valid);
}

#[test]
fn test_checkpoint_detects_truncation() {
    common::init_test_tracing();
    let db = Database::open_in_memory().unwrap();
    record_n(&db, 5);
    let ledger = AuditLedger::new(&db);
    ledger.seal_checkpoint("auditor").unwrap();

    allow_tampering(&db);
    db.conn().execute("DELETE FROM audit_log WHERE seq = 5", []).unwrap();

    // The shortened chain is internally consistent...
    assert!(ledger.verify_integrity().unwrap().valid);
    // ...but no longer reaches the sealed head
    let report = ledger.verify_checkpoints().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].mismatch, CheckpointMismatch::Truncated);
}

#[test]
fn test_reopened_file_ledger_continues_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    {
        let db = Database::open(&path).unwrap();
        record_n(&db, 3);
    }
    let db = Database::open(&path).unwrap();
    record_n(&db, 2);

    let report = AuditLedger::new(&db).verify_integrity().unwrap();
    assert!(report.valid);
    assert_eq!(report.entries_checked, 5);
}

#[test]
fn test_concurrent_writers_keep_one_chain() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 12;

    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    Database::open(&path).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = path.clone();
            thread::spawn(move || {
                let db = Database::open(&path).unwrap();
                let ledger = AuditLedger::new(&db);
                for i in 0..PER_WRITER {
                    let event = AuditEvent::new(&format!("dr-{}", w), AuditAction::Read, "patient")
                        .for_patient("c1", &format!("p{}", i));
                    ledger.record(&event).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let ledger = AuditLedger::new(&db);
    let total = (WRITERS * PER_WRITER) as i64;
    let report = ledger.verify_integrity().unwrap();
    assert!(report.valid);
    assert_eq!(report.entries_checked, total as usize);

    let sequences: Vec<i64> = ledger
        .entries_in_range(1, total)
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, (1..=total).collect::<Vec<i64>>());
}

proptest! {
    /// Any untampered ledger verifies.
    #[test]
    fn prop_untampered_chain_is_valid(n in 1usize..25) {
        let db = Database::open_in_memory().unwrap();
        record_n(&db, n);
        let report = AuditLedger::new(&db).verify_integrity().unwrap();
        prop_assert!(report.valid);
        prop_assert_eq!(report.entries_checked, n);
    }

    /// Editing any entry's payload is reported at that entry.
    #[test]
    fn prop_payload_tamper_detected(n in 1usize..25, pick in any::<prop::sample::Index>()) {
        let db = Database::open_in_memory().unwrap();
        record_n(&db, n);
        let target = pick.index(n) as i64 + 1;

        allow_tampering(&db);
        db.conn()
            .execute(
                "UPDATE audit_log SET payload = replace(payload, '\"dr-', '\"xx-') WHERE seq = ?",
                [target],
            )
            .unwrap();

        let report = AuditLedger::new(&db).verify_integrity().unwrap();
        prop_assert!(!report.valid);
        let first_break = report.first_break.unwrap();
        prop_assert_eq!(first_break.sequence, target);
        prop_assert_eq!(first_break.kind, BreakKind::HashMismatch);
    }
}
