//! Patient numbering under concurrent writers.

mod common;

use std::collections::BTreeSet;
use std::thread;

use clinic_ledger_core::config::NumberingConfig;
use clinic_ledger_core::db::Database;
use clinic_ledger_core::models::{Clinic, NewPatient};
use clinic_ledger_core::numbering::PatientNumberAllocator;

const WRITERS: usize = 4;
const PER_WRITER: usize = 15;

#[test]
fn test_concurrent_allocation_has_no_gaps_or_duplicates() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clinic.db");

    let clinic = Clinic::new("Northside".into(), "NS".into());
    Database::open(&path).unwrap().insert_clinic(&clinic).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = path.clone();
            let clinic_id = clinic.id.clone();
            thread::spawn(move || {
                // Each writer has its own connection, as separate processes would
                let db = Database::open(&path).unwrap();
                let allocator = PatientNumberAllocator::new(&db, NumberingConfig::default());
                (0..PER_WRITER)
                    .map(|i| {
                        let new = NewPatient::new(&clinic_id, &format!("W{}", w), &format!("P{}", i));
                        allocator.create_patient(new).unwrap().patient_number.unwrap()
                    })
                    .collect::<Vec<i64>>()
            })
        })
        .collect();

    let numbers: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: BTreeSet<i64> = numbers.iter().copied().collect();
    let total = (WRITERS * PER_WRITER) as i64;

    assert_eq!(numbers.len(), unique.len(), "duplicate patient numbers");
    assert_eq!(unique, (1..=total).collect::<BTreeSet<i64>>());

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get_counter(&clinic.id).unwrap(), Some(total));
}

#[test]
fn test_backfill_races_with_new_patients() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clinic.db");
    let db = Database::open(&path).unwrap();
    let clinic = Clinic::new("Westside".into(), "WS".into());
    db.insert_clinic(&clinic).unwrap();

    // Imported patients without numbers
    for i in 0..20 {
        let patient = NewPatient::new(&clinic.id, "Imported", &format!("{}", i)).into_patient(None, None);
        db.insert_patient(&patient).unwrap();
    }

    let backfill = {
        let path = path.clone();
        let clinic_id = clinic.id.clone();
        thread::spawn(move || {
            let db = Database::open(&path).unwrap();
            PatientNumberAllocator::new(&db, NumberingConfig::default())
                .backfill(&clinic_id)
                .unwrap()
        })
    };
    let creator = {
        let path = path.clone();
        let clinic_id = clinic.id.clone();
        thread::spawn(move || {
            let db = Database::open(&path).unwrap();
            let allocator = PatientNumberAllocator::new(&db, NumberingConfig::default());
            for i in 0..10 {
                allocator
                    .create_patient(NewPatient::new(&clinic_id, "New", &format!("{}", i)))
                    .unwrap();
            }
        })
    };
    let report = backfill.join().unwrap();
    creator.join().unwrap();
    assert_eq!(report.assigned, 20);

    let numbers: BTreeSet<i64> = db
        .list_patients(&clinic.id, true)
        .unwrap()
        .iter()
        .map(|p| p.patient_number.unwrap())
        .collect();
    assert_eq!(numbers, (1..=30).collect::<BTreeSet<i64>>());
}
