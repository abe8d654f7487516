//! Clinic-scoped sequential patient numbers.
//!
//! Numbers run 1, 2, 3, ... independently per clinic and are never reused.
//! Every allocation goes through an upsert on `clinic_counters` inside a
//! `BEGIN IMMEDIATE` transaction, so concurrent connections on one database
//! file serialize on SQLite's write lock and never hand out the same number.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NumberingConfig;
use crate::db::{Database, DbError};
use crate::models::{Clinic, NewPatient, Patient};

/// Numbering errors.
#[derive(Error, Debug)]
pub enum NumberingError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Unknown clinic: {0}")]
    UnknownClinic(String),
}

impl From<rusqlite::Error> for NumberingError {
    fn from(e: rusqlite::Error) -> Self {
        NumberingError::Database(DbError::Sqlite(e))
    }
}

pub type NumberingResult<T> = Result<T, NumberingError>;

/// Outcome of numbering a clinic's legacy (unnumbered) patients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub clinic_id: String,
    /// Patients that received a number in this run
    pub assigned: usize,
    /// First number handed out, if any
    pub first_number: Option<i64>,
    /// Highest number in the clinic after the run
    pub last_number: i64,
}

/// Difference between the stored counter and the numbers actually in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDrift {
    pub clinic_id: String,
    /// Counter before reconciliation (0 if never allocated)
    pub counter: i64,
    /// Highest assigned patient number
    pub max_assigned: i64,
    /// Whether the counter was raised to `max_assigned`
    pub repaired: bool,
}

impl CounterDrift {
    /// Counter minus highest number; negative means the counter lagged.
    pub fn drift(&self) -> i64 {
        self.counter - self.max_assigned
    }
}

/// Render a display id such as `PT-000042`.
pub fn format_display_id(prefix: &str, number: i64, width: usize) -> String {
    format!("{}-{:0width$}", prefix, number, width = width)
}

/// Allocates patient numbers for clinics in one database.
pub struct PatientNumberAllocator<'a> {
    db: &'a Database,
    config: NumberingConfig,
}

impl<'a> PatientNumberAllocator<'a> {
    pub fn new(db: &'a Database, config: NumberingConfig) -> Self {
        Self { db, config }
    }

    fn clinic(&self, clinic_id: &str) -> NumberingResult<Clinic> {
        self.db
            .get_clinic(clinic_id)?
            .ok_or_else(|| NumberingError::UnknownClinic(clinic_id.to_string()))
    }

    fn display_id(&self, clinic: &Clinic, number: i64) -> String {
        let prefix = if clinic.patient_prefix.is_empty() {
            &self.config.default_prefix
        } else {
            &clinic.patient_prefix
        };
        format_display_id(prefix, number, self.config.width)
    }

    /// Reserve the next number for a clinic.
    ///
    /// The number is consumed even if the caller never uses it; use
    /// [`create_patient`](Self::create_patient) to allocate and insert atomically.
    pub fn allocate(&self, clinic_id: &str) -> NumberingResult<i64> {
        let tx = self.db.begin_immediate()?;
        self.clinic(clinic_id)?;
        let number = self.db.bump_counter(clinic_id)?;
        tx.commit()?;

        debug!(clinic_id, number, "Allocated patient number");
        Ok(number)
    }

    /// Allocate a number and insert the patient in one transaction.
    ///
    /// If the insert fails the counter bump rolls back with it.
    pub fn create_patient(&self, new: NewPatient) -> NumberingResult<Patient> {
        let tx = self.db.begin_immediate()?;
        let clinic = self.clinic(&new.clinic_id)?;
        let number = self.db.bump_counter(&clinic.id)?;
        let patient = new.into_patient(Some(number), Some(self.display_id(&clinic, number)));
        self.db.insert_patient(&patient)?;
        tx.commit()?;

        info!(
            clinic_id = %patient.clinic_id,
            patient_id = %patient.id,
            number,
            "Created patient"
        );
        Ok(patient)
    }

    /// Number every unnumbered patient of a clinic, oldest first.
    ///
    /// Numbering continues after the highest number in use; the counter ends
    /// at the last number assigned. Running it again assigns nothing.
    pub fn backfill(&self, clinic_id: &str) -> NumberingResult<BackfillReport> {
        let tx = self.db.begin_immediate()?;
        let clinic = self.clinic(clinic_id)?;

        let counter = self.db.get_counter(clinic_id)?.unwrap_or(0);
        let mut next = counter.max(self.db.max_patient_number(clinic_id)?) + 1;
        let mut first_number = None;
        let mut assigned = 0;

        for patient_id in self.db.unnumbered_patient_ids(clinic_id)? {
            if self
                .db
                .assign_patient_number(&patient_id, next, &self.display_id(&clinic, next))?
            {
                first_number.get_or_insert(next);
                assigned += 1;
                next += 1;
            }
        }

        let last_number = next - 1;
        if last_number > 0 {
            self.db.raise_counter(clinic_id, last_number)?;
        }
        tx.commit()?;

        info!(clinic_id, assigned, last_number, "Backfilled patient numbers");
        Ok(BackfillReport {
            clinic_id: clinic_id.to_string(),
            assigned,
            first_number,
            last_number,
        })
    }

    /// Compare the counter with the numbers in use and repair a lagging counter.
    ///
    /// A counter ahead of the highest number is left alone; skipped numbers
    /// are not reused.
    pub fn reconcile(&self, clinic_id: &str) -> NumberingResult<CounterDrift> {
        let tx = self.db.begin_immediate()?;
        self.clinic(clinic_id)?;

        let counter = self.db.get_counter(clinic_id)?.unwrap_or(0);
        let max_assigned = self.db.max_patient_number(clinic_id)?;
        let repaired = counter < max_assigned;
        if repaired {
            self.db.raise_counter(clinic_id, max_assigned)?;
        }
        tx.commit()?;

        let drift = CounterDrift {
            clinic_id: clinic_id.to_string(),
            counter,
            max_assigned,
            repaired,
        };
        if drift.drift() != 0 {
            warn!(clinic_id, counter, max_assigned, repaired, "Patient counter drift");
        }
        Ok(drift)
    }
}
