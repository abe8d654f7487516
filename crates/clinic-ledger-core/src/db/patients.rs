//! Clinic, patient and counter database operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{get_opt_time, get_time, now_db_time, to_db_time, Database, DbResult};
use crate::models::{Clinic, Patient};

const PATIENT_COLUMNS: &str = "id, clinic_id, patient_number, display_id, first_name, last_name, \
                               email, created_at, deleted_at";

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        id: row.get(0)?,
        clinic_id: row.get(1)?,
        patient_number: row.get(2)?,
        display_id: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        email: row.get(6)?,
        created_at: get_time(row, 7)?,
        deleted_at: get_opt_time(row, 8)?,
    })
}

impl Database {
    /// Insert a new clinic.
    pub fn insert_clinic(&self, clinic: &Clinic) -> DbResult<()> {
        self.conn.execute(
            "INSERT INTO clinics (id, name, patient_prefix, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                clinic.id,
                clinic.name,
                clinic.patient_prefix,
                to_db_time(&clinic.created_at)
            ],
        )?;
        Ok(())
    }

    /// Get a clinic by ID.
    pub fn get_clinic(&self, id: &str) -> DbResult<Option<Clinic>> {
        self.conn
            .query_row(
                "SELECT id, name, patient_prefix, created_at FROM clinics WHERE id = ?",
                [id],
                |row| {
                    Ok(Clinic {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        patient_prefix: row.get(2)?,
                        created_at: get_time(row, 3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a patient record as-is.
    pub fn insert_patient(&self, patient: &Patient) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO patients (
                id, clinic_id, patient_number, display_id, first_name, last_name,
                email, created_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                patient.id,
                patient.clinic_id,
                patient.patient_number,
                patient.display_id,
                patient.first_name,
                patient.last_name,
                patient.email,
                to_db_time(&patient.created_at),
                patient.deleted_at.as_ref().map(to_db_time),
            ],
        )?;
        Ok(())
    }

    /// Get a patient by ID (including soft-deleted ones).
    pub fn get_patient(&self, id: &str) -> DbResult<Option<Patient>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM patients WHERE id = ?", PATIENT_COLUMNS),
                [id],
                patient_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Get a patient by clinic-scoped number.
    pub fn get_patient_by_number(&self, clinic_id: &str, number: i64) -> DbResult<Option<Patient>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM patients WHERE clinic_id = ? AND patient_number = ?",
                    PATIENT_COLUMNS
                ),
                params![clinic_id, number],
                patient_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// List a clinic's patients in number order (unnumbered last).
    pub fn list_patients(&self, clinic_id: &str, include_deleted: bool) -> DbResult<Vec<Patient>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {}
            FROM patients
            WHERE clinic_id = ?1 AND (?2 OR deleted_at IS NULL)
            ORDER BY patient_number IS NULL, patient_number, created_at, id
            "#,
            PATIENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![clinic_id, include_deleted], patient_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Soft-delete a patient. Returns false if missing or already deleted.
    pub fn soft_delete_patient(&self, id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now_db_time()],
        )?;
        Ok(rows_affected > 0)
    }

    /// Highest number assigned in a clinic (0 if none).
    pub fn max_patient_number(&self, clinic_id: &str) -> DbResult<i64> {
        let max: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(patient_number), 0) FROM patients WHERE clinic_id = ?",
            [clinic_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Patients of a clinic without a number, oldest first.
    pub fn unnumbered_patient_ids(&self, clinic_id: &str) -> DbResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id FROM patients
            WHERE clinic_id = ? AND patient_number IS NULL
            ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt.query_map([clinic_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Assign a number to an unnumbered patient. Returns false if already numbered.
    pub fn assign_patient_number(&self, id: &str, number: i64, display_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE patients SET patient_number = ?2, display_id = ?3
            WHERE id = ?1 AND patient_number IS NULL
            "#,
            params![id, number, display_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Atomically advance a clinic's counter and return the new value.
    ///
    /// The new value is one past the larger of the stored counter and the
    /// highest number already present, so rows numbered outside the counter
    /// (imports, manual fixes) are never handed out twice.
    pub fn bump_counter(&self, clinic_id: &str) -> DbResult<i64> {
        let value: i64 = self.conn.query_row(
            r#"
            INSERT INTO clinic_counters (clinic_id, last_value, updated_at)
            VALUES (
                ?1,
                (SELECT COALESCE(MAX(patient_number), 0) FROM patients WHERE clinic_id = ?1) + 1,
                ?2
            )
            ON CONFLICT(clinic_id) DO UPDATE SET
                last_value = MAX(
                    clinic_counters.last_value,
                    (SELECT COALESCE(MAX(patient_number), 0) FROM patients
                     WHERE clinic_id = excluded.clinic_id)
                ) + 1,
                updated_at = excluded.updated_at
            RETURNING last_value
            "#,
            params![clinic_id, now_db_time()],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Current counter value, if the clinic has allocated before.
    pub fn get_counter(&self, clinic_id: &str) -> DbResult<Option<i64>> {
        self.conn
            .query_row(
                "SELECT last_value FROM clinic_counters WHERE clinic_id = ?",
                [clinic_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Raise the counter to at least `value`; never lowers it.
    pub fn raise_counter(&self, clinic_id: &str, value: i64) -> DbResult<i64> {
        let stored: i64 = self.conn.query_row(
            r#"
            INSERT INTO clinic_counters (clinic_id, last_value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(clinic_id) DO UPDATE SET
                last_value = MAX(clinic_counters.last_value, excluded.last_value),
                updated_at = excluded.updated_at
            RETURNING last_value
            "#,
            params![clinic_id, value, now_db_time()],
            |row| row.get(0),
        )?;
        Ok(stored)
    }
}
