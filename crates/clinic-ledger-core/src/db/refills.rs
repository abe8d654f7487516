//! Refill queue database operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{bad_enum, get_time, now_db_time, to_db_time, Database, DbResult};
use crate::models::{RefillEntry, RefillStatus};

const REFILL_COLUMNS: &str = "id, clinic_id, patient_id, prescription_ref, interval_days, due_at, \
                              remaining_refills, status, approved_by, cancel_reason, previous_id, \
                              created_at, updated_at";

fn refill_from_row(row: &Row<'_>) -> rusqlite::Result<RefillEntry> {
    let status: String = row.get(7)?;
    Ok(RefillEntry {
        id: row.get(0)?,
        clinic_id: row.get(1)?,
        patient_id: row.get(2)?,
        prescription_ref: row.get(3)?,
        interval_days: row.get(4)?,
        due_at: get_time(row, 5)?,
        remaining_refills: row.get(6)?,
        status: RefillStatus::parse(&status).ok_or_else(|| bad_enum(7, &status))?,
        approved_by: row.get(8)?,
        cancel_reason: row.get(9)?,
        previous_id: row.get(10)?,
        created_at: get_time(row, 11)?,
        updated_at: get_time(row, 12)?,
    })
}

impl Database {
    pub fn insert_refill(&self, entry: &RefillEntry) -> DbResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO refill_queue ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                REFILL_COLUMNS
            ),
            params![
                entry.id,
                entry.clinic_id,
                entry.patient_id,
                entry.prescription_ref,
                entry.interval_days,
                to_db_time(&entry.due_at),
                entry.remaining_refills,
                entry.status.as_str(),
                entry.approved_by,
                entry.cancel_reason,
                entry.previous_id,
                to_db_time(&entry.created_at),
                to_db_time(&entry.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_refill(&self, id: &str) -> DbResult<Option<RefillEntry>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM refill_queue WHERE id = ?", REFILL_COLUMNS),
                [id],
                refill_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Entries of a clinic in one status, earliest due first.
    pub fn refills_by_status(&self, clinic_id: &str, status: RefillStatus) -> DbResult<Vec<RefillEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM refill_queue WHERE clinic_id = ?1 AND status = ?2 ORDER BY due_at, id",
            REFILL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![clinic_id, status.as_str()], refill_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Move every scheduled entry due by `now` to pending payment.
    pub fn promote_due_refills(&self, now: &DateTime<Utc>) -> DbResult<usize> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE refill_queue SET status = 'pending_payment', updated_at = ?2
            WHERE status = 'scheduled' AND due_at <= ?1
            "#,
            params![to_db_time(now), now_db_time()],
        )?;
        Ok(rows_affected)
    }

    /// Compare-and-set a refill's status along with its approval or cancel note.
    /// Returns false if the entry was not in `from`.
    pub fn update_refill_status(
        &self,
        id: &str,
        from: RefillStatus,
        to: RefillStatus,
        approved_by: Option<&str>,
        cancel_reason: Option<&str>,
    ) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE refill_queue
            SET status = ?3,
                approved_by = COALESCE(?4, approved_by),
                cancel_reason = COALESCE(?5, cancel_reason),
                updated_at = ?6
            WHERE id = ?1 AND status = ?2
            "#,
            params![id, from.as_str(), to.as_str(), approved_by, cancel_reason, now_db_time()],
        )?;
        Ok(rows_affected > 0)
    }
}
