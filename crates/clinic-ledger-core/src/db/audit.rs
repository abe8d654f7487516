//! Audit ledger database operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{get_time, to_db_time, Database, DbResult};
use crate::models::AuditEvent;

/// A stored ledger row, payload kept as the exact text that was hashed.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub sequence: i64,
    pub prev_hash: String,
    pub entry_hash: String,
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
}

/// A sealed snapshot of the chain head.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditCheckpoint {
    pub id: i64,
    pub sequence: i64,
    pub entry_hash: String,
    pub entry_count: i64,
    pub sealed_by: String,
    pub sealed_at: DateTime<Utc>,
}

const ROW_COLUMNS: &str = "seq, prev_hash, entry_hash, payload, recorded_at";

fn audit_row(row: &Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        sequence: row.get(0)?,
        prev_hash: row.get(1)?,
        entry_hash: row.get(2)?,
        payload: row.get(3)?,
        recorded_at: get_time(row, 4)?,
    })
}

impl Database {
    /// Append a ledger row. Index columns are copied out of the event.
    pub fn insert_audit_row(&self, row: &AuditRow, event: &AuditEvent) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO audit_log (
                seq, prev_hash, entry_hash, payload, clinic_id, actor_id, action,
                patient_id, phi_accessed, occurred_at, recorded_at, idempotency_key
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                row.sequence,
                row.prev_hash,
                row.entry_hash,
                row.payload,
                event.clinic_id,
                event.actor_id,
                event.action.as_str(),
                event.patient_id,
                event.phi_accessed,
                to_db_time(&event.occurred_at),
                to_db_time(&row.recorded_at),
                event.idempotency_key,
            ],
        )?;
        Ok(())
    }

    /// Latest (sequence, hash), or None for an empty ledger.
    pub fn get_audit_head(&self) -> DbResult<Option<(i64, String)>> {
        self.conn
            .query_row(
                "SELECT seq, entry_hash FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_audit_row(&self, sequence: i64) -> DbResult<Option<AuditRow>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM audit_log WHERE seq = ?", ROW_COLUMNS),
                [sequence],
                audit_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn find_audit_row_by_key(&self, idempotency_key: &str) -> DbResult<Option<AuditRow>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM audit_log WHERE idempotency_key = ?", ROW_COLUMNS),
                [idempotency_key],
                audit_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Rows with `from <= seq <= to`, in sequence order.
    pub fn audit_rows_in_range(&self, from: i64, to: i64) -> DbResult<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audit_log WHERE seq BETWEEN ?1 AND ?2 ORDER BY seq",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map(params![from, to], audit_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn audit_rows_for_patient(&self, patient_id: &str) -> DbResult<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audit_log WHERE patient_id = ? ORDER BY seq",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map([patient_id], audit_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn audit_rows_for_actor(&self, actor_id: &str) -> DbResult<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audit_log WHERE actor_id = ? ORDER BY seq",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map([actor_id], audit_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Rows whose event occurred in `[start, end)`.
    pub fn audit_rows_between(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> DbResult<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audit_log WHERE occurred_at >= ?1 AND occurred_at < ?2 ORDER BY seq",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map(params![to_db_time(start), to_db_time(end)], audit_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn audit_entry_count(&self) -> DbResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Entries at or below a sequence number.
    pub fn audit_entry_count_through(&self, sequence: i64) -> DbResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE seq <= ?",
            [sequence],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Persist a checkpoint and return its id.
    pub fn insert_audit_checkpoint(
        &self,
        sequence: i64,
        entry_hash: &str,
        entry_count: i64,
        sealed_by: &str,
        sealed_at: &DateTime<Utc>,
    ) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO audit_checkpoints (seq, entry_hash, entry_count, sealed_by, sealed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![sequence, entry_hash, entry_count, sealed_by, to_db_time(sealed_at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_audit_checkpoints(&self) -> DbResult<Vec<AuditCheckpoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, seq, entry_hash, entry_count, sealed_by, sealed_at
            FROM audit_checkpoints
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AuditCheckpoint {
                id: row.get(0)?,
                sequence: row.get(1)?,
                entry_hash: row.get(2)?,
                entry_count: row.get(3)?,
                sealed_by: row.get(4)?,
                sealed_at: get_time(row, 5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditAction;

    fn insert(db: &Database, seq: i64, event: &AuditEvent) {
        let row = AuditRow {
            sequence: seq,
            prev_hash: format!("prev-{}", seq),
            entry_hash: format!("hash-{}", seq),
            payload: serde_json::to_string(event).unwrap(),
            recorded_at: Utc::now(),
        };
        db.insert_audit_row(&row, event).unwrap();
    }

    #[test]
    fn test_head_and_range() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_audit_head().unwrap().is_none());

        let event = AuditEvent::new("user-1", AuditAction::Login, "session");
        for seq in 1..=3 {
            insert(&db, seq, &event);
        }

        assert_eq!(db.get_audit_head().unwrap(), Some((3, "hash-3".to_string())));
        assert_eq!(db.audit_entry_count().unwrap(), 3);
        let rows = db.audit_rows_in_range(2, 3).unwrap();
        assert_eq!(rows.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_query_by_patient_actor_and_key() {
        let db = Database::open_in_memory().unwrap();
        let read = AuditEvent::new("nurse-1", AuditAction::Read, "patient").for_patient("c1", "p1");
        let mut login = AuditEvent::new("nurse-2", AuditAction::Login, "session");
        login.idempotency_key = Some("login-42".into());
        insert(&db, 1, &read);
        insert(&db, 2, &login);

        assert_eq!(db.audit_rows_for_patient("p1").unwrap().len(), 1);
        assert_eq!(db.audit_rows_for_actor("nurse-2").unwrap()[0].sequence, 2);
        assert_eq!(db.find_audit_row_by_key("login-42").unwrap().unwrap().sequence, 2);
        assert!(db.find_audit_row_by_key("missing").unwrap().is_none());
    }

    #[test]
    fn test_checkpoints_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_audit_checkpoint(5, "abc", 5, "auditor", &Utc::now())
            .unwrap();
        let checkpoints = db.list_audit_checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].id, id);
        assert_eq!(checkpoints[0].sealed_by, "auditor");
    }
}
