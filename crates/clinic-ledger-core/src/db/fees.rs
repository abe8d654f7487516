//! Fee waiver rule and assessment operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{get_opt_time, get_time, now_db_time, to_db_time, Database, DbResult};
use crate::models::{FeeAssessment, FeeWaiverRule, WaiverKind};

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<FeeWaiverRule> {
    let kind_json: String = row.get(2)?;
    let kind: WaiverKind = serde_json::from_str(&kind_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(FeeWaiverRule {
        id: row.get(0)?,
        clinic_id: row.get(1)?,
        kind,
        priority: row.get(3)?,
        effective_from: get_time(row, 4)?,
        effective_to: get_opt_time(row, 5)?,
    })
}

impl Database {
    pub fn insert_fee_rule(&self, rule: &FeeWaiverRule) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO fee_waiver_rules (
                id, clinic_id, kind, priority, effective_from, effective_to, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                rule.id,
                rule.clinic_id,
                serde_json::to_string(&rule.kind)?,
                rule.priority,
                to_db_time(&rule.effective_from),
                rule.effective_to.as_ref().map(to_db_time),
                now_db_time(),
            ],
        )?;
        Ok(())
    }

    /// Rules of a clinic in force at `at`, in evaluation order.
    pub fn fee_rules_in_force(
        &self,
        clinic_id: &str,
        at: &DateTime<Utc>,
    ) -> DbResult<Vec<FeeWaiverRule>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, clinic_id, kind, priority, effective_from, effective_to
            FROM fee_waiver_rules
            WHERE clinic_id = ?1 AND effective_from <= ?2
              AND (effective_to IS NULL OR ?2 < effective_to)
            ORDER BY priority, id
            "#,
        )?;
        let rows = stmt.query_map(params![clinic_id, to_db_time(at)], rule_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Insert an assessment. Returns false if the script was already assessed.
    pub fn insert_fee_assessment(&self, assessment: &FeeAssessment) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            INSERT INTO fee_assessments (
                script_id, clinic_id, gross_cents, waived_cents, net_cents, rule_id,
                occurred_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(script_id) DO NOTHING
            "#,
            params![
                assessment.script_id,
                assessment.clinic_id,
                assessment.gross_cents,
                assessment.waived_cents,
                assessment.net_cents,
                assessment.rule_id,
                to_db_time(&assessment.occurred_at),
                now_db_time(),
            ],
        )?;
        Ok(rows_affected > 0)
    }

    pub fn get_fee_assessment(&self, script_id: &str) -> DbResult<Option<FeeAssessment>> {
        self.conn
            .query_row(
                r#"
                SELECT script_id, clinic_id, gross_cents, waived_cents, net_cents, rule_id, occurred_at
                FROM fee_assessments WHERE script_id = ?
                "#,
                [script_id],
                |row| {
                    Ok(FeeAssessment {
                        script_id: row.get(0)?,
                        clinic_id: row.get(1)?,
                        gross_cents: row.get(2)?,
                        waived_cents: row.get(3)?,
                        net_cents: row.get(4)?,
                        rule_id: row.get(5)?,
                        occurred_at: get_time(row, 6)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Assessed scripts of a clinic, optionally limited to `[start, end)`.
    pub fn count_fee_assessments(
        &self,
        clinic_id: &str,
        window: Option<(&DateTime<Utc>, &DateTime<Utc>)>,
    ) -> DbResult<i64> {
        let (start, end) = match window {
            Some((start, end)) => (Some(to_db_time(start)), Some(to_db_time(end))),
            None => (None, None),
        };
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM fee_assessments
            WHERE clinic_id = ?1
              AND (?2 IS NULL OR occurred_at >= ?2)
              AND (?3 IS NULL OR occurred_at < ?3)
            "#,
            params![clinic_id, start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
