//! Compensation plan, processed-input, commission event and payout operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{bad_enum, get_opt_time, get_time, now_db_time, to_db_time, Database, DbError, DbResult};
use crate::models::{
    CommissionBalance, CommissionComponent, CommissionEvent, CommissionStatus, CompensationPlan,
    PayoutStatement, PlanTerms, Recipient, RecipientKind,
};

/// Which stream an input came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Billing,
    Prescription,
    Hours,
}

impl InputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputSource::Billing => "billing",
            InputSource::Prescription => "prescription",
            InputSource::Hours => "hours",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "billing" => Some(InputSource::Billing),
            "prescription" => Some(InputSource::Prescription),
            "hours" => Some(InputSource::Hours),
            _ => None,
        }
    }
}

/// An input recorded as processed; its presence makes reprocessing a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedInput {
    pub source: InputSource,
    pub input_id: String,
    /// payment, refund, chargeback, prescription, hours
    pub input_type: String,
    pub clinic_id: String,
    pub patient_id: Option<String>,
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
    /// JSON of the input as received
    pub payload: String,
}

const PLAN_COLUMNS: &str =
    "id, clinic_id, recipient_kind, recipient_id, terms, effective_from, effective_to";

const EVENT_COLUMNS: &str = "id, event_key, clinic_id, recipient_kind, recipient_id, source_id, \
                             plan_id, component, basis_cents, amount_cents, status, hold_until, \
                             occurred_at, created_at, reverses, payout_id";

fn recipient_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<RecipientKind> {
    let value: String = row.get(idx)?;
    RecipientKind::parse(&value).ok_or_else(|| bad_enum(idx, &value))
}

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<CompensationPlan> {
    let terms_json: String = row.get(4)?;
    let terms: PlanTerms = serde_json::from_str(&terms_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(CompensationPlan {
        id: row.get(0)?,
        clinic_id: row.get(1)?,
        recipient: Recipient {
            kind: recipient_kind(row, 2)?,
            id: row.get(3)?,
        },
        terms,
        effective_from: get_time(row, 5)?,
        effective_to: get_opt_time(row, 6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CommissionEvent> {
    let component: String = row.get(7)?;
    let status: String = row.get(10)?;
    Ok(CommissionEvent {
        id: row.get(0)?,
        event_key: row.get(1)?,
        clinic_id: row.get(2)?,
        recipient: Recipient {
            kind: recipient_kind(row, 3)?,
            id: row.get(4)?,
        },
        source_id: row.get(5)?,
        plan_id: row.get(6)?,
        component: CommissionComponent::parse(&component).ok_or_else(|| bad_enum(7, &component))?,
        basis_cents: row.get(8)?,
        amount_cents: row.get(9)?,
        status: CommissionStatus::parse(&status).ok_or_else(|| bad_enum(10, &status))?,
        hold_until: get_opt_time(row, 11)?,
        occurred_at: get_time(row, 12)?,
        created_at: get_time(row, 13)?,
        reverses: row.get(14)?,
        payout_id: row.get(15)?,
    })
}

impl Database {
    // ------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------

    pub fn insert_plan(&self, plan: &CompensationPlan) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO compensation_plans (
                id, clinic_id, recipient_kind, recipient_id, terms,
                effective_from, effective_to, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                plan.id,
                plan.clinic_id,
                plan.recipient.kind.as_str(),
                plan.recipient.id,
                serde_json::to_string(&plan.terms)?,
                to_db_time(&plan.effective_from),
                plan.effective_to.as_ref().map(to_db_time),
                now_db_time(),
            ],
        )?;
        Ok(())
    }

    /// Close an open-ended plan at `effective_to`.
    pub fn close_plan(&self, plan_id: &str, effective_to: &DateTime<Utc>) -> DbResult<()> {
        let rows_affected = self.conn.execute(
            "UPDATE compensation_plans SET effective_to = ?2 WHERE id = ?1 AND effective_to IS NULL",
            params![plan_id, to_db_time(effective_to)],
        )?;
        if rows_affected == 0 {
            return Err(DbError::NotFound(format!("open plan {}", plan_id)));
        }
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &str) -> DbResult<Option<CompensationPlan>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM compensation_plans WHERE id = ?", PLAN_COLUMNS),
                [plan_id],
                plan_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Every plan version for a recipient, oldest first.
    pub fn plans_for_recipient(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
    ) -> DbResult<Vec<CompensationPlan>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM compensation_plans
            WHERE clinic_id = ?1 AND recipient_kind = ?2 AND recipient_id = ?3
            ORDER BY effective_from, id
            "#,
            PLAN_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![clinic_id, recipient.kind.as_str(), recipient.id],
            plan_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// The plan whose window contains `at`.
    pub fn plan_in_force(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
        at: &DateTime<Utc>,
    ) -> DbResult<Option<CompensationPlan>> {
        self.conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM compensation_plans
                    WHERE clinic_id = ?1 AND recipient_kind = ?2 AND recipient_id = ?3
                      AND effective_from <= ?4
                      AND (effective_to IS NULL OR ?4 < effective_to)
                    ORDER BY effective_from DESC
                    LIMIT 1
                    "#,
                    PLAN_COLUMNS
                ),
                params![clinic_id, recipient.kind.as_str(), recipient.id, to_db_time(at)],
                plan_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Processed inputs
    // ------------------------------------------------------------------

    /// Record an input. Returns false if it was already recorded.
    pub fn insert_processed_input(&self, input: &ProcessedInput) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            INSERT INTO processed_inputs (
                source, input_id, input_type, clinic_id, patient_id, amount_cents,
                occurred_at, payload, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(source, input_id) DO NOTHING
            "#,
            params![
                input.source.as_str(),
                input.input_id,
                input.input_type,
                input.clinic_id,
                input.patient_id,
                input.amount_cents,
                to_db_time(&input.occurred_at),
                input.payload,
                now_db_time(),
            ],
        )?;
        Ok(rows_affected > 0)
    }

    pub fn get_processed_input(
        &self,
        source: InputSource,
        input_id: &str,
    ) -> DbResult<Option<ProcessedInput>> {
        self.conn
            .query_row(
                r#"
                SELECT source, input_id, input_type, clinic_id, patient_id, amount_cents,
                       occurred_at, payload
                FROM processed_inputs
                WHERE source = ?1 AND input_id = ?2
                "#,
                params![source.as_str(), input_id],
                |row| {
                    let source: String = row.get(0)?;
                    Ok(ProcessedInput {
                        source: InputSource::parse(&source).ok_or_else(|| bad_enum(0, &source))?,
                        input_id: row.get(1)?,
                        input_type: row.get(2)?,
                        clinic_id: row.get(3)?,
                        patient_id: row.get(4)?,
                        amount_cents: row.get(5)?,
                        occurred_at: get_time(row, 6)?,
                        payload: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Occurrence time of the earliest-processed payment for a patient.
    ///
    /// Arrival order decides which payment is "first".
    pub fn first_payment_at(
        &self,
        clinic_id: &str,
        patient_id: &str,
    ) -> DbResult<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                r#"
                SELECT occurred_at FROM processed_inputs
                WHERE source = 'billing' AND input_type = 'payment'
                  AND clinic_id = ?1 AND patient_id = ?2
                ORDER BY rowid
                LIMIT 1
                "#,
                params![clinic_id, patient_id],
                |row| get_time(row, 0),
            )
            .optional()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Commission events
    // ------------------------------------------------------------------

    /// Insert an event. Returns false if its event key already exists.
    pub fn insert_commission_event(&self, event: &CommissionEvent) -> DbResult<bool> {
        let now = now_db_time();
        let rows_affected = self.conn.execute(
            r#"
            INSERT INTO commission_events (
                id, event_key, clinic_id, recipient_kind, recipient_id, source_id, plan_id,
                component, basis_cents, amount_cents, status, hold_until, occurred_at,
                created_at, updated_at, reverses, payout_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(event_key) DO NOTHING
            "#,
            params![
                event.id,
                event.event_key,
                event.clinic_id,
                event.recipient.kind.as_str(),
                event.recipient.id,
                event.source_id,
                event.plan_id,
                event.component.as_str(),
                event.basis_cents,
                event.amount_cents,
                event.status.as_str(),
                event.hold_until.as_ref().map(to_db_time),
                to_db_time(&event.occurred_at),
                to_db_time(&event.created_at),
                now,
                event.reverses,
                event.payout_id,
            ],
        )?;
        Ok(rows_affected > 0)
    }

    pub fn get_commission_event(&self, id: &str) -> DbResult<Option<CommissionEvent>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM commission_events WHERE id = ?", EVENT_COLUMNS),
                [id],
                event_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Events derived from one billing event, script or hours entry.
    pub fn commission_events_for_source(&self, source_id: &str) -> DbResult<Vec<CommissionEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM commission_events WHERE source_id = ? ORDER BY created_at, event_key",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map([source_id], event_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn commission_events_for_recipient(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
    ) -> DbResult<Vec<CommissionEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM commission_events
            WHERE clinic_id = ?1 AND recipient_kind = ?2 AND recipient_id = ?3
            ORDER BY occurred_at, event_key
            "#,
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![clinic_id, recipient.kind.as_str(), recipient.id],
            event_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Sum of clawbacks already booked against an event (zero or negative).
    pub fn clawed_back_cents(&self, event_id: &str) -> DbResult<i64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM commission_events \
             WHERE reverses = ? AND status != 'reversed'",
            [event_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Clawbacks booked against an event, oldest first.
    pub fn clawbacks_for(&self, event_id: &str) -> DbResult<Vec<CommissionEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM commission_events WHERE reverses = ? ORDER BY occurred_at, event_key",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map([event_id], event_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Compare-and-set a status. Returns false if the event was not in `from`.
    pub fn update_commission_status(
        &self,
        id: &str,
        from: CommissionStatus,
        to: CommissionStatus,
    ) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE commission_events SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), now_db_time()],
        )?;
        Ok(rows_affected > 0)
    }

    /// Approve every pending event whose hold has elapsed by `now`.
    pub fn approve_matured(&self, now: &DateTime<Utc>) -> DbResult<usize> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE commission_events
            SET status = 'approved', updated_at = ?2
            WHERE status = 'pending' AND (hold_until IS NULL OR hold_until <= ?1)
            "#,
            params![to_db_time(now), now_db_time()],
        )?;
        Ok(rows_affected)
    }

    /// Approved, unpaid events that occurred before `period_end`.
    pub fn payable_events(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
        period_end: &DateTime<Utc>,
    ) -> DbResult<Vec<CommissionEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM commission_events
            WHERE clinic_id = ?1 AND recipient_kind = ?2 AND recipient_id = ?3
              AND status = 'approved' AND payout_id IS NULL AND occurred_at < ?4
            ORDER BY occurred_at, event_key
            "#,
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                clinic_id,
                recipient.kind.as_str(),
                recipient.id,
                to_db_time(period_end)
            ],
            event_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Totals by status for a recipient.
    pub fn commission_balance(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
    ) -> DbResult<CommissionBalance> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT status, COALESCE(SUM(amount_cents), 0)
            FROM commission_events
            WHERE clinic_id = ?1 AND recipient_kind = ?2 AND recipient_id = ?3
            GROUP BY status
            "#,
        )?;
        let rows = stmt.query_map(
            params![clinic_id, recipient.kind.as_str(), recipient.id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut balance = CommissionBalance::default();
        for row in rows {
            let (status, total) = row?;
            match CommissionStatus::parse(&status) {
                Some(CommissionStatus::Pending) => balance.pending_cents = total,
                Some(CommissionStatus::Approved) => balance.approved_cents = total,
                Some(CommissionStatus::Paid) => balance.paid_cents = total,
                Some(CommissionStatus::Reversed) => balance.reversed_cents = total,
                None => return Err(DbError::Sqlite(bad_enum(0, &status))),
            }
        }
        Ok(balance)
    }

    // ------------------------------------------------------------------
    // Payouts
    // ------------------------------------------------------------------

    /// Persist the payout header and attach its lines, marking them paid.
    pub fn insert_payout(&self, statement: &PayoutStatement) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO payouts (
                id, clinic_id, recipient_kind, recipient_id, period_end,
                total_cents, event_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                statement.payout_id,
                statement.clinic_id,
                statement.recipient.kind.as_str(),
                statement.recipient.id,
                to_db_time(&statement.period_end),
                statement.total_cents,
                statement.lines.len() as i64,
                to_db_time(&statement.created_at),
            ],
        )?;

        let now = now_db_time();
        for line in &statement.lines {
            let rows_affected = self.conn.execute(
                r#"
                UPDATE commission_events
                SET status = 'paid', payout_id = ?2, updated_at = ?3
                WHERE id = ?1 AND status = 'approved' AND payout_id IS NULL
                "#,
                params![line.id, statement.payout_id, now],
            )?;
            if rows_affected == 0 {
                return Err(DbError::Constraint(format!(
                    "commission event {} is no longer payable",
                    line.id
                )));
            }
        }
        Ok(())
    }

    pub fn get_payout(&self, payout_id: &str) -> DbResult<Option<PayoutStatement>> {
        let header = self
            .conn
            .query_row(
                r#"
                SELECT id, clinic_id, recipient_kind, recipient_id, period_end, total_cents, created_at
                FROM payouts WHERE id = ?
                "#,
                [payout_id],
                |row| {
                    Ok(PayoutStatement {
                        payout_id: row.get(0)?,
                        clinic_id: row.get(1)?,
                        recipient: Recipient {
                            kind: recipient_kind(row, 2)?,
                            id: row.get(3)?,
                        },
                        period_end: get_time(row, 4)?,
                        total_cents: row.get(5)?,
                        created_at: get_time(row, 6)?,
                        lines: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut statement) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM commission_events WHERE payout_id = ? ORDER BY occurred_at, event_key",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map([payout_id], event_from_row)?;
        statement.lines = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(Some(statement))
    }
}
