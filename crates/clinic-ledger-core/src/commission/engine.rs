//! Turning inputs into ledgered commission events.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{debug, info};

use crate::config::CommissionConfig;
use crate::db::{Database, InputSource, ProcessedInput};
use crate::models::{
    BillingEvent, BillingEventKind, CommissionBalance, CommissionComponent, CommissionEvent,
    CommissionStatus, CompensationPlan, HoursEntry, PayoutStatement, PlanTerms,
    PrescriptionEvent, Recipient,
};

use super::{
    affiliate_drafts, event_key, hourly_amount, sales_rep_drafts, CommissionDraft,
    CommissionError, CommissionResult, ProcessingOutcome, ProcessingSummary,
};

/// Commission engine over one database.
pub struct CommissionEngine<'a> {
    pub(super) db: &'a Database,
    pub(super) config: CommissionConfig,
}

impl<'a> CommissionEngine<'a> {
    pub fn new(db: &'a Database, config: CommissionConfig) -> Self {
        Self { db, config }
    }

    /// Process a payment, refund or chargeback exactly once.
    pub fn process_billing_event(&self, event: &BillingEvent) -> CommissionResult<ProcessingOutcome> {
        if event.amount_cents < 0 {
            return Err(CommissionError::InvalidInput(format!(
                "billing event {} has a negative amount",
                event.event_id
            )));
        }

        let tx = self.db.begin_immediate()?;
        if self
            .db
            .get_processed_input(InputSource::Billing, &event.event_id)?
            .is_some()
        {
            debug!(event_id = %event.event_id, "Billing event already processed");
            return Ok(ProcessingOutcome::Duplicate);
        }

        let summary = match &event.kind {
            BillingEventKind::Payment => self.apply_payment(event)?,
            BillingEventKind::Refund { original_event_id } => {
                self.apply_reversal(event, original_event_id, false)?
            }
            BillingEventKind::Chargeback { original_event_id } => {
                self.apply_reversal(event, original_event_id, true)?
            }
        };
        tx.commit()?;

        info!(
            event_id = %event.event_id,
            kind = event.kind.as_str(),
            created = summary.created.len(),
            reversed = summary.reversed.len(),
            "Processed billing event"
        );
        Ok(ProcessingOutcome::Processed(summary))
    }

    fn apply_payment(&self, event: &BillingEvent) -> CommissionResult<ProcessingSummary> {
        // Looked up before this payment is recorded, so None means "first"
        let first_payment_at = self.db.first_payment_at(&event.clinic_id, &event.patient_id)?;
        self.record_input(
            InputSource::Billing,
            &event.event_id,
            event.kind.as_str(),
            &event.clinic_id,
            Some(&event.patient_id),
            event.amount_cents,
            event.occurred_at,
            serde_json::to_string(event)?,
        )?;

        let mut summary = ProcessingSummary::default();
        if event.amount_cents == 0 {
            return Ok(summary);
        }

        if let Some(affiliate_id) = &event.attribution.affiliate_id {
            let recipient = Recipient::affiliate(affiliate_id);
            if let Some(plan) = self.plan_at(&event.clinic_id, &recipient, event.occurred_at)? {
                if let PlanTerms::Affiliate(terms) = &plan.terms {
                    let drafts = affiliate_drafts(
                        terms,
                        event.amount_cents,
                        event.occurred_at,
                        first_payment_at,
                    );
                    self.ledger_held(&plan, &event.event_id, event.occurred_at, drafts, &mut summary)?;
                }
            }
        }

        if let Some(sales_rep_id) = &event.attribution.sales_rep_id {
            let recipient = Recipient::sales_rep(sales_rep_id);
            if let Some(plan) = self.plan_at(&event.clinic_id, &recipient, event.occurred_at)? {
                if let PlanTerms::SalesRep(terms) = &plan.terms {
                    let drafts = sales_rep_drafts(terms, event);
                    self.ledger_held(&plan, &event.event_id, event.occurred_at, drafts, &mut summary)?;
                }
            }
        }

        Ok(summary)
    }

    /// Credit a provider for a prescription exactly once.
    pub fn process_prescription(
        &self,
        event: &PrescriptionEvent,
    ) -> CommissionResult<ProcessingOutcome> {
        if event.order_amount_cents < 0 {
            return Err(CommissionError::InvalidInput(format!(
                "script {} has a negative order amount",
                event.script_id
            )));
        }

        let tx = self.db.begin_immediate()?;
        if !self.record_input(
            InputSource::Prescription,
            &event.script_id,
            "prescription",
            &event.clinic_id,
            Some(&event.patient_id),
            event.order_amount_cents,
            event.occurred_at,
            serde_json::to_string(event)?,
        )? {
            debug!(script_id = %event.script_id, "Prescription already processed");
            return Ok(ProcessingOutcome::Duplicate);
        }

        let mut summary = ProcessingSummary::default();
        let recipient = Recipient::provider(&event.provider_id);
        if let Some(plan) = self.plan_at(&event.clinic_id, &recipient, event.occurred_at)? {
            if let PlanTerms::Provider(terms) = &plan.terms {
                let amount = terms.per_script.apply(event.order_amount_cents);
                if amount != 0 {
                    let draft = CommissionDraft {
                        component: CommissionComponent::PerScript,
                        discriminator: None,
                        basis_cents: event.order_amount_cents,
                        amount_cents: amount,
                    };
                    self.ledger_approved(&plan, &event.script_id, event.occurred_at, draft, &mut summary)?;
                }
            }
        }
        tx.commit()?;

        info!(
            script_id = %event.script_id,
            provider_id = %event.provider_id,
            created = summary.created.len(),
            "Processed prescription"
        );
        Ok(ProcessingOutcome::Processed(summary))
    }

    /// Credit a sales rep's logged time exactly once.
    ///
    /// The plan in force at the start of the work date (UTC) applies.
    pub fn record_hours(&self, entry: &HoursEntry) -> CommissionResult<ProcessingOutcome> {
        let worked_at = entry.work_date.and_time(NaiveTime::MIN).and_utc();
        let recipient = Recipient::sales_rep(&entry.sales_rep_id);

        let tx = self.db.begin_immediate()?;
        let plan = self.plan_at(&entry.clinic_id, &recipient, worked_at)?;
        let rate = plan.as_ref().and_then(|p| match &p.terms {
            PlanTerms::SalesRep(terms) => terms.hourly_rate_cents,
            _ => None,
        });
        let amount = rate.map_or(0, |r| hourly_amount(r, entry.minutes));

        if !self.record_input(
            InputSource::Hours,
            &entry.entry_id,
            "hours",
            &entry.clinic_id,
            None,
            amount,
            worked_at,
            serde_json::to_string(entry)?,
        )? {
            debug!(entry_id = %entry.entry_id, "Hours entry already processed");
            return Ok(ProcessingOutcome::Duplicate);
        }

        let mut summary = ProcessingSummary::default();
        if let (Some(plan), Some(rate)) = (&plan, rate) {
            if amount != 0 {
                let draft = CommissionDraft {
                    component: CommissionComponent::Hourly,
                    discriminator: None,
                    basis_cents: rate,
                    amount_cents: amount,
                };
                self.ledger_approved(plan, &entry.entry_id, worked_at, draft, &mut summary)?;
            }
        } else {
            debug!(entry_id = %entry.entry_id, "No hourly rate in force");
        }
        tx.commit()?;

        info!(
            entry_id = %entry.entry_id,
            sales_rep_id = %entry.sales_rep_id,
            minutes = entry.minutes,
            amount,
            "Recorded hours"
        );
        Ok(ProcessingOutcome::Processed(summary))
    }

    /// Approve every pending event whose hold has elapsed. Returns the count.
    pub fn release_matured(&self, now: DateTime<Utc>) -> CommissionResult<usize> {
        let tx = self.db.begin_immediate()?;
        let released = self.db.approve_matured(&now)?;
        tx.commit()?;

        if released > 0 {
            info!(released, "Released matured commissions");
        }
        Ok(released)
    }

    /// Settle every approved, unpaid event before `period_end`.
    ///
    /// Returns None when there is nothing to pay; no empty payout is created.
    pub fn create_payout(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
        period_end: DateTime<Utc>,
    ) -> CommissionResult<Option<PayoutStatement>> {
        let tx = self.db.begin_immediate()?;
        let lines = self.db.payable_events(clinic_id, recipient, &period_end)?;
        if lines.is_empty() {
            return Ok(None);
        }

        let mut statement = PayoutStatement {
            payout_id: uuid::Uuid::new_v4().to_string(),
            clinic_id: clinic_id.to_string(),
            recipient: recipient.clone(),
            period_end,
            created_at: Utc::now(),
            total_cents: lines.iter().map(|e| e.amount_cents).sum(),
            lines,
        };
        self.db.insert_payout(&statement)?;
        tx.commit()?;

        for line in &mut statement.lines {
            line.status = CommissionStatus::Paid;
            line.payout_id = Some(statement.payout_id.clone());
        }
        info!(
            payout_id = %statement.payout_id,
            recipient_id = %recipient.id,
            lines = statement.lines.len(),
            total_cents = statement.total_cents,
            "Created payout"
        );
        Ok(Some(statement))
    }

    pub fn balance(&self, clinic_id: &str, recipient: &Recipient) -> CommissionResult<CommissionBalance> {
        Ok(self.db.commission_balance(clinic_id, recipient)?)
    }

    pub fn events_for_recipient(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
    ) -> CommissionResult<Vec<CommissionEvent>> {
        Ok(self.db.commission_events_for_recipient(clinic_id, recipient)?)
    }

    // ------------------------------------------------------------------
    // Helpers shared with clawback handling
    // ------------------------------------------------------------------

    pub(super) fn plan_at(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
        at: DateTime<Utc>,
    ) -> CommissionResult<Option<CompensationPlan>> {
        let plan = self.db.plan_in_force(clinic_id, recipient, &at)?;
        if plan.is_none() {
            debug!(
                clinic_id,
                recipient_kind = recipient.kind.as_str(),
                recipient_id = %recipient.id,
                "No compensation plan in force"
            );
        }
        Ok(plan)
    }

    /// Record an input as processed. Returns false if it already was.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn record_input(
        &self,
        source: InputSource,
        input_id: &str,
        input_type: &str,
        clinic_id: &str,
        patient_id: Option<&str>,
        amount_cents: i64,
        occurred_at: DateTime<Utc>,
        payload: String,
    ) -> CommissionResult<bool> {
        Ok(self.db.insert_processed_input(&ProcessedInput {
            source,
            input_id: input_id.to_string(),
            input_type: input_type.to_string(),
            clinic_id: clinic_id.to_string(),
            patient_id: patient_id.map(str::to_string),
            amount_cents,
            occurred_at,
            payload,
        })?)
    }

    fn hold_days(&self, plan: &CompensationPlan) -> u32 {
        plan.terms.hold_days().unwrap_or(self.config.default_hold_days)
    }

    pub(super) fn clawback_days(&self, plan_id: Option<&str>) -> CommissionResult<u32> {
        let plan_days = match plan_id {
            Some(id) => self.db.get_plan(id)?.and_then(|p| p.terms.clawback_days()),
            None => None,
        };
        Ok(plan_days.unwrap_or(self.config.default_clawback_days))
    }

    /// Ledger payment-derived drafts, held per the plan.
    fn ledger_held(
        &self,
        plan: &CompensationPlan,
        source_id: &str,
        occurred_at: DateTime<Utc>,
        drafts: Vec<CommissionDraft>,
        summary: &mut ProcessingSummary,
    ) -> CommissionResult<()> {
        let hold_days = self.hold_days(plan);
        let (status, hold_until) = if hold_days == 0 {
            (CommissionStatus::Approved, None)
        } else {
            (
                CommissionStatus::Pending,
                Some(occurred_at + Duration::days(i64::from(hold_days))),
            )
        };
        for draft in drafts {
            let event = new_event(plan, source_id, occurred_at, draft, status, hold_until);
            self.insert_event(event, summary)?;
        }
        Ok(())
    }

    /// Ledger a draft that is earned immediately.
    fn ledger_approved(
        &self,
        plan: &CompensationPlan,
        source_id: &str,
        occurred_at: DateTime<Utc>,
        draft: CommissionDraft,
        summary: &mut ProcessingSummary,
    ) -> CommissionResult<()> {
        let event = new_event(plan, source_id, occurred_at, draft, CommissionStatus::Approved, None);
        self.insert_event(event, summary)
    }

    pub(super) fn insert_event(
        &self,
        event: CommissionEvent,
        summary: &mut ProcessingSummary,
    ) -> CommissionResult<()> {
        if self.db.insert_commission_event(&event)? {
            debug!(
                event_key = %event.event_key,
                amount_cents = event.amount_cents,
                status = event.status.as_str(),
                "Created commission event"
            );
            summary.created.push(event);
        }
        Ok(())
    }
}

fn new_event(
    plan: &CompensationPlan,
    source_id: &str,
    occurred_at: DateTime<Utc>,
    draft: CommissionDraft,
    status: CommissionStatus,
    hold_until: Option<DateTime<Utc>>,
) -> CommissionEvent {
    CommissionEvent {
        id: uuid::Uuid::new_v4().to_string(),
        event_key: event_key(
            source_id,
            &plan.recipient,
            draft.component,
            draft.discriminator.as_deref(),
        ),
        clinic_id: plan.clinic_id.clone(),
        recipient: plan.recipient.clone(),
        source_id: source_id.to_string(),
        plan_id: Some(plan.id.clone()),
        component: draft.component,
        basis_cents: draft.basis_cents,
        amount_cents: draft.amount_cents,
        status,
        hold_until,
        occurred_at,
        created_at: Utc::now(),
        reverses: None,
        payout_id: None,
    }
}
