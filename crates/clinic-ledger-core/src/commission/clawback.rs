//! Refunds and chargebacks against earlier payments.

use chrono::Duration;
use tracing::{debug, info};

use crate::db::InputSource;
use crate::models::{BillingEvent, CommissionComponent, CommissionEvent, CommissionStatus};

use super::{
    clawback_amount, event_key, refund_fraction, CommissionEngine, CommissionError,
    CommissionResult, ProcessingSummary,
};

impl<'a> CommissionEngine<'a> {
    /// Reverse or claw back the commissions an original payment produced.
    ///
    /// Pending events are reversed outright on a full refund; otherwise a
    /// negative clawback is appended. Approved or paid events are only clawed
    /// back inside the plan's clawback window.
    pub(super) fn apply_reversal(
        &self,
        event: &BillingEvent,
        original_event_id: &str,
        chargeback: bool,
    ) -> CommissionResult<ProcessingSummary> {
        let original = self
            .db
            .get_processed_input(InputSource::Billing, original_event_id)?
            .filter(|input| input.input_type == "payment" && input.clinic_id == event.clinic_id)
            .ok_or_else(|| CommissionError::UnknownOriginalPayment(original_event_id.to_string()))?;

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

        let fraction = if chargeback {
            (1, 1)
        } else {
            refund_fraction(event.amount_cents, original.amount_cents)
        };
        let full = fraction.0 == fraction.1;

        let mut summary = ProcessingSummary::default();
        for commission in self.db.commission_events_for_source(original_event_id)? {
            if commission.component == CommissionComponent::Clawback {
                continue;
            }
            match commission.status {
                CommissionStatus::Reversed => {}
                CommissionStatus::Pending if full => {
                    self.reverse_pending(&commission, &mut summary)?;
                }
                CommissionStatus::Pending => {
                    self.append_clawback(event, &commission, fraction, &mut summary)?;
                }
                CommissionStatus::Approved | CommissionStatus::Paid => {
                    let window = self.clawback_days(commission.plan_id.as_deref())?;
                    let deadline = original.occurred_at + Duration::days(i64::from(window));
                    if event.occurred_at <= deadline {
                        self.append_clawback(event, &commission, fraction, &mut summary)?;
                    } else {
                        info!(
                            commission_id = %commission.id,
                            refund_id = %event.event_id,
                            window_days = window,
                            "Refund outside clawback window"
                        );
                        summary.outside_window.push(commission.id.clone());
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Reverse a pending event together with any pending partial clawbacks.
    fn reverse_pending(
        &self,
        commission: &CommissionEvent,
        summary: &mut ProcessingSummary,
    ) -> CommissionResult<()> {
        if self.db.update_commission_status(
            &commission.id,
            CommissionStatus::Pending,
            CommissionStatus::Reversed,
        )? {
            info!(commission_id = %commission.id, "Reversed pending commission");
            summary.reversed.push(commission.id.clone());
        }

        for earlier in self.db.clawbacks_for(&commission.id)? {
            if earlier.status == CommissionStatus::Pending
                && self.db.update_commission_status(
                    &earlier.id,
                    CommissionStatus::Pending,
                    CommissionStatus::Reversed,
                )?
            {
                summary.reversed.push(earlier.id);
            }
        }
        Ok(())
    }

    fn append_clawback(
        &self,
        refund: &BillingEvent,
        commission: &CommissionEvent,
        fraction: (i64, i64),
        summary: &mut ProcessingSummary,
    ) -> CommissionResult<()> {
        let already = self.db.clawed_back_cents(&commission.id)?;
        let amount = clawback_amount(commission.amount_cents, already, fraction);
        if amount == 0 {
            debug!(commission_id = %commission.id, "Commission already fully clawed back");
            return Ok(());
        }

        // A pending original keeps its hold; the clawback releases with it
        let (status, hold_until) = match commission.status {
            CommissionStatus::Pending => (CommissionStatus::Pending, commission.hold_until),
            _ => (CommissionStatus::Approved, None),
        };
        let clawback = CommissionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_key: event_key(
                &refund.event_id,
                &commission.recipient,
                CommissionComponent::Clawback,
                Some(&commission.id),
            ),
            clinic_id: commission.clinic_id.clone(),
            recipient: commission.recipient.clone(),
            source_id: refund.event_id.clone(),
            plan_id: commission.plan_id.clone(),
            component: CommissionComponent::Clawback,
            basis_cents: -crate::models::scale_rounded(commission.basis_cents, fraction.0, fraction.1),
            amount_cents: amount,
            status,
            hold_until,
            occurred_at: refund.occurred_at,
            created_at: chrono::Utc::now(),
            reverses: Some(commission.id.clone()),
            payout_id: None,
        };
        info!(
            commission_id = %commission.id,
            refund_id = %refund.event_id,
            amount_cents = amount,
            "Clawed back commission"
        );
        self.insert_event(clawback, summary)
    }
}

#[cfg(test)]
mod tests {
    use crate::commission::{CommissionEngine, CommissionError, ProcessingOutcome};
    use crate::config::CommissionConfig;
    use crate::db::Database;
    use crate::models::{
        AffiliateTerms, Attribution, BillingEvent, BillingEventKind, Clinic, CommissionComponent,
        CommissionStatus, CompensationPlan, PlanTerms, Rate, Recipient,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Database, Clinic) {
        let db = Database::open_in_memory().unwrap();
        let clinic = Clinic::new("Test Clinic".into(), "TC".into());
        db.insert_clinic(&clinic).unwrap();
        (db, clinic)
    }

    fn publish(engine: &CommissionEngine<'_>, clinic_id: &str) {
        let plan = CompensationPlan::new(
            clinic_id,
            "aff-1",
            PlanTerms::Affiliate(AffiliateTerms {
                initial_rate: Rate::Percent { bps: 2_000 },
                recurring_rate: None,
                recurring_months: None,
                hold_days: Some(14),
                clawback_days: Some(90),
            }),
            start(),
        );
        engine.publish_plan(&plan).unwrap();
    }

    fn payment(clinic_id: &str) -> BillingEvent {
        let mut event = BillingEvent::payment("inv_1", clinic_id, "p1", 10_000, start());
        event.attribution = Attribution {
            affiliate_id: Some("aff-1".into()),
            sales_rep_id: None,
        };
        event
    }

    fn refund(clinic_id: &str, id: &str, amount: i64, days_later: i64) -> BillingEvent {
        BillingEvent {
            event_id: id.into(),
            clinic_id: clinic_id.into(),
            patient_id: "p1".into(),
            kind: BillingEventKind::Refund {
                original_event_id: "inv_1".into(),
            },
            amount_cents: amount,
            occurred_at: start() + Duration::days(days_later),
            line_items: Vec::new(),
            attribution: Attribution::default(),
        }
    }

    fn summary(outcome: ProcessingOutcome) -> crate::commission::ProcessingSummary {
        match outcome {
            ProcessingOutcome::Processed(summary) => summary,
            ProcessingOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[test]
    fn test_full_refund_during_hold_reverses() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        publish(&engine, &clinic.id);
        engine.process_billing_event(&payment(&clinic.id)).unwrap();

        let result = summary(engine.process_billing_event(&refund(&clinic.id, "re_1", 10_000, 3)).unwrap());
        assert_eq!(result.reversed.len(), 1);
        assert!(result.created.is_empty());

        let events = db.commission_events_for_source("inv_1").unwrap();
        assert_eq!(events[0].status, CommissionStatus::Reversed);
        assert_eq!(
            engine.balance(&clinic.id, &Recipient::affiliate("aff-1")).unwrap().reversed_cents,
            2_000
        );
    }

    #[test]
    fn test_partial_refund_during_hold_appends_pending_clawback() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        publish(&engine, &clinic.id);
        engine.process_billing_event(&payment(&clinic.id)).unwrap();

        let result = summary(engine.process_billing_event(&refund(&clinic.id, "re_1", 2_500, 3)).unwrap());
        assert!(result.reversed.is_empty());
        assert_eq!(result.created.len(), 1);
        let clawback = &result.created[0];
        assert_eq!(clawback.component, CommissionComponent::Clawback);
        assert_eq!(clawback.amount_cents, -500);
        assert_eq!(clawback.status, CommissionStatus::Pending);
        assert_eq!(clawback.hold_until, Some(start() + Duration::days(14)));

        // A later full refund reverses the original and the pending clawback
        let rest = summary(engine.process_billing_event(&refund(&clinic.id, "re_2", 10_000, 4)).unwrap());
        assert_eq!(rest.reversed.len(), 2);
        let balance = engine.balance(&clinic.id, &Recipient::affiliate("aff-1")).unwrap();
        assert_eq!(balance.pending_cents, 0);
    }

    #[test]
    fn test_unheld_commission_is_clawed_back_not_reversed() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        engine
            .publish_plan(&CompensationPlan::new(
                &clinic.id,
                "aff-1",
                PlanTerms::Affiliate(AffiliateTerms {
                    initial_rate: Rate::Percent { bps: 2_000 },
                    recurring_rate: None,
                    recurring_months: None,
                    hold_days: Some(0),
                    clawback_days: Some(90),
                }),
                start(),
            ))
            .unwrap();

        let paid = summary(engine.process_billing_event(&payment(&clinic.id)).unwrap());
        assert_eq!(paid.created[0].status, CommissionStatus::Approved);
        assert!(paid.created[0].hold_until.is_none());

        // Same-day full refund: nothing pending to reverse
        let result = summary(engine.process_billing_event(&refund(&clinic.id, "re_1", 10_000, 0)).unwrap());
        assert!(result.reversed.is_empty());
        assert_eq!(result.created[0].amount_cents, -2_000);
        assert_eq!(result.created[0].status, CommissionStatus::Approved);
        assert_eq!(
            engine.balance(&clinic.id, &Recipient::affiliate("aff-1")).unwrap().approved_cents,
            0
        );
    }

    #[test]
    fn test_chargeback_after_payout_claws_back() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        publish(&engine, &clinic.id);
        engine.process_billing_event(&payment(&clinic.id)).unwrap();
        engine.release_matured(start() + Duration::days(14)).unwrap();
        let recipient = Recipient::affiliate("aff-1");
        engine
            .create_payout(&clinic.id, &recipient, start() + Duration::days(30))
            .unwrap()
            .unwrap();

        let mut chargeback = refund(&clinic.id, "dp_1", 1, 40);
        chargeback.kind = BillingEventKind::Chargeback {
            original_event_id: "inv_1".into(),
        };
        let result = summary(engine.process_billing_event(&chargeback).unwrap());
        assert_eq!(result.created[0].amount_cents, -2_000);
        assert_eq!(result.created[0].status, CommissionStatus::Approved);

        let balance = engine.balance(&clinic.id, &recipient).unwrap();
        assert_eq!(balance.paid_cents, 2_000);
        assert_eq!(balance.approved_cents, -2_000);
    }

    #[test]
    fn test_refund_outside_window_does_nothing() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        publish(&engine, &clinic.id);
        engine.process_billing_event(&payment(&clinic.id)).unwrap();
        engine.release_matured(start() + Duration::days(14)).unwrap();

        let result = summary(engine.process_billing_event(&refund(&clinic.id, "re_1", 10_000, 91)).unwrap());
        assert!(result.created.is_empty());
        assert_eq!(result.outside_window.len(), 1);
    }

    #[test]
    fn test_clawbacks_capped_at_original() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        publish(&engine, &clinic.id);
        engine.process_billing_event(&payment(&clinic.id)).unwrap();
        engine.release_matured(start() + Duration::days(14)).unwrap();

        for (i, amount) in [6_000, 6_000, 6_000].iter().enumerate() {
            engine
                .process_billing_event(&refund(&clinic.id, &format!("re_{}", i), *amount, 20))
                .unwrap();
        }
        let total: i64 = db
            .commission_events_for_recipient(&clinic.id, &Recipient::affiliate("aff-1"))
            .unwrap()
            .iter()
            .filter(|e| e.component == CommissionComponent::Clawback)
            .map(|e| e.amount_cents)
            .sum();
        assert_eq!(total, -2_000);
    }

    #[test]
    fn test_unknown_original_payment() {
        let (db, clinic) = setup();
        let engine = CommissionEngine::new(&db, CommissionConfig::default());
        let result = engine.process_billing_event(&refund(&clinic.id, "re_1", 100, 1));
        assert!(matches!(result, Err(CommissionError::UnknownOriginalPayment(_))));
        // Nothing was recorded; a retry after the payment arrives works
        assert!(db
            .get_processed_input(crate::db::InputSource::Billing, "re_1")
            .unwrap()
            .is_none());
    }
}
