//! Versioned compensation plans.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::{CompensationPlan, Recipient};

use super::{CommissionEngine, CommissionError, CommissionResult};

impl<'a> CommissionEngine<'a> {
    /// Publish a new plan version for a recipient.
    ///
    /// An open-ended predecessor that starts earlier is closed at the new
    /// plan's `effective_from`; any other overlap is rejected.
    pub fn publish_plan(&self, plan: &CompensationPlan) -> CommissionResult<()> {
        if plan.recipient.kind != plan.terms.recipient_kind() {
            return Err(CommissionError::InvalidPlan(format!(
                "{} terms for a {} recipient",
                plan.terms.recipient_kind().as_str(),
                plan.recipient.kind.as_str()
            )));
        }
        if plan.effective_to.is_some_and(|end| end <= plan.effective_from) {
            return Err(CommissionError::InvalidPlan(
                "effective_to must be after effective_from".into(),
            ));
        }

        let tx = self.db.begin_immediate()?;
        let mut to_close = None;
        for existing in self.db.plans_for_recipient(&plan.clinic_id, &plan.recipient)? {
            if !existing.overlaps(plan) {
                continue;
            }
            let supersedable =
                existing.effective_to.is_none() && existing.effective_from < plan.effective_from;
            if supersedable && to_close.is_none() {
                to_close = Some(existing.id);
            } else {
                return Err(CommissionError::OverlappingPlan {
                    plan_id: plan.id.clone(),
                    existing_id: existing.id,
                });
            }
        }

        if let Some(previous) = &to_close {
            self.db.close_plan(previous, &plan.effective_from)?;
        }
        self.db.insert_plan(plan)?;
        tx.commit()?;

        info!(
            plan_id = %plan.id,
            clinic_id = %plan.clinic_id,
            recipient_kind = plan.recipient.kind.as_str(),
            recipient_id = %plan.recipient.id,
            superseded = ?to_close,
            "Published compensation plan"
        );
        Ok(())
    }

    /// The plan in force for a recipient at `at`.
    pub fn plan_for(
        &self,
        clinic_id: &str,
        recipient: &Recipient,
        at: DateTime<Utc>,
    ) -> CommissionResult<Option<CompensationPlan>> {
        Ok(self.db.plan_in_force(clinic_id, recipient, &at)?)
    }
}
