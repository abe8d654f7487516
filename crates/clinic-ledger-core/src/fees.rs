//! Platform fee waivers.
//!
//! Each script may carry a per-script platform fee. Waiver rules are scoped to
//! a clinic and a time window; the first matching rule by `(priority, id)`
//! decides how much of the fee is waived.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FeeConfig;
use crate::db::{Database, DbError};
use crate::models::{
    scale_rounded, FeeAssessment, FeeWaiverRule, PrescriptionEvent, WaiverKind, WaiverPeriod,
    BPS_SCALE,
};

/// Fee evaluation errors.
#[derive(Error, Debug)]
pub enum FeeError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<rusqlite::Error> for FeeError {
    fn from(e: rusqlite::Error) -> Self {
        FeeError::Database(DbError::Sqlite(e))
    }
}

pub type FeeResult<T> = Result<T, FeeError>;

/// Scripts the clinic was already assessed for before this one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorScripts {
    /// In the UTC calendar month of the script
    pub this_month: i64,
    pub lifetime: i64,
}

impl PriorScripts {
    fn in_period(&self, period: WaiverPeriod) -> i64 {
        match period {
            WaiverPeriod::Monthly => self.this_month,
            WaiverPeriod::Lifetime => self.lifetime,
        }
    }
}

/// Start of the UTC calendar month containing `at`.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(at.year(), at.month(), 1)
        .unwrap_or_else(|| at.date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Start of the month after the one containing `at`.
pub fn next_month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = match at.month() {
        12 => (at.year() + 1, 1),
        m => (at.year(), m + 1),
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map_or(at, |d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Whether a rule's condition holds for a script.
fn matches(kind: &WaiverKind, event: &PrescriptionEvent, prior: &PriorScripts) -> bool {
    match kind {
        WaiverKind::FirstScripts { count, period } => prior.in_period(*period) < i64::from(*count),
        WaiverKind::Provider { provider_id } => &event.provider_id == provider_id,
        WaiverKind::Product { product_id } => event.product_ids.iter().any(|p| p == product_id),
        WaiverKind::OrderTotalAtLeast { cents } => event.order_amount_cents >= *cents,
        WaiverKind::Discount { .. } => true,
    }
}

fn waived_by(kind: &WaiverKind, gross_cents: i64) -> i64 {
    match kind {
        WaiverKind::Discount { bps } => {
            scale_rounded(gross_cents, i64::from(*bps), BPS_SCALE).clamp(0, gross_cents)
        }
        _ => gross_cents,
    }
}

/// Evaluate the waiver for one script.
///
/// Rules of other clinics or not in force at the script's time are ignored.
pub fn evaluate(
    rules: &[FeeWaiverRule],
    event: &PrescriptionEvent,
    gross_cents: i64,
    prior: PriorScripts,
) -> FeeAssessment {
    let mut candidates: Vec<&FeeWaiverRule> = rules
        .iter()
        .filter(|r| r.clinic_id == event.clinic_id && r.covers(event.occurred_at))
        .collect();
    candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let rule = candidates
        .into_iter()
        .find(|r| matches(&r.kind, event, &prior));
    let waived_cents = match (rule, gross_cents > 0) {
        (Some(rule), true) => waived_by(&rule.kind, gross_cents),
        _ => 0,
    };

    FeeAssessment {
        script_id: event.script_id.clone(),
        clinic_id: event.clinic_id.clone(),
        gross_cents,
        waived_cents,
        net_cents: gross_cents - waived_cents,
        rule_id: rule.filter(|_| waived_cents > 0).map(|r| r.id.clone()),
        occurred_at: event.occurred_at,
    }
}

/// Persists fee assessments against the stored waiver rules.
pub struct FeeEngine<'a> {
    db: &'a Database,
    config: FeeConfig,
}

impl<'a> FeeEngine<'a> {
    pub fn new(db: &'a Database, config: FeeConfig) -> Self {
        Self { db, config }
    }

    /// Store a waiver rule.
    pub fn add_rule(&self, rule: &FeeWaiverRule) -> FeeResult<()> {
        match &rule.kind {
            WaiverKind::Discount { bps } if *bps > 10_000 => {
                return Err(FeeError::InvalidRule(format!("discount of {} bps exceeds 100%", bps)));
            }
            WaiverKind::FirstScripts { count: 0, .. } => {
                return Err(FeeError::InvalidRule("first-scripts waiver with count 0".into()));
            }
            _ => {}
        }
        if rule.effective_to.is_some_and(|end| end <= rule.effective_from) {
            return Err(FeeError::InvalidRule(
                "effective_to must be after effective_from".into(),
            ));
        }
        self.db.insert_fee_rule(rule)?;
        info!(rule_id = %rule.id, clinic_id = %rule.clinic_id, priority = rule.priority, "Added fee waiver rule");
        Ok(())
    }

    /// Assess the platform fee for a script, once.
    ///
    /// A script assessed before gets its stored assessment back unchanged.
    pub fn assess_script(&self, event: &PrescriptionEvent) -> FeeResult<FeeAssessment> {
        if event.order_amount_cents < 0 {
            return Err(FeeError::InvalidInput(format!(
                "script {} has a negative order amount",
                event.script_id
            )));
        }

        let tx = self.db.begin_immediate()?;
        if let Some(existing) = self.db.get_fee_assessment(&event.script_id)? {
            debug!(script_id = %event.script_id, "Script already assessed");
            return Ok(existing);
        }

        // Every stored assessment counts, whatever order scripts arrive in
        let month = month_start(event.occurred_at);
        let prior = PriorScripts {
            this_month: self
                .db
                .count_fee_assessments(&event.clinic_id, Some((&month, &next_month_start(month))))?,
            lifetime: self.db.count_fee_assessments(&event.clinic_id, None)?,
        };
        let rules = self.db.fee_rules_in_force(&event.clinic_id, &event.occurred_at)?;
        let assessment = evaluate(&rules, event, self.config.per_script_fee_cents, prior);
        self.db.insert_fee_assessment(&assessment)?;
        tx.commit()?;

        if assessment.waived_cents > 0 {
            info!(
                script_id = %event.script_id,
                rule_id = ?assessment.rule_id,
                waived_cents = assessment.waived_cents,
                "Waived platform fee"
            );
        }
        Ok(assessment)
    }
}
