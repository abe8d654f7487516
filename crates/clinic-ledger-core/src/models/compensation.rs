//! Compensation plans, rates and commission events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Basis points in 100%.
pub const BPS_SCALE: i64 = 10_000;

/// Multiply by `numerator / denominator`, rounding half away from zero.
pub fn scale_rounded(amount: i64, numerator: i64, denominator: i64) -> i64 {
    if denominator == 0 {
        return 0;
    }
    let num = i128::from(amount) * i128::from(numerator);
    let den = i128::from(denominator);
    let quotient = num / den;
    let remainder = num % den;
    let rounded = if remainder.abs() * 2 >= den.abs() {
        quotient + num.signum() * den.signum()
    } else {
        quotient
    };
    rounded as i64
}

/// How an amount is derived from a basis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rate {
    /// Percentage of the basis in basis points (1000 = 10%)
    Percent { bps: u32 },
    /// Fixed amount per event
    Flat { cents: i64 },
    /// Percentage plus fixed amount
    Hybrid { bps: u32, cents: i64 },
}

impl Rate {
    /// Apply the rate to a basis amount in cents.
    ///
    /// Percentages round half away from zero. The flat part is negated for a
    /// negative basis so reversals mirror the original amount.
    pub fn apply(&self, basis_cents: i64) -> i64 {
        let sign = if basis_cents < 0 { -1 } else { 1 };
        match *self {
            Rate::Percent { bps } => scale_rounded(basis_cents, i64::from(bps), BPS_SCALE),
            Rate::Flat { cents } => sign * cents,
            Rate::Hybrid { bps, cents } => {
                scale_rounded(basis_cents, i64::from(bps), BPS_SCALE) + sign * cents
            }
        }
    }
}

/// Who is owed the commission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Affiliate,
    SalesRep,
    Provider,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::Affiliate => "affiliate",
            RecipientKind::SalesRep => "sales_rep",
            RecipientKind::Provider => "provider",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "affiliate" => Some(RecipientKind::Affiliate),
            "sales_rep" => Some(RecipientKind::SalesRep),
            "provider" => Some(RecipientKind::Provider),
            _ => None,
        }
    }
}

/// A commission recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub id: String,
}

impl Recipient {
    pub fn affiliate(id: &str) -> Self {
        Self { kind: RecipientKind::Affiliate, id: id.to_string() }
    }

    pub fn sales_rep(id: &str) -> Self {
        Self { kind: RecipientKind::SalesRep, id: id.to_string() }
    }

    pub fn provider(id: &str) -> Self {
        Self { kind: RecipientKind::Provider, id: id.to_string() }
    }
}

/// Affiliate referral terms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffiliateTerms {
    /// Rate on the patient's first payment
    pub initial_rate: Rate,
    /// Rate on later payments; None disables recurring commission
    pub recurring_rate: Option<Rate>,
    /// Recurring commission stops this many months after the first payment
    pub recurring_months: Option<u32>,
    /// Days a new commission is held before approval (config default if None)
    pub hold_days: Option<u32>,
    /// Days after the payment during which refunds claw back (config default if None)
    pub clawback_days: Option<u32>,
}

/// Quantity threshold bonus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiItemBonus {
    pub min_items: u32,
    pub rate: Rate,
}

/// Fixed bonus per unit of a product sold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductBonus {
    pub product_id: String,
    pub cents_per_unit: i64,
}

/// Sales-rep terms.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SalesRepTerms {
    pub base_rate: Option<Rate>,
    pub multi_item_bonus: Option<MultiItemBonus>,
    #[serde(default)]
    pub product_bonuses: Vec<ProductBonus>,
    pub hourly_rate_cents: Option<i64>,
    pub hold_days: Option<u32>,
    pub clawback_days: Option<u32>,
}

/// Provider per-script terms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderTerms {
    pub per_script: Rate,
}

/// Plan terms by recipient kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanTerms {
    Affiliate(AffiliateTerms),
    SalesRep(SalesRepTerms),
    Provider(ProviderTerms),
}

impl PlanTerms {
    pub fn recipient_kind(&self) -> RecipientKind {
        match self {
            PlanTerms::Affiliate(_) => RecipientKind::Affiliate,
            PlanTerms::SalesRep(_) => RecipientKind::SalesRep,
            PlanTerms::Provider(_) => RecipientKind::Provider,
        }
    }

    /// Hold override carried by the terms, if any.
    pub fn hold_days(&self) -> Option<u32> {
        match self {
            PlanTerms::Affiliate(t) => t.hold_days,
            PlanTerms::SalesRep(t) => t.hold_days,
            PlanTerms::Provider(_) => Some(0),
        }
    }

    /// Clawback override carried by the terms, if any.
    pub fn clawback_days(&self) -> Option<u32> {
        match self {
            PlanTerms::Affiliate(t) => t.clawback_days,
            PlanTerms::SalesRep(t) => t.clawback_days,
            PlanTerms::Provider(_) => None,
        }
    }
}

/// A versioned compensation plan in force over `[effective_from, effective_to)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensationPlan {
    pub id: String,
    pub clinic_id: String,
    pub recipient: Recipient,
    pub terms: PlanTerms,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl CompensationPlan {
    /// Create an open-ended plan; the recipient kind follows the terms.
    pub fn new(
        clinic_id: &str,
        recipient_id: &str,
        terms: PlanTerms,
        effective_from: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            clinic_id: clinic_id.to_string(),
            recipient: Recipient {
                kind: terms.recipient_kind(),
                id: recipient_id.to_string(),
            },
            terms,
            effective_from,
            effective_to: None,
        }
    }

    /// Whether the plan is in force at `at`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |end| at < end)
    }

    /// Whether two windows share any instant.
    pub fn overlaps(&self, other: &CompensationPlan) -> bool {
        let self_ends_after = other.effective_to.map_or(true, |end| self.effective_from < end);
        let other_ends_after = self.effective_to.map_or(true, |end| other.effective_from < end);
        self_ends_after && other_ends_after
    }
}

/// Which rule produced a commission event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommissionComponent {
    FirstPayment,
    Recurring,
    Base,
    MultiItemBonus,
    ProductBonus,
    Hourly,
    PerScript,
    Clawback,
}

impl CommissionComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionComponent::FirstPayment => "first_payment",
            CommissionComponent::Recurring => "recurring",
            CommissionComponent::Base => "base",
            CommissionComponent::MultiItemBonus => "multi_item_bonus",
            CommissionComponent::ProductBonus => "product_bonus",
            CommissionComponent::Hourly => "hourly",
            CommissionComponent::PerScript => "per_script",
            CommissionComponent::Clawback => "clawback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first_payment" => Some(CommissionComponent::FirstPayment),
            "recurring" => Some(CommissionComponent::Recurring),
            "base" => Some(CommissionComponent::Base),
            "multi_item_bonus" => Some(CommissionComponent::MultiItemBonus),
            "product_bonus" => Some(CommissionComponent::ProductBonus),
            "hourly" => Some(CommissionComponent::Hourly),
            "per_script" => Some(CommissionComponent::PerScript),
            "clawback" => Some(CommissionComponent::Clawback),
            _ => None,
        }
    }
}

/// Commission lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    /// Inside the hold window
    Pending,
    /// Earned, awaiting payout
    Approved,
    /// Included in a payout
    Paid,
    /// Cancelled before approval (refund during hold)
    Reversed,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::Pending => "pending",
            CommissionStatus::Approved => "approved",
            CommissionStatus::Paid => "paid",
            CommissionStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommissionStatus::Pending),
            "approved" => Some(CommissionStatus::Approved),
            "paid" => Some(CommissionStatus::Paid),
            "reversed" => Some(CommissionStatus::Reversed),
            _ => None,
        }
    }

    /// Allowed transitions: pending -> approved -> paid, pending -> reversed.
    pub fn can_transition_to(&self, next: CommissionStatus) -> bool {
        matches!(
            (self, next),
            (CommissionStatus::Pending, CommissionStatus::Approved)
                | (CommissionStatus::Pending, CommissionStatus::Reversed)
                | (CommissionStatus::Approved, CommissionStatus::Paid)
        )
    }
}

/// A ledgered monetary obligation owed to a recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommissionEvent {
    pub id: String,
    /// Unique derivation key; makes creation exactly-once
    pub event_key: String,
    pub clinic_id: String,
    pub recipient: Recipient,
    /// Billing event, script or hours entry this was derived from
    pub source_id: String,
    pub plan_id: Option<String>,
    pub component: CommissionComponent,
    pub basis_cents: i64,
    /// Negative for clawbacks
    pub amount_cents: i64,
    pub status: CommissionStatus,
    pub hold_until: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Commission event a clawback offsets
    pub reverses: Option<String>,
    pub payout_id: Option<String>,
}

/// Approved events settled together for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayoutStatement {
    pub payout_id: String,
    pub clinic_id: String,
    pub recipient: Recipient,
    /// Events strictly before this instant are included
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub lines: Vec<CommissionEvent>,
    /// Net of clawbacks
    pub total_cents: i64,
}

/// Amounts owed to a recipient, by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionBalance {
    pub pending_cents: i64,
    pub approved_cents: i64,
    pub paid_cents: i64,
    pub reversed_cents: i64,
}
