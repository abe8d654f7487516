//! Pure commission arithmetic; no storage access.

use std::collections::BTreeMap;

use chrono::{DateTime, Months, Utc};

use crate::models::{
    scale_rounded, AffiliateTerms, BillingEvent, CommissionComponent, SalesRepTerms,
};

/// A commission amount before it is ledgered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionDraft {
    pub component: CommissionComponent,
    /// Separates several events of one component (product id for product bonuses)
    pub discriminator: Option<String>,
    pub basis_cents: i64,
    pub amount_cents: i64,
}

impl CommissionDraft {
    fn new(component: CommissionComponent, basis_cents: i64, amount_cents: i64) -> Self {
        Self {
            component,
            discriminator: None,
            basis_cents,
            amount_cents,
        }
    }
}

/// Whether a payment still earns recurring commission.
///
/// `months = None` means no limit. The window is measured in calendar months
/// from the first payment, exclusive at the end.
pub fn within_recurring_window(
    first_payment_at: DateTime<Utc>,
    occurred_at: DateTime<Utc>,
    months: Option<u32>,
) -> bool {
    match months {
        None => true,
        Some(n) => match first_payment_at.checked_add_months(Months::new(n)) {
            Some(end) => occurred_at < end,
            None => true,
        },
    }
}

/// Affiliate commission on one payment.
///
/// `first_payment_at` is the patient's earliest processed payment, or None if
/// this payment is the first.
pub fn affiliate_drafts(
    terms: &AffiliateTerms,
    amount_cents: i64,
    occurred_at: DateTime<Utc>,
    first_payment_at: Option<DateTime<Utc>>,
) -> Vec<CommissionDraft> {
    let draft = match first_payment_at {
        None => Some(CommissionDraft::new(
            CommissionComponent::FirstPayment,
            amount_cents,
            terms.initial_rate.apply(amount_cents),
        )),
        Some(first) => terms
            .recurring_rate
            .filter(|_| within_recurring_window(first, occurred_at, terms.recurring_months))
            .map(|rate| {
                CommissionDraft::new(
                    CommissionComponent::Recurring,
                    amount_cents,
                    rate.apply(amount_cents),
                )
            }),
    };
    draft.into_iter().filter(|d| d.amount_cents != 0).collect()
}

/// Sales-rep base, multi-item and product bonuses on one payment.
pub fn sales_rep_drafts(terms: &SalesRepTerms, event: &BillingEvent) -> Vec<CommissionDraft> {
    let amount = event.amount_cents;
    let mut drafts = Vec::new();

    if let Some(rate) = terms.base_rate {
        drafts.push(CommissionDraft::new(
            CommissionComponent::Base,
            amount,
            rate.apply(amount),
        ));
    }

    if let Some(bonus) = &terms.multi_item_bonus {
        if event.item_count() >= bonus.min_items {
            drafts.push(CommissionDraft::new(
                CommissionComponent::MultiItemBonus,
                amount,
                bonus.rate.apply(amount),
            ));
        }
    }

    // One event per product, even when it appears on several lines
    let mut units: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    for item in &event.line_items {
        let entry = units.entry(item.product_id.as_str()).or_insert((0, 0));
        entry.0 += i64::from(item.quantity);
        entry.1 += item.total_cents();
    }
    for bonus in &terms.product_bonuses {
        if let Some((quantity, line_total)) = units.get(bonus.product_id.as_str()) {
            drafts.push(CommissionDraft {
                component: CommissionComponent::ProductBonus,
                discriminator: Some(bonus.product_id.clone()),
                basis_cents: *line_total,
                amount_cents: quantity * bonus.cents_per_unit,
            });
        }
    }

    drafts.retain(|d| d.amount_cents != 0);
    drafts
}

/// Hourly credit for `minutes` at `hourly_rate_cents`, rounded to the cent.
pub fn hourly_amount(hourly_rate_cents: i64, minutes: u32) -> i64 {
    scale_rounded(i64::from(minutes), hourly_rate_cents, 60)
}

/// Share of a refunded payment as `(numerator, denominator)`, capped at 1.
pub fn refund_fraction(refund_cents: i64, original_cents: i64) -> (i64, i64) {
    if original_cents <= 0 || refund_cents >= original_cents {
        (1, 1)
    } else {
        (refund_cents.max(0), original_cents)
    }
}

/// Negative clawback for `fraction` of `original_amount`.
///
/// `already_clawed` is the (non-positive) sum of earlier clawbacks; the total
/// never exceeds the original amount.
pub fn clawback_amount(original_amount: i64, already_clawed: i64, fraction: (i64, i64)) -> i64 {
    let wanted = scale_rounded(original_amount, fraction.0, fraction.1);
    let remaining = (original_amount + already_clawed).max(0);
    -(wanted.min(remaining).max(0))
}
