//! Billing, prescription and timesheet inputs handed to the commission engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// What kind of money movement a billing event represents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEventKind {
    /// Successful payment (first or recurring)
    Payment,
    /// Full or partial refund of an earlier payment
    Refund { original_event_id: String },
    /// Dispute lost; treated as a full reversal
    Chargeback { original_event_id: String },
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventKind::Payment => "payment",
            BillingEventKind::Refund { .. } => "refund",
            BillingEventKind::Chargeback { .. } => "chargeback",
        }
    }

    /// The payment this event reverses, if any.
    pub fn original_event_id(&self) -> Option<&str> {
        match self {
            BillingEventKind::Payment => None,
            BillingEventKind::Refund { original_event_id }
            | BillingEventKind::Chargeback { original_event_id } => Some(original_event_id),
        }
    }
}

/// Who referred or sold the patient.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribution {
    pub affiliate_id: Option<String>,
    pub sales_rep_id: Option<String>,
}

/// One invoice line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingLineItem {
    pub product_id: String,
    pub description: String,
    pub quantity: u32,
    pub unit_amount_cents: i64,
}

impl BillingLineItem {
    pub fn total_cents(&self) -> i64 {
        self.unit_amount_cents * i64::from(self.quantity)
    }
}

/// A ledger-relevant billing event (payment, refund, chargeback).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingEvent {
    /// Upstream id (e.g. invoice or charge id); the idempotency key
    pub event_id: String,
    pub clinic_id: String,
    pub patient_id: String,
    pub kind: BillingEventKind,
    /// Amount paid, or amount refunded for refunds. Always non-negative.
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub line_items: Vec<BillingLineItem>,
    #[serde(default)]
    pub attribution: Attribution,
}

impl BillingEvent {
    /// Create a payment event with no line items or attribution.
    pub fn payment(
        event_id: &str,
        clinic_id: &str,
        patient_id: &str,
        amount_cents: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            clinic_id: clinic_id.to_string(),
            patient_id: patient_id.to_string(),
            kind: BillingEventKind::Payment,
            amount_cents,
            occurred_at,
            line_items: Vec::new(),
            attribution: Attribution::default(),
        }
    }

    /// Sum of line-item quantities.
    pub fn item_count(&self) -> u32 {
        self.line_items.iter().map(|item| item.quantity).sum()
    }
}

/// A prescription sent to the pharmacy, the unit of provider pay and platform fees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrescriptionEvent {
    /// Pharmacy order / script id; the idempotency key
    pub script_id: String,
    pub clinic_id: String,
    pub provider_id: String,
    pub patient_id: String,
    #[serde(default)]
    pub product_ids: Vec<String>,
    pub order_amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Time worked by a sales rep, credited at the hourly rate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoursEntry {
    pub entry_id: String,
    pub clinic_id: String,
    pub sales_rep_id: String,
    pub work_date: NaiveDate,
    pub minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_count_sums_quantities() {
        let mut event = BillingEvent::payment("inv_1", "c1", "p1", 30_000, Utc::now());
        event.line_items = vec![
            BillingLineItem {
                product_id: "sema".into(),
                description: "Semaglutide".into(),
                quantity: 2,
                unit_amount_cents: 10_000,
            },
            BillingLineItem {
                product_id: "b12".into(),
                description: "B12".into(),
                quantity: 1,
                unit_amount_cents: 10_000,
            },
        ];
        assert_eq!(event.item_count(), 3);
        assert_eq!(event.line_items[0].total_cents(), 20_000);
    }

    #[test]
    fn test_kind_serializes_tagged() {
        let kind = BillingEventKind::Refund {
            original_event_id: "inv_1".into(),
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"type":"refund","original_event_id":"inv_1"}"#);
        assert_eq!(kind.original_event_id(), Some("inv_1"));
        assert_eq!(BillingEventKind::Payment.original_event_id(), None);
    }
}
