//! Pharmacy order-status payloads to prescription events.
//!
//! Pharmacy feeds disagree on field names, so both camelCase and snake_case
//! spellings are accepted. Totals arrive either as integer cents or as a
//! decimal dollar amount.

use chrono::{DateTime, Utc};
use clinic_ledger_core::models::PrescriptionEvent;
use serde::Deserialize;
use serde_json::Value;

use crate::{invalid, IngestError, IngestResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PharmacyOrder {
    #[serde(alias = "order_id")]
    order_id: String,
    #[serde(alias = "clinic_id", alias = "practiceId", alias = "practice_id")]
    clinic_id: String,
    #[serde(alias = "prescriber_id", alias = "providerId", alias = "provider_id")]
    prescriber_id: String,
    #[serde(alias = "patient_id")]
    patient_id: String,
    #[serde(default)]
    items: Vec<PharmacyItem>,
    #[serde(alias = "total_cents")]
    total_cents: Option<i64>,
    #[serde(alias = "order_total")]
    order_total: Option<Value>,
    #[serde(alias = "created_at", alias = "createdAt")]
    timestamp: DateTime<Utc>,
}

/// Quantities are not read; fees and commissions key on the product alone.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PharmacyItem {
    #[serde(alias = "product_id", alias = "sku")]
    product_id: String,
}

/// Translate a pharmacy order into a prescription event.
///
/// Each product appears once in `product_ids`, in order of first mention.
pub fn parse_pharmacy_order(json: &str) -> IngestResult<PrescriptionEvent> {
    let order: PharmacyOrder = serde_json::from_str(json)?;

    let order_amount_cents = match (order.total_cents, &order.order_total) {
        (Some(cents), _) if cents < 0 => return Err(invalid("totalCents", "negative")),
        (Some(cents), _) => cents,
        (None, Some(total)) => decimal_to_cents(total)?,
        (None, None) => return Err(IngestError::MissingField("orderTotal".into())),
    };

    let mut product_ids: Vec<String> = Vec::with_capacity(order.items.len());
    for item in order.items {
        if !product_ids.contains(&item.product_id) {
            product_ids.push(item.product_id);
        }
    }

    Ok(PrescriptionEvent {
        script_id: order.order_id,
        clinic_id: order.clinic_id,
        provider_id: order.prescriber_id,
        patient_id: order.patient_id,
        product_ids,
        order_amount_cents,
        occurred_at: order.timestamp,
    })
}

/// Exact decimal dollars to cents; more than two fractional digits is an error.
fn decimal_to_cents(total: &Value) -> IngestResult<i64> {
    let text = match total {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(invalid("orderTotal", "expected a decimal amount")),
    };
    let bad = || invalid("orderTotal", format!("not a dollar amount: {}", text));

    let (dollars, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));
    if dollars.is_empty()
        || fraction.len() > 2
        || !dollars.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(bad());
    }

    let dollars: i64 = dollars.parse().map_err(|_| bad())?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| bad())? * 10,
        _ => fraction.parse().map_err(|_| bad())?,
    };
    dollars
        .checked_mul(100)
        .and_then(|d| d.checked_add(cents))
        .ok_or_else(bad)
}
