//! Stripe webhook events to billing events.
//!
//! Only the shape the ledger needs is read. Clinic, patient and attribution
//! ids travel in `metadata`, set when the invoice or charge was created.

use chrono::{DateTime, Utc};
use clinic_ledger_core::models::{Attribution, BillingEvent, BillingEventKind, BillingLineItem};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{invalid, IngestError, IngestResult};

/// Webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

/// Translate a webhook body into a billing event.
///
/// Event types the ledger does not track return `Ok(None)`.
pub fn parse_stripe_event(json: &str) -> IngestResult<Option<BillingEvent>> {
    let event: StripeEvent = serde_json::from_str(json)?;
    let object = event
        .data
        .object
        .as_object()
        .ok_or_else(|| invalid("data.object", "not an object"))?;

    let billing = match event.event_type.as_str() {
        "invoice.paid" => Some(invoice_paid(&event, object)?),
        "charge.refunded" => Some(charge_refunded(&event, object)?),
        "charge.dispute.created" => Some(dispute_created(&event, object)?),
        other => {
            debug!(event_id = %event.id, event_type = other, "Ignoring Stripe event");
            None
        }
    };
    Ok(billing)
}

fn invoice_paid(event: &StripeEvent, invoice: &Map<String, Value>) -> IngestResult<BillingEvent> {
    let metadata = metadata(invoice)?;
    let paid_at = invoice
        .get("status_transitions")
        .and_then(|t| t.get("paid_at"))
        .and_then(Value::as_i64)
        .unwrap_or(event.created);

    let line_items = match invoice.get("lines").and_then(|l| l.get("data")) {
        Some(Value::Array(lines)) => lines.iter().map(invoice_line).collect::<IngestResult<Vec<_>>>()?,
        _ => Vec::new(),
    };

    Ok(BillingEvent {
        event_id: required_str(invoice, "id")?,
        clinic_id: required_str(metadata, "clinic_id")?,
        patient_id: required_str(metadata, "patient_id")?,
        kind: BillingEventKind::Payment,
        amount_cents: amount(invoice, "amount_paid")?,
        occurred_at: timestamp("status_transitions.paid_at", paid_at)?,
        line_items,
        attribution: Attribution {
            affiliate_id: optional_str(metadata, "affiliate_id"),
            sales_rep_id: optional_str(metadata, "sales_rep_id"),
        },
    })
}

fn invoice_line(line: &Value) -> IngestResult<BillingLineItem> {
    let line = line.as_object().ok_or_else(|| invalid("lines.data", "not an object"))?;
    let quantity = line.get("quantity").and_then(Value::as_u64).unwrap_or(1).max(1);
    let quantity = u32::try_from(quantity).map_err(|_| invalid("quantity", "too large"))?;
    let price = line.get("price").and_then(Value::as_object);

    let product_id = price
        .and_then(|p| optional_str(p, "product"))
        .ok_or_else(|| IngestError::MissingField("lines.data.price.product".into()))?;
    let unit_amount_cents = match price.and_then(|p| p.get("unit_amount")).and_then(Value::as_i64) {
        Some(unit) => unit,
        None => amount(line, "amount")? / i64::from(quantity),
    };

    Ok(BillingLineItem {
        product_id,
        description: optional_str(line, "description").unwrap_or_default(),
        quantity,
        unit_amount_cents,
    })
}

/// `amount_refunded` is cumulative across a charge's refunds, so the newest
/// refund object is used when present.
fn charge_refunded(event: &StripeEvent, charge: &Map<String, Value>) -> IngestResult<BillingEvent> {
    let metadata = metadata(charge)?;
    let latest = charge
        .get("refunds")
        .and_then(|r| r.get("data"))
        .and_then(Value::as_array)
        .and_then(|refunds| refunds.first())
        .and_then(Value::as_object);

    let (event_id, amount_cents, created) = match latest {
        Some(refund) => (
            required_str(refund, "id")?,
            amount(refund, "amount")?,
            refund.get("created").and_then(Value::as_i64).unwrap_or(event.created),
        ),
        None => (event.id.clone(), amount(charge, "amount_refunded")?, event.created),
    };

    Ok(BillingEvent {
        event_id,
        clinic_id: required_str(metadata, "clinic_id")?,
        patient_id: required_str(metadata, "patient_id")?,
        kind: BillingEventKind::Refund {
            original_event_id: original_invoice(charge, metadata)?,
        },
        amount_cents,
        occurred_at: timestamp("created", created)?,
        line_items: Vec::new(),
        attribution: Attribution::default(),
    })
}

fn dispute_created(event: &StripeEvent, dispute: &Map<String, Value>) -> IngestResult<BillingEvent> {
    let metadata = metadata(dispute)?;
    let created = dispute.get("created").and_then(Value::as_i64).unwrap_or(event.created);

    Ok(BillingEvent {
        event_id: required_str(dispute, "id")?,
        clinic_id: required_str(metadata, "clinic_id")?,
        patient_id: required_str(metadata, "patient_id")?,
        kind: BillingEventKind::Chargeback {
            original_event_id: original_invoice(dispute, metadata)?,
        },
        amount_cents: amount(dispute, "amount")?,
        occurred_at: timestamp("created", created)?,
        line_items: Vec::new(),
        attribution: Attribution::default(),
    })
}

/// Invoice the charge paid; disputes carry it in metadata.
fn original_invoice(object: &Map<String, Value>, metadata: &Map<String, Value>) -> IngestResult<String> {
    optional_str(object, "invoice")
        .or_else(|| optional_str(metadata, "invoice_id"))
        .ok_or_else(|| IngestError::MissingField("invoice".into()))
}

fn metadata(object: &Map<String, Value>) -> IngestResult<&Map<String, Value>> {
    object
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| IngestError::MissingField("metadata".into()))
}

fn optional_str(object: &Map<String, Value>, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_str(object: &Map<String, Value>, field: &str) -> IngestResult<String> {
    optional_str(object, field).ok_or_else(|| IngestError::MissingField(field.to_string()))
}

fn amount(object: &Map<String, Value>, field: &str) -> IngestResult<i64> {
    let value = object
        .get(field)
        .ok_or_else(|| IngestError::MissingField(field.to_string()))?;
    match value.as_i64() {
        Some(cents) if cents >= 0 => Ok(cents),
        _ => Err(invalid(field, "expected non-negative integer cents")),
    }
}

fn timestamp(field: &str, secs: i64) -> IngestResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| invalid(field, "timestamp out of range"))
}
