//! Webhook ingestion for the clinic ledger.
//!
//! Translates vendor payloads (Stripe billing webhooks, pharmacy order-status
//! feeds) into the input records the commission engine consumes, and verifies
//! webhook signatures before anything is parsed.

pub mod pharmacy;
pub mod signature;
pub mod stripe;

pub use pharmacy::*;
pub use signature::*;
pub use stripe::*;

use thiserror::Error;

/// Ingestion errors.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Malformed signature header: {0}")]
    MalformedHeader(String),

    #[error("Signature does not match payload")]
    SignatureMismatch,

    #[error("Webhook timestamp {timestamp} outside tolerance")]
    TimestampOutOfTolerance { timestamp: i64 },

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

pub type IngestResult<T> = Result<T, IngestError>;

fn invalid(field: &str, reason: impl Into<String>) -> IngestError {
    IngestError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
    }
}
