//! Commission calculation engine.
//!
//! Billing events, prescriptions and timesheet entries are turned into
//! ledgered [`CommissionEvent`](crate::models::CommissionEvent)s under the
//! compensation plan in force when the input occurred. Every input is
//! processed exactly once; refunds and chargebacks reverse or claw back what
//! the original payment earned.

mod calculate;
mod clawback;
mod engine;
mod plans;

pub use calculate::*;
pub use engine::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;
use crate::models::{CommissionComponent, CommissionEvent, Recipient};

/// Commission engine errors.
#[derive(Error, Debug)]
pub enum CommissionError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plan {plan_id} overlaps existing plan {existing_id}")]
    OverlappingPlan { plan_id: String, existing_id: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown original payment: {0}")]
    UnknownOriginalPayment(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<rusqlite::Error> for CommissionError {
    fn from(e: rusqlite::Error) -> Self {
        CommissionError::Database(DbError::Sqlite(e))
    }
}

pub type CommissionResult<T> = Result<T, CommissionError>;

/// What processing an input did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessingOutcome {
    /// First time this input was seen
    Processed(ProcessingSummary),
    /// Already processed; nothing written
    Duplicate,
}

impl ProcessingOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ProcessingOutcome::Duplicate)
    }

    /// Events created, empty for duplicates.
    pub fn created(&self) -> &[CommissionEvent] {
        match self {
            ProcessingOutcome::Processed(summary) => &summary.created,
            ProcessingOutcome::Duplicate => &[],
        }
    }
}

/// Effects of one processed input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    /// New commission and clawback events
    pub created: Vec<CommissionEvent>,
    /// Pending events moved to reversed
    pub reversed: Vec<String>,
    /// Paid or approved events outside their clawback window
    pub outside_window: Vec<String>,
}

/// Derivation key that makes each commission event exactly-once.
///
/// `{source}:{recipient_kind}:{recipient_id}:{component}[:{discriminator}]`
pub fn event_key(
    source_id: &str,
    recipient: &Recipient,
    component: CommissionComponent,
    discriminator: Option<&str>,
) -> String {
    let mut key = format!(
        "{}:{}:{}:{}",
        source_id,
        recipient.kind.as_str(),
        recipient.id,
        component.as_str()
    );
    if let Some(extra) = discriminator {
        key.push(':');
        key.push_str(extra);
    }
    key
}
