//! Refill queue models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Refill lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefillStatus {
    /// Waiting for its due date
    Scheduled,
    /// Due; waiting for the patient's payment
    PendingPayment,
    /// Paid; waiting for provider sign-off
    PendingProvider,
    /// Provider approved; sent on
    Approved,
    Cancelled,
}

impl RefillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefillStatus::Scheduled => "scheduled",
            RefillStatus::PendingPayment => "pending_payment",
            RefillStatus::PendingProvider => "pending_provider",
            RefillStatus::Approved => "approved",
            RefillStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(RefillStatus::Scheduled),
            "pending_payment" => Some(RefillStatus::PendingPayment),
            "pending_provider" => Some(RefillStatus::PendingProvider),
            "approved" => Some(RefillStatus::Approved),
            "cancelled" => Some(RefillStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RefillStatus::Approved | RefillStatus::Cancelled)
    }
}

/// A scheduled renewal of a recurring prescription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefillEntry {
    pub id: String,
    pub clinic_id: String,
    pub patient_id: String,
    /// Upstream prescription this renews
    pub prescription_ref: String,
    pub interval_days: u32,
    pub due_at: DateTime<Utc>,
    /// Further refills after this one
    pub remaining_refills: u32,
    pub status: RefillStatus,
    pub approved_by: Option<String>,
    pub cancel_reason: Option<String>,
    /// Entry this one was scheduled from
    pub previous_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for scheduling a refill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRefill {
    pub clinic_id: String,
    pub patient_id: String,
    pub prescription_ref: String,
    pub interval_days: u32,
    pub due_at: DateTime<Utc>,
    pub remaining_refills: u32,
}

impl RefillEntry {
    pub fn from_new(new: NewRefill) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            clinic_id: new.clinic_id,
            patient_id: new.patient_id,
            prescription_ref: new.prescription_ref,
            interval_days: new.interval_days,
            due_at: new.due_at,
            remaining_refills: new.remaining_refills,
            status: RefillStatus::Scheduled,
            approved_by: None,
            cancel_reason: None,
            previous_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The entry that follows this one, if refills remain.
    pub fn next_refill(&self) -> Option<RefillEntry> {
        if self.remaining_refills == 0 {
            return None;
        }
        let now = Utc::now();
        Some(RefillEntry {
            id: uuid::Uuid::new_v4().to_string(),
            clinic_id: self.clinic_id.clone(),
            patient_id: self.patient_id.clone(),
            prescription_ref: self.prescription_ref.clone(),
            interval_days: self.interval_days,
            due_at: self.due_at + Duration::days(i64::from(self.interval_days)),
            remaining_refills: self.remaining_refills - 1,
            status: RefillStatus::Scheduled,
            approved_by: None,
            cancel_reason: None,
            previous_id: Some(self.id.clone()),
            created_at: now,
            updated_at: now,
        })
    }
}
