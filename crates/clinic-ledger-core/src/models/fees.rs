//! Platform fee waiver models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counting window for `FirstScripts` waivers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaiverPeriod {
    /// UTC calendar month of the script
    Monthly,
    /// Since the clinic's first script
    Lifetime,
}

/// Condition under which a fee is waived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaiverKind {
    FirstScripts { count: u32, period: WaiverPeriod },
    Provider { provider_id: String },
    Product { product_id: String },
    OrderTotalAtLeast { cents: i64 },
    /// Partial waiver of `bps` of the fee
    Discount { bps: u32 },
}

/// A clinic-scoped waiver rule, in force over `[effective_from, effective_to)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeWaiverRule {
    pub id: String,
    pub clinic_id: String,
    pub kind: WaiverKind,
    /// Lower is evaluated first
    pub priority: i32,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl FeeWaiverRule {
    pub fn new(clinic_id: &str, kind: WaiverKind, priority: i32, effective_from: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            clinic_id: clinic_id.to_string(),
            kind,
            priority,
            effective_from,
            effective_to: None,
        }
    }

    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |end| at < end)
    }
}

/// Outcome of fee evaluation for one script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeAssessment {
    pub script_id: String,
    pub clinic_id: String,
    pub gross_cents: i64,
    pub waived_cents: i64,
    pub net_cents: i64,
    /// Rule that produced the waiver, if any
    pub rule_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
