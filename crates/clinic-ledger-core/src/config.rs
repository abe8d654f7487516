//! Ledger configuration loading.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Audit ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Installation identifier stamped on compliance exports
    pub system_id: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            system_id: "clinic-ledger".to_string(),
        }
    }
}

/// Defaults applied when a plan carries no override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommissionConfig {
    /// Days a new commission waits before approval
    pub default_hold_days: u32,
    /// Days after a payment during which refunds claw back paid commission
    pub default_clawback_days: u32,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            default_hold_days: 14,
            default_clawback_days: 90,
        }
    }
}

/// Patient number formatting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NumberingConfig {
    /// Zero-padded digits in display ids
    pub width: usize,
    /// Prefix used when a clinic has none
    pub default_prefix: String,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            width: 6,
            default_prefix: "PT".to_string(),
        }
    }
}

/// Platform fee settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeeConfig {
    /// Fee charged per script; 0 disables fees
    pub per_script_fee_cents: i64,
}

/// Complete ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub audit: AuditConfig,
    pub commissions: CommissionConfig,
    pub numbering: NumberingConfig,
    pub fees: FeeConfig,
}

impl LedgerConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}
