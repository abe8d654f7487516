//! Audit ledger models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What was done to a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Export,
    Login,
    Logout,
    PrescriptionSent,
    PaymentProcessed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Read => "read",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Export => "export",
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::PrescriptionSent => "prescription_sent",
            AuditAction::PaymentProcessed => "payment_processed",
        }
    }
}

/// An event to be appended to the audit ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub clinic_id: Option<String>,
    pub actor_id: String,
    pub actor_role: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    /// Patient whose PHI was touched, for accounting of disclosures
    pub patient_id: Option<String>,
    pub phi_accessed: bool,
    pub ip_address: Option<String>,
    /// Free-form context; must not contain PHI values
    pub details: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    /// Caller-supplied key; a repeated key returns the original receipt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl AuditEvent {
    /// Minimal event; remaining fields can be set directly.
    pub fn new(actor_id: &str, action: AuditAction, resource_type: &str) -> Self {
        Self {
            clinic_id: None,
            actor_id: actor_id.to_string(),
            actor_role: "system".to_string(),
            action,
            resource_type: resource_type.to_string(),
            resource_id: None,
            patient_id: None,
            phi_accessed: false,
            ip_address: None,
            details: serde_json::Value::Null,
            occurred_at: Utc::now(),
            idempotency_key: None,
        }
    }

    /// Mark the event as touching a patient's PHI.
    pub fn for_patient(mut self, clinic_id: &str, patient_id: &str) -> Self {
        self.clinic_id = Some(clinic_id.to_string());
        self.patient_id = Some(patient_id.to_string());
        self.resource_id = Some(patient_id.to_string());
        self.phi_accessed = true;
        self
    }
}

/// A persisted, chained ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// 1-based, contiguous
    pub sequence: i64,
    pub prev_hash: String,
    pub entry_hash: String,
    pub event: AuditEvent,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_patient_marks_phi() {
        let event = AuditEvent::new("user-1", AuditAction::Read, "patient").for_patient("c1", "p1");
        assert!(event.phi_accessed);
        assert_eq!(event.patient_id.as_deref(), Some("p1"));
        assert_eq!(event.resource_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_idempotency_key_omitted_when_absent() {
        let event = AuditEvent::new("user-1", AuditAction::Login, "session");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("idempotency_key"));
    }
}
