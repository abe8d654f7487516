//! Clinic and patient models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tenant clinic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Clinic {
    /// Clinic UUID
    pub id: String,
    /// Display name
    pub name: String,
    /// Prefix for patient display ids (e.g. "EON" -> "EON-000042")
    pub patient_prefix: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Clinic {
    /// Create a new clinic with a generated id.
    pub fn new(name: String, patient_prefix: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            patient_prefix,
            created_at: Utc::now(),
        }
    }
}

/// A patient record, scoped to one clinic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    /// Global UUID
    pub id: String,
    /// Owning clinic
    pub clinic_id: String,
    /// Clinic-scoped sequential number; None until allocated or backfilled
    pub patient_number: Option<i64>,
    /// Human-facing id derived from prefix and number
    pub display_id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Patient {
    /// Whether this patient has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Input for creating a patient (number is allocated by the store).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPatient {
    pub clinic_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

impl NewPatient {
    pub fn new(clinic_id: &str, first_name: &str, last_name: &str) -> Self {
        Self {
            clinic_id: clinic_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: None,
        }
    }

    /// Build the stored record once a number has been allocated.
    pub fn into_patient(self, number: Option<i64>, display_id: Option<String>) -> Patient {
        Patient {
            id: uuid::Uuid::new_v4().to_string(),
            clinic_id: self.clinic_id,
            patient_number: number,
            display_id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clinic() {
        let clinic = Clinic::new("Eon Medical".into(), "EON".into());
        assert_eq!(clinic.name, "Eon Medical");
        assert_eq!(clinic.id.len(), 36); // UUID format
    }

    #[test]
    fn test_new_patient_into_record() {
        let patient = NewPatient::new("clinic-1", "Ada", "Lovelace")
            .into_patient(Some(7), Some("PT-000007".into()));
        assert_eq!(patient.clinic_id, "clinic-1");
        assert_eq!(patient.patient_number, Some(7));
        assert_eq!(patient.full_name(), "Ada Lovelace");
        assert!(!patient.is_deleted());
    }
}
