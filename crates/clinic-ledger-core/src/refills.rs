//! Refill queue.
//!
//! ```text
//! Scheduled ──due──▶ PendingPayment ──paid──▶ PendingProvider ──approve──▶ Approved
//!     │                    │                        │                        │
//!     └────────────────────┴──────── cancel ────────┘                 next refill
//!                                       ▼                            (Scheduled)
//!                                   Cancelled
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{Database, DbError};
use crate::models::{NewRefill, RefillEntry, RefillStatus};

/// Refill queue errors.
#[derive(Error, Debug)]
pub enum RefillError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Refill not found: {0}")]
    NotFound(String),

    #[error("Refill {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<rusqlite::Error> for RefillError {
    fn from(e: rusqlite::Error) -> Self {
        RefillError::Database(DbError::Sqlite(e))
    }
}

pub type RefillResult<T> = Result<T, RefillError>;

/// Result of approving a refill.
#[derive(Debug, Clone, PartialEq)]
pub struct RefillApproval {
    pub approved: RefillEntry,
    /// Successor entry, when refills remain
    pub next: Option<RefillEntry>,
}

/// Refill queue over one database.
pub struct RefillQueue<'a> {
    db: &'a Database,
}

impl<'a> RefillQueue<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Add a refill in `Scheduled`.
    pub fn schedule(&self, new: NewRefill) -> RefillResult<RefillEntry> {
        if new.interval_days == 0 {
            return Err(RefillError::InvalidInput("interval_days must be positive".into()));
        }
        let entry = RefillEntry::from_new(new);
        self.db.insert_refill(&entry)?;
        info!(refill_id = %entry.id, clinic_id = %entry.clinic_id, due_at = %entry.due_at, "Scheduled refill");
        Ok(entry)
    }

    /// Move entries due by `now` to `PendingPayment`. Returns the count.
    pub fn promote_due(&self, now: DateTime<Utc>) -> RefillResult<usize> {
        let promoted = self.db.promote_due_refills(&now)?;
        if promoted > 0 {
            info!(promoted, "Refills due for payment");
        }
        Ok(promoted)
    }

    /// Payment received: `PendingPayment` to `PendingProvider`.
    pub fn record_payment(&self, id: &str) -> RefillResult<RefillEntry> {
        self.transition(id, RefillStatus::PendingPayment, RefillStatus::PendingProvider, None, None)
    }

    /// Provider sign-off. Schedules the next refill when any remain.
    pub fn approve(&self, id: &str, provider_id: &str) -> RefillResult<RefillApproval> {
        let tx = self.db.begin_immediate()?;
        let approved = self.transition(
            id,
            RefillStatus::PendingProvider,
            RefillStatus::Approved,
            Some(provider_id),
            None,
        )?;
        let next = approved.next_refill();
        if let Some(next) = &next {
            self.db.insert_refill(next)?;
        }
        tx.commit()?;

        info!(
            refill_id = %id,
            provider_id,
            next_refill_id = ?next.as_ref().map(|n| n.id.as_str()),
            "Approved refill"
        );
        Ok(RefillApproval { approved, next })
    }

    /// Cancel an entry that is not yet approved or cancelled.
    pub fn cancel(&self, id: &str, reason: &str) -> RefillResult<RefillEntry> {
        let current = self.require(id)?;
        if current.status.is_terminal() {
            return Err(RefillError::InvalidTransition {
                id: id.to_string(),
                from: current.status.as_str(),
                to: RefillStatus::Cancelled.as_str(),
            });
        }
        let cancelled =
            self.transition(id, current.status, RefillStatus::Cancelled, None, Some(reason))?;
        info!(refill_id = %id, "Cancelled refill");
        Ok(cancelled)
    }

    pub fn get(&self, id: &str) -> RefillResult<Option<RefillEntry>> {
        Ok(self.db.get_refill(id)?)
    }

    pub fn list_by_status(&self, clinic_id: &str, status: RefillStatus) -> RefillResult<Vec<RefillEntry>> {
        Ok(self.db.refills_by_status(clinic_id, status)?)
    }

    fn require(&self, id: &str) -> RefillResult<RefillEntry> {
        self.db
            .get_refill(id)?
            .ok_or_else(|| RefillError::NotFound(id.to_string()))
    }

    fn transition(
        &self,
        id: &str,
        from: RefillStatus,
        to: RefillStatus,
        approved_by: Option<&str>,
        cancel_reason: Option<&str>,
    ) -> RefillResult<RefillEntry> {
        if !self.db.update_refill_status(id, from, to, approved_by, cancel_reason)? {
            let current = self.require(id)?;
            return Err(RefillError::InvalidTransition {
                id: id.to_string(),
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }
        debug!(refill_id = %id, from = from.as_str(), to = to.as_str(), "Refill transition");
        self.require(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Clinic;
    use chrono::{Duration, TimeZone};

    fn setup_db() -> (Database, Clinic) {
        let db = Database::open_in_memory().unwrap();
        let clinic = Clinic::new("Test Clinic".into(), "TC".into());
        db.insert_clinic(&clinic).unwrap();
        (db, clinic)
    }

    fn due() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn new_refill(clinic_id: &str, remaining: u32) -> NewRefill {
        NewRefill {
            clinic_id: clinic_id.into(),
            patient_id: "p1".into(),
            prescription_ref: "rx-1".into(),
            interval_days: 28,
            due_at: due(),
            remaining_refills: remaining,
        }
    }

    #[test]
    fn test_full_lifecycle_schedules_next() {
        let (db, clinic) = setup_db();
        let queue = RefillQueue::new(&db);
        let entry = queue.schedule(new_refill(&clinic.id, 1)).unwrap();

        assert_eq!(queue.promote_due(due() - Duration::days(1)).unwrap(), 0);
        assert_eq!(queue.promote_due(due()).unwrap(), 1);
        queue.record_payment(&entry.id).unwrap();
        let approval = queue.approve(&entry.id, "dr-1").unwrap();

        assert_eq!(approval.approved.status, RefillStatus::Approved);
        assert_eq!(approval.approved.approved_by.as_deref(), Some("dr-1"));
        let next = approval.next.unwrap();
        assert_eq!(next.due_at, due() + Duration::days(28));
        assert_eq!(next.remaining_refills, 0);

        let scheduled = queue.list_by_status(&clinic.id, RefillStatus::Scheduled).unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].id, next.id);
    }

    #[test]
    fn test_last_refill_schedules_nothing() {
        let (db, clinic) = setup_db();
        let queue = RefillQueue::new(&db);
        let entry = queue.schedule(new_refill(&clinic.id, 0)).unwrap();
        queue.promote_due(due()).unwrap();
        queue.record_payment(&entry.id).unwrap();
        assert!(queue.approve(&entry.id, "dr-1").unwrap().next.is_none());
    }

    #[test]
    fn test_illegal_transitions() {
        let (db, clinic) = setup_db();
        let queue = RefillQueue::new(&db);
        let entry = queue.schedule(new_refill(&clinic.id, 2)).unwrap();

        // Not due yet
        assert!(matches!(
            queue.record_payment(&entry.id),
            Err(RefillError::InvalidTransition { from: "scheduled", .. })
        ));
        assert!(matches!(
            queue.approve(&entry.id, "dr-1"),
            Err(RefillError::InvalidTransition { .. })
        ));
        // A failed approval schedules nothing
        assert_eq!(queue.list_by_status(&clinic.id, RefillStatus::Scheduled).unwrap().len(), 1);
        assert!(matches!(queue.record_payment("missing"), Err(RefillError::NotFound(_))));
    }

    #[test]
    fn test_cancel_from_any_open_state() {
        let (db, clinic) = setup_db();
        let queue = RefillQueue::new(&db);
        let entry = queue.schedule(new_refill(&clinic.id, 1)).unwrap();
        queue.promote_due(due()).unwrap();

        let cancelled = queue.cancel(&entry.id, "patient paused treatment").unwrap();
        assert_eq!(cancelled.status, RefillStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("patient paused treatment"));

        assert!(matches!(
            queue.cancel(&entry.id, "again"),
            Err(RefillError::InvalidTransition { from: "cancelled", .. })
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (db, clinic) = setup_db();
        let queue = RefillQueue::new(&db);
        let mut new = new_refill(&clinic.id, 1);
        new.interval_days = 0;
        assert!(matches!(queue.schedule(new), Err(RefillError::InvalidInput(_))));
    }
}
