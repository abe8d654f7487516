//! SQLite schema definition.

/// Complete database schema for the clinic ledger.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Clinics and Patients
-- ============================================================================

CREATE TABLE IF NOT EXISTS clinics (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    patient_prefix TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS patients (
    id TEXT PRIMARY KEY,
    clinic_id TEXT NOT NULL REFERENCES clinics(id),
    patient_number INTEGER CHECK (patient_number IS NULL OR patient_number > 0),
    display_id TEXT,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    created_at TEXT NOT NULL,
    deleted_at TEXT                              -- soft delete; row and number are kept
);

-- One number per clinic; NULLs (not yet numbered) are allowed to repeat
CREATE UNIQUE INDEX IF NOT EXISTS idx_patients_clinic_number
    ON patients(clinic_id, patient_number);
CREATE INDEX IF NOT EXISTS idx_patients_clinic_created
    ON patients(clinic_id, created_at, id);

-- Numbers are permanent once assigned
CREATE TRIGGER IF NOT EXISTS patients_number_immutable
BEFORE UPDATE OF patient_number ON patients
WHEN old.patient_number IS NOT NULL AND new.patient_number IS NOT old.patient_number
BEGIN
    SELECT RAISE(ABORT, 'Patient number cannot change once assigned');
END;

-- Per-clinic allocation counter (upserted, never decremented)
CREATE TABLE IF NOT EXISTS clinic_counters (
    clinic_id TEXT PRIMARY KEY REFERENCES clinics(id),
    last_value INTEGER NOT NULL DEFAULT 0 CHECK (last_value >= 0),
    updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS clinic_counters_monotonic
BEFORE UPDATE OF last_value ON clinic_counters
WHEN new.last_value < old.last_value
BEGIN
    SELECT RAISE(ABORT, 'Counter cannot decrease');
END;

-- ============================================================================
-- Audit Ledger (Append-Only - Immutable after creation)
-- ============================================================================

CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY,                     -- 1-based, contiguous
    prev_hash TEXT NOT NULL,
    entry_hash TEXT NOT NULL UNIQUE,             -- SHA-256 over seq, prev_hash, payload
    payload TEXT NOT NULL,                       -- JSON AuditEvent
    clinic_id TEXT,
    actor_id TEXT NOT NULL,
    action TEXT NOT NULL,
    patient_id TEXT,
    phi_accessed INTEGER NOT NULL DEFAULT 0,
    occurred_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    idempotency_key TEXT UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_audit_patient ON audit_log(patient_id, seq);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor_id, seq);
CREATE INDEX IF NOT EXISTS idx_audit_occurred ON audit_log(occurred_at);
CREATE INDEX IF NOT EXISTS idx_audit_clinic ON audit_log(clinic_id, seq);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'Audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'Audit log is append-only');
END;

-- Sealed chain heads, used to detect truncation or rewrites
CREATE TABLE IF NOT EXISTS audit_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seq INTEGER NOT NULL,
    entry_hash TEXT NOT NULL,
    entry_count INTEGER NOT NULL,
    sealed_by TEXT NOT NULL,
    sealed_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS audit_checkpoints_no_update BEFORE UPDATE ON audit_checkpoints
BEGIN
    SELECT RAISE(ABORT, 'Checkpoints are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_checkpoints_no_delete BEFORE DELETE ON audit_checkpoints
BEGIN
    SELECT RAISE(ABORT, 'Checkpoints are append-only');
END;

-- ============================================================================
-- Compensation Plans (versioned by effective window)
-- ============================================================================

CREATE TABLE IF NOT EXISTS compensation_plans (
    id TEXT PRIMARY KEY,
    clinic_id TEXT NOT NULL REFERENCES clinics(id),
    recipient_kind TEXT NOT NULL CHECK (recipient_kind IN ('affiliate', 'sales_rep', 'provider')),
    recipient_id TEXT NOT NULL,
    terms TEXT NOT NULL,                         -- JSON PlanTerms
    effective_from TEXT NOT NULL,
    effective_to TEXT,                           -- NULL = open-ended
    created_at TEXT NOT NULL,
    CHECK (effective_to IS NULL OR effective_to > effective_from)
);

CREATE INDEX IF NOT EXISTS idx_plans_recipient
    ON compensation_plans(clinic_id, recipient_kind, recipient_id, effective_from);

-- ============================================================================
-- Commission Ledger
-- ============================================================================

-- Every input processed exactly once
CREATE TABLE IF NOT EXISTS processed_inputs (
    source TEXT NOT NULL CHECK (source IN ('billing', 'prescription', 'hours')),
    input_id TEXT NOT NULL,
    input_type TEXT NOT NULL,                    -- payment, refund, chargeback, prescription, hours
    clinic_id TEXT NOT NULL,
    patient_id TEXT,
    amount_cents INTEGER NOT NULL,
    occurred_at TEXT NOT NULL,
    payload TEXT NOT NULL,                       -- JSON of the input
    processed_at TEXT NOT NULL,
    PRIMARY KEY (source, input_id)
);

CREATE INDEX IF NOT EXISTS idx_processed_patient
    ON processed_inputs(clinic_id, patient_id, input_type, occurred_at);

CREATE TABLE IF NOT EXISTS payouts (
    id TEXT PRIMARY KEY,
    clinic_id TEXT NOT NULL,
    recipient_kind TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    period_end TEXT NOT NULL,
    total_cents INTEGER NOT NULL,
    event_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commission_events (
    id TEXT PRIMARY KEY,
    event_key TEXT NOT NULL UNIQUE,
    clinic_id TEXT NOT NULL,
    recipient_kind TEXT NOT NULL CHECK (recipient_kind IN ('affiliate', 'sales_rep', 'provider')),
    recipient_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    plan_id TEXT REFERENCES compensation_plans(id),
    component TEXT NOT NULL,
    basis_cents INTEGER NOT NULL,
    amount_cents INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'paid', 'reversed')),
    hold_until TEXT,
    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    reverses TEXT REFERENCES commission_events(id),
    payout_id TEXT REFERENCES payouts(id),
    CHECK ((component = 'clawback') = (amount_cents < 0) OR amount_cents = 0)
);

CREATE INDEX IF NOT EXISTS idx_commission_source ON commission_events(source_id);
CREATE INDEX IF NOT EXISTS idx_commission_recipient
    ON commission_events(clinic_id, recipient_kind, recipient_id, status);
CREATE INDEX IF NOT EXISTS idx_commission_hold ON commission_events(status, hold_until);

-- Amounts and derivation are immutable; only status and payout move
CREATE TRIGGER IF NOT EXISTS commission_events_immutable
BEFORE UPDATE OF event_key, clinic_id, recipient_kind, recipient_id, source_id,
                 component, basis_cents, amount_cents, occurred_at, reverses
ON commission_events
BEGIN
    SELECT RAISE(ABORT, 'Commission event amounts are immutable');
END;

CREATE TRIGGER IF NOT EXISTS commission_events_status_flow
BEFORE UPDATE OF status ON commission_events
WHEN NOT (
    old.status = new.status
    OR (old.status = 'pending' AND new.status IN ('approved', 'reversed'))
    OR (old.status = 'approved' AND new.status = 'paid')
)
BEGIN
    SELECT RAISE(ABORT, 'Illegal commission status transition');
END;

CREATE TRIGGER IF NOT EXISTS commission_events_no_delete BEFORE DELETE ON commission_events
BEGIN
    SELECT RAISE(ABORT, 'Commission events cannot be deleted');
END;

-- ============================================================================
-- Platform Fees
-- ============================================================================

CREATE TABLE IF NOT EXISTS fee_waiver_rules (
    id TEXT PRIMARY KEY,
    clinic_id TEXT NOT NULL REFERENCES clinics(id),
    kind TEXT NOT NULL,                          -- JSON WaiverKind
    priority INTEGER NOT NULL DEFAULT 0,
    effective_from TEXT NOT NULL,
    effective_to TEXT,
    created_at TEXT NOT NULL,
    CHECK (effective_to IS NULL OR effective_to > effective_from)
);

CREATE INDEX IF NOT EXISTS idx_fee_rules_clinic ON fee_waiver_rules(clinic_id, priority, id);

CREATE TABLE IF NOT EXISTS fee_assessments (
    script_id TEXT PRIMARY KEY,
    clinic_id TEXT NOT NULL,
    gross_cents INTEGER NOT NULL,
    waived_cents INTEGER NOT NULL,
    net_cents INTEGER NOT NULL,
    rule_id TEXT,
    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    CHECK (waived_cents >= 0 AND net_cents >= 0 AND net_cents = gross_cents - waived_cents)
);

CREATE INDEX IF NOT EXISTS idx_fee_assessments_clinic ON fee_assessments(clinic_id, occurred_at);

-- ============================================================================
-- Refill Queue
-- ============================================================================

CREATE TABLE IF NOT EXISTS refill_queue (
    id TEXT PRIMARY KEY,
    clinic_id TEXT NOT NULL REFERENCES clinics(id),
    patient_id TEXT NOT NULL,
    prescription_ref TEXT NOT NULL,
    interval_days INTEGER NOT NULL CHECK (interval_days > 0),
    due_at TEXT NOT NULL,
    remaining_refills INTEGER NOT NULL CHECK (remaining_refills >= 0),
    status TEXT NOT NULL CHECK (status IN ('scheduled', 'pending_payment', 'pending_provider', 'approved', 'cancelled')),
    approved_by TEXT,
    cancel_reason TEXT,
    previous_id TEXT REFERENCES refill_queue(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_refills_status_due ON refill_queue(status, due_at);
-- An entry schedules at most one successor
CREATE UNIQUE INDEX IF NOT EXISTS idx_refills_successor
    ON refill_queue(previous_id) WHERE previous_id IS NOT NULL;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO clinics (id, name, patient_prefix, created_at) VALUES ('c1', 'Clinic', 'PT', '2025-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        let result = conn.execute_batch(SCHEMA);
        assert!(result.is_ok(), "Schema should be valid SQL: {:?}", result);
        // Re-running is a no-op
        assert!(conn.execute_batch(SCHEMA).is_ok());
    }

    #[test]
    fn test_audit_log_append_only() {
        let conn = setup();
        conn.execute(
            "INSERT INTO audit_log (seq, prev_hash, entry_hash, payload, actor_id, action, occurred_at, recorded_at)
             VALUES (1, 'p', 'h', '{}', 'u', 'read', 't', 't')",
            [],
        )
        .unwrap();

        let update = conn.execute("UPDATE audit_log SET payload = 'x' WHERE seq = 1", []);
        assert!(update.is_err());

        let delete = conn.execute("DELETE FROM audit_log WHERE seq = 1", []);
        assert!(delete.is_err());
    }

    #[test]
    fn test_patient_number_unique_per_clinic() {
        let conn = setup();
        conn.execute(
            "INSERT INTO clinics (id, name, patient_prefix, created_at) VALUES ('c2', 'Other', 'OT', 't')",
            [],
        )
        .unwrap();

        let insert = |id: &str, clinic: &str, number: Option<i64>| {
            conn.execute(
                "INSERT INTO patients (id, clinic_id, patient_number, first_name, last_name, created_at)
                 VALUES (?1, ?2, ?3, 'A', 'B', 't')",
                rusqlite::params![id, clinic, number],
            )
        };

        assert!(insert("p1", "c1", Some(1)).is_ok());
        assert!(insert("p2", "c1", Some(1)).is_err());
        // Same number in another clinic is fine
        assert!(insert("p3", "c2", Some(1)).is_ok());
        // Unnumbered rows may repeat
        assert!(insert("p4", "c1", None).is_ok());
        assert!(insert("p5", "c1", None).is_ok());

        // Assigned numbers are permanent
        let change = conn.execute("UPDATE patients SET patient_number = 9 WHERE id = 'p1'", []);
        assert!(change.is_err());
        // Backfilling an unnumbered row is allowed
        let backfill = conn.execute("UPDATE patients SET patient_number = 2 WHERE id = 'p4'", []);
        assert!(backfill.is_ok());
    }

    #[test]
    fn test_counter_cannot_decrease() {
        let conn = setup();
        conn.execute(
            "INSERT INTO clinic_counters (clinic_id, last_value, updated_at) VALUES ('c1', 5, 't')",
            [],
        )
        .unwrap();
        assert!(conn
            .execute("UPDATE clinic_counters SET last_value = 4 WHERE clinic_id = 'c1'", [])
            .is_err());
        assert!(conn
            .execute("UPDATE clinic_counters SET last_value = 6 WHERE clinic_id = 'c1'", [])
            .is_ok());
    }

    #[test]
    fn test_commission_status_flow() {
        let conn = setup();
        conn.execute(
            "INSERT INTO commission_events (id, event_key, clinic_id, recipient_kind, recipient_id, source_id,
                 component, basis_cents, amount_cents, status, occurred_at, created_at, updated_at)
             VALUES ('e1', 'k1', 'c1', 'affiliate', 'a1', 'inv_1', 'first_payment', 10000, 1000, 'pending', 't', 't', 't')",
            [],
        )
        .unwrap();

        // Skipping approval is rejected
        assert!(conn
            .execute("UPDATE commission_events SET status = 'paid' WHERE id = 'e1'", [])
            .is_err());
        // Amount is immutable
        assert!(conn
            .execute("UPDATE commission_events SET amount_cents = 5 WHERE id = 'e1'", [])
            .is_err());
        assert!(conn
            .execute("UPDATE commission_events SET status = 'approved' WHERE id = 'e1'", [])
            .is_ok());
        assert!(conn
            .execute("UPDATE commission_events SET status = 'reversed' WHERE id = 'e1'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM commission_events WHERE id = 'e1'", []).is_err());
    }

    #[test]
    fn test_clawback_sign_check() {
        let conn = setup();
        let result = conn.execute(
            "INSERT INTO commission_events (id, event_key, clinic_id, recipient_kind, recipient_id, source_id,
                 component, basis_cents, amount_cents, status, occurred_at, created_at, updated_at)
             VALUES ('e2', 'k2', 'c1', 'affiliate', 'a1', 'inv_1', 'clawback', 10000, 500, 'approved', 't', 't', 't')",
            [],
        );
        assert!(result.is_err(), "Positive clawback must be rejected");
    }
}
