//! Payout statements for accounting.

use serde::{Deserialize, Serialize};

use crate::db::{Database, DbError, DbResult};
use crate::models::PayoutStatement;

use super::escape_csv;

/// A payout statement ready for accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutExport {
    pub metadata: PayoutMetadata,
    pub lines: Vec<PayoutLine>,
}

/// Payout export metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutMetadata {
    pub payout_id: String,
    pub clinic_id: String,
    pub recipient_kind: String,
    pub recipient_id: String,
    /// Events strictly before this instant were settled
    pub period_end: String,
    pub created_at: String,
    pub exported_at: String,
    /// Net of clawbacks
    pub total_cents: i64,
}

/// One settled commission event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutLine {
    pub commission_event_id: String,
    pub source_id: String,
    pub component: String,
    pub basis_cents: i64,
    pub amount_cents: i64,
    pub occurred_at: String,
    /// Commission event a clawback line offsets
    pub reverses: Option<String>,
}

impl PayoutExport {
    pub fn from_statement(statement: &PayoutStatement) -> Self {
        let lines = statement
            .lines
            .iter()
            .map(|event| PayoutLine {
                commission_event_id: event.id.clone(),
                source_id: event.source_id.clone(),
                component: event.component.as_str().to_string(),
                basis_cents: event.basis_cents,
                amount_cents: event.amount_cents,
                occurred_at: event.occurred_at.to_rfc3339(),
                reverses: event.reverses.clone(),
            })
            .collect();

        Self {
            metadata: PayoutMetadata {
                payout_id: statement.payout_id.clone(),
                clinic_id: statement.clinic_id.clone(),
                recipient_kind: statement.recipient.kind.as_str().to_string(),
                recipient_id: statement.recipient.id.clone(),
                period_end: statement.period_end.to_rfc3339(),
                created_at: statement.created_at.to_rfc3339(),
                exported_at: chrono::Utc::now().to_rfc3339(),
                total_cents: statement.total_cents,
            },
            lines,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// One row per line; statement fields repeat on every row.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str(
            "payout_id,clinic_id,recipient_kind,recipient_id,commission_event_id,source_id,\
             component,basis_cents,amount_cents,occurred_at,reverses\n",
        );

        for line in &self.lines {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{}\n",
                escape_csv(&self.metadata.payout_id),
                escape_csv(&self.metadata.clinic_id),
                self.metadata.recipient_kind,
                escape_csv(&self.metadata.recipient_id),
                escape_csv(&line.commission_event_id),
                escape_csv(&line.source_id),
                line.component,
                line.basis_cents,
                line.amount_cents,
                line.occurred_at,
                escape_csv(line.reverses.as_deref().unwrap_or("")),
            ));
        }

        csv
    }
}

/// Loads stored payouts for export.
pub struct PayoutExporter<'a> {
    db: &'a Database,
}

impl<'a> PayoutExporter<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn export(&self, payout_id: &str) -> DbResult<PayoutExport> {
        let statement = self
            .db
            .get_payout(payout_id)?
            .ok_or_else(|| DbError::NotFound(format!("payout {}", payout_id)))?;
        Ok(PayoutExport::from_statement(&statement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commission::CommissionEngine;
    use crate::config::CommissionConfig;
    use crate::models::{
        AffiliateTerms, Attribution, BillingEvent, Clinic, CompensationPlan, PlanTerms, Rate,
        Recipient,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn make_payout(db: &Database) -> PayoutStatement {
        let clinic = Clinic::new("Test Clinic".into(), "TC".into());
        db.insert_clinic(&clinic).unwrap();
        let engine = CommissionEngine::new(db, CommissionConfig::default());
        engine
            .publish_plan(&CompensationPlan::new(
                &clinic.id,
                "aff,1",
                PlanTerms::Affiliate(AffiliateTerms {
                    initial_rate: Rate::Percent { bps: 1_000 },
                    recurring_rate: Some(Rate::Flat { cents: 250 }),
                    recurring_months: None,
                    hold_days: Some(0),
                    clawback_days: None,
                }),
                start(),
            ))
            .unwrap();

        for (i, amount) in [10_000, 5_000].iter().enumerate() {
            let mut payment = BillingEvent::payment(
                &format!("inv_{}", i),
                &clinic.id,
                "p1",
                *amount,
                start() + Duration::days(i as i64 + 1),
            );
            payment.attribution = Attribution {
                affiliate_id: Some("aff,1".into()),
                sales_rep_id: None,
            };
            engine.process_billing_event(&payment).unwrap();
        }
        engine
            .create_payout(&clinic.id, &Recipient::affiliate("aff,1"), start() + Duration::days(30))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_payout_export_from_statement() {
        let db = Database::open_in_memory().unwrap();
        let statement = make_payout(&db);
        let export = PayoutExport::from_statement(&statement);

        assert_eq!(export.metadata.total_cents, 1_250);
        assert_eq!(export.metadata.recipient_kind, "affiliate");
        assert_eq!(export.lines.len(), 2);
        assert!(export.to_json().unwrap().contains("first_payment"));
    }

    #[test]
    fn test_payout_csv() {
        let db = Database::open_in_memory().unwrap();
        let statement = make_payout(&db);
        let csv = PayoutExporter::new(&db).export(&statement.payout_id).unwrap().to_csv();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3); // Header + 2 lines
        assert!(lines[0].starts_with("payout_id,"));
        // Recipient id with a comma is quoted
        assert!(lines[1].contains(",\"aff,1\","));
        assert!(lines[1].contains(",1000,"));
    }

    #[test]
    fn test_unknown_payout() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            PayoutExporter::new(&db).export("missing"),
            Err(DbError::NotFound(_))
        ));
    }
}
