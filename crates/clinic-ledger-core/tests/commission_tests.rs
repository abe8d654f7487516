//! End-to-end commission flows through the ledger facade.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use clinic_ledger_core::models::{
    AffiliateTerms, Attribution, BillingEvent, BillingEventKind, BillingLineItem, Clinic,
    CommissionComponent, CommissionStatus, CompensationPlan, FeeWaiverRule, MultiItemBonus,
    PlanTerms, PrescriptionEvent, ProviderTerms, Rate, Recipient, SalesRepTerms, WaiverKind,
    WaiverPeriod,
};
use clinic_ledger_core::{ClinicLedger, LedgerConfig};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn setup() -> (ClinicLedger, Clinic) {
    common::init_test_tracing();
    let mut config = LedgerConfig::default();
    config.fees.per_script_fee_cents = 400;
    let ledger = ClinicLedger::open_in_memory(config).unwrap();
    let clinic = ledger.add_clinic("Metro Health", "MH").unwrap();

    ledger
        .publish_plan(&CompensationPlan::new(
            &clinic.id,
            "aff-1",
            PlanTerms::Affiliate(AffiliateTerms {
                initial_rate: Rate::Percent { bps: 2_000 },
                recurring_rate: Some(Rate::Percent { bps: 500 }),
                recurring_months: Some(3),
                hold_days: Some(7),
                clawback_days: Some(60),
            }),
            start(),
        ))
        .unwrap();
    ledger
        .publish_plan(&CompensationPlan::new(
            &clinic.id,
            "rep-1",
            PlanTerms::SalesRep(SalesRepTerms {
                base_rate: Some(Rate::Percent { bps: 300 }),
                multi_item_bonus: Some(MultiItemBonus {
                    min_items: 2,
                    rate: Rate::Flat { cents: 1_000 },
                }),
                hold_days: Some(0),
                ..Default::default()
            }),
            start(),
        ))
        .unwrap();
    (ledger, clinic)
}

fn payment(clinic: &Clinic, id: &str, amount: i64, day: i64) -> BillingEvent {
    let mut event = BillingEvent::payment(id, &clinic.id, "patient-1", amount, start() + Duration::days(day));
    event.attribution = Attribution {
        affiliate_id: Some("aff-1".into()),
        sales_rep_id: Some("rep-1".into()),
    };
    event.line_items = vec![
        BillingLineItem {
            product_id: "sema".into(),
            description: "Semaglutide, 4 weeks".into(),
            quantity: 1,
            unit_amount_cents: amount - 2_000,
        },
        BillingLineItem {
            product_id: "consult".into(),
            description: "Consult".into(),
            quantity: 1,
            unit_amount_cents: 2_000,
        },
    ];
    event
}

#[test]
fn test_subscription_lifecycle() {
    let (ledger, clinic) = setup();
    let affiliate = Recipient::affiliate("aff-1");
    let rep = Recipient::sales_rep("rep-1");

    // Monthly payments; recurring window is three months from the first
    for (i, day) in [0, 31, 59, 90, 120].iter().enumerate() {
        ledger
            .process_billing_event(&payment(&clinic, &format!("inv_{}", i), 30_000, *day))
            .unwrap();
    }

    ledger.release_matured(start() + Duration::days(200)).unwrap();
    let balance = ledger.commission_balance(&clinic.id, &affiliate).unwrap();
    // 6000 first + 1500 x 2 recurring (day 90 is past Apr 1)
    assert_eq!(balance.approved_cents, 9_000);
    assert_eq!(balance.pending_cents, 0);

    // Rep: 900 base + 1000 multi-item per payment, approved at once
    let rep_balance = ledger.commission_balance(&clinic.id, &rep).unwrap();
    assert_eq!(rep_balance.approved_cents, 5 * 1_900);
}

#[test]
fn test_refunds_and_chargebacks() {
    let (ledger, clinic) = setup();
    let affiliate = Recipient::affiliate("aff-1");
    let rep = Recipient::sales_rep("rep-1");

    ledger.process_billing_event(&payment(&clinic, "inv_1", 30_000, 0)).unwrap();
    ledger.process_billing_event(&payment(&clinic, "inv_2", 30_000, 31)).unwrap();

    // Partial refund of the second payment while the affiliate event is held
    let refund = BillingEvent {
        event_id: "re_1".into(),
        clinic_id: clinic.id.clone(),
        patient_id: "patient-1".into(),
        kind: BillingEventKind::Refund {
            original_event_id: "inv_2".into(),
        },
        amount_cents: 15_000,
        occurred_at: start() + Duration::days(33),
        line_items: Vec::new(),
        attribution: Attribution::default(),
    };
    let outcome = ledger.process_billing_event(&refund).unwrap();
    let created = outcome.created();
    assert!(created.iter().all(|e| e.component == CommissionComponent::Clawback));
    let affiliate_clawback = created.iter().find(|e| e.recipient == affiliate).unwrap();
    assert_eq!(affiliate_clawback.amount_cents, -750);
    assert_eq!(affiliate_clawback.status, CommissionStatus::Pending);
    // Rep base and multi-item bonus were approved at once; each is clawed back
    let rep_clawbacks: Vec<_> = created.iter().filter(|e| e.recipient == rep).collect();
    assert_eq!(rep_clawbacks.len(), 2);
    assert_eq!(rep_clawbacks.iter().map(|e| e.amount_cents).sum::<i64>(), -950);
    assert!(rep_clawbacks.iter().all(|e| e.status == CommissionStatus::Approved));

    // Retried webhook delivery changes nothing
    assert!(ledger.process_billing_event(&refund).unwrap().is_duplicate());

    // Chargeback of the first payment after the affiliate was paid
    ledger.release_matured(start() + Duration::days(40)).unwrap();
    let payout = ledger
        .create_payout(&clinic.id, &affiliate, start() + Duration::days(45))
        .unwrap()
        .unwrap();
    assert_eq!(payout.total_cents, 6_000 + 1_500 - 750);

    let mut chargeback = refund.clone();
    chargeback.event_id = "dp_1".into();
    chargeback.kind = BillingEventKind::Chargeback {
        original_event_id: "inv_1".into(),
    };
    chargeback.amount_cents = 30_000;
    chargeback.occurred_at = start() + Duration::days(50);
    ledger.process_billing_event(&chargeback).unwrap();

    let balance = ledger.commission_balance(&clinic.id, &affiliate).unwrap();
    assert_eq!(balance.paid_cents, 6_750);
    assert_eq!(balance.approved_cents, -6_000);

    let csv = ledger.export_payout(&payout.payout_id).unwrap().to_csv();
    assert_eq!(csv.lines().count(), 4); // Header + first, recurring, clawback

    assert!(ledger.verify_audit_chain().unwrap().valid);
}

#[test]
fn test_prescription_credits_provider_and_waives_fee() {
    let (ledger, clinic) = setup();
    ledger
        .publish_plan(&CompensationPlan::new(
            &clinic.id,
            "dr-1",
            PlanTerms::Provider(ProviderTerms {
                per_script: Rate::Hybrid { bps: 100, cents: 1_000 },
            }),
            start(),
        ))
        .unwrap();
    ledger
        .add_fee_rule(&FeeWaiverRule::new(
            &clinic.id,
            WaiverKind::FirstScripts { count: 1, period: WaiverPeriod::Lifetime },
            1,
            start(),
        ))
        .unwrap();

    let script = |id: &str, day: i64| PrescriptionEvent {
        script_id: id.into(),
        clinic_id: clinic.id.clone(),
        provider_id: "dr-1".into(),
        patient_id: "patient-1".into(),
        product_ids: vec!["sema".into()],
        order_amount_cents: 25_000,
        occurred_at: start() + Duration::days(day),
    };

    let (outcome, fee) = ledger.process_prescription(&script("rx-1", 1)).unwrap();
    assert_eq!(outcome.created()[0].amount_cents, 1_250);
    assert_eq!(fee.net_cents, 0);

    let (_, fee) = ledger.process_prescription(&script("rx-2", 2)).unwrap();
    assert_eq!(fee.net_cents, 400);

    // Replayed script: no new commission, same fee
    let (outcome, fee) = ledger.process_prescription(&script("rx-1", 1)).unwrap();
    assert!(outcome.is_duplicate());
    assert_eq!(fee.net_cents, 0);

    let disclosures = ledger.accounting_of_disclosures("patient-1").unwrap();
    assert_eq!(disclosures.disclosures.len(), 2);
}
