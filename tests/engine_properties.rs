//! Property tests for the detection engine: bounds, determinism, state
//! invariants under randomly generated (but wire-valid) transactions.

use chrono::{NaiveDate, TimeZone, Utc};
use proptest::collection::vec;
use proptest::prelude::*;

use txnguard_backend::{
    clock::ManualClock,
    engine::{DetectionEngine, EngineConfig},
    models::{Transaction, TxnLocation},
};

const CATEGORIES: &[&str] = &["grocery", "travel", "fuel", "electronics"];
const METHODS: &[&str] = &["credit_card", "debit_card", "wallet"];

fn arb_transaction() -> impl Strategy<Value = Transaction> {
    (
        0.0f64..20_000.0,
        0u32..24,
        0u32..60,
        1u32..28,
        0usize..8,
        0usize..CATEGORIES.len(),
        0usize..METHODS.len(),
        proptest::option::of((-90.0f64..90.0, -180.0f64..180.0)),
        0u64..u64::MAX,
    )
        .prop_map(
            |(amount, hour, minute, day, user, cat, method, loc, nonce)| Transaction {
                transaction_id: format!("txn-{nonce:x}"),
                user_id: format!("user-{user}"),
                merchant_id: format!("merchant-{}", user % 3),
                amount,
                currency: "USD".to_string(),
                timestamp: NaiveDate::from_ymd_opt(2026, 3, day)
                    .unwrap()
                    .and_hms_opt(hour, minute, 0)
                    .unwrap(),
                location: loc.map(|(latitude, longitude)| TxnLocation {
                    latitude,
                    longitude,
                    country: "US".to_string(),
                    city: "somewhere".to_string(),
                }),
                payment_method: METHODS[method].to_string(),
                merchant_category: CATEGORIES[cat].to_string(),
                metadata: Default::default(),
            },
        )
}

fn engine(min_training_samples: u64) -> DetectionEngine {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
    DetectionEngine::new(
        EngineConfig {
            min_training_samples,
            ..EngineConfig::default()
        },
        clock,
    )
}

proptest! {
    /// Scores and confidences stay inside [0,1] on both variants, trained or
    /// not, for any valid transaction sequence.
    #[test]
    fn scores_and_confidence_are_bounded(txs in vec(arb_transaction(), 1..80)) {
        let e = engine(20);
        for tx in &txs {
            for result in [e.score(tx), e.score_with_rules(tx)] {
                prop_assert!((0.0..=1.0).contains(&result.anomaly_score),
                    "score {} out of bounds", result.anomaly_score);
                prop_assert!((0.0..=1.0).contains(&result.confidence));
            }
            e.observe(tx).unwrap();
        }
    }

    /// Once the global observation count passes the training floor, the
    /// ensemble stops reporting "model-not-trained".
    #[test]
    fn training_floor_is_respected(txs in vec(arb_transaction(), 30..60)) {
        let e = engine(25);
        for (i, tx) in txs.iter().enumerate() {
            let result = e.score(tx);
            if (i as u64) < 25 {
                prop_assert!(result.reason.starts_with("model-not-trained"));
            } else {
                prop_assert!(!result.reason.starts_with("model-not-trained"));
            }
            e.observe(tx).unwrap();
        }
    }

    /// Score is a pure function of the observe prefix: repeated calls agree
    /// on every field, including the classification.
    #[test]
    fn scoring_is_pure(txs in vec(arb_transaction(), 1..50), probe in arb_transaction()) {
        let e = engine(10);
        for tx in &txs {
            e.observe(tx).unwrap();
        }
        let first = e.score(&probe);
        let second = e.score(&probe);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.anomaly_type, second.anomaly_type);
    }

    /// The flag is exactly the threshold comparison.
    #[test]
    fn flag_matches_threshold(txs in vec(arb_transaction(), 20..60), probe in arb_transaction()) {
        let e = engine(10);
        for tx in &txs {
            e.observe(tx).unwrap();
        }
        let result = e.score(&probe);
        let threshold = e.threshold_for(&probe.user_id);
        prop_assert_eq!(result.is_anomaly, result.anomaly_score > threshold);
        prop_assert!(threshold <= 0.95);
    }

    /// Profile state stays bounded and frequency tables account for every
    /// observation, no matter the interleaving of users.
    #[test]
    fn profile_state_stays_bounded(txs in vec(arb_transaction(), 1..200)) {
        let e = engine(50);
        let mut per_user = std::collections::HashMap::<String, u64>::new();
        for tx in &txs {
            e.observe(tx).unwrap();
            *per_user.entry(tx.user_id.clone()).or_insert(0) += 1;
        }
        for (user, expected) in per_user {
            let profile = e.user_profile(&user).expect("observed user has a profile");
            let profile = profile.read();
            prop_assert_eq!(profile.transaction_count(), expected);
            let totals = profile.frequency_totals();
            prop_assert_eq!(totals.categories, expected);
            prop_assert_eq!(totals.payment_methods, expected);
            prop_assert_eq!(totals.hours, expected);
            prop_assert_eq!(totals.days, expected);
            prop_assert!(profile.location_count() <= 50);
            prop_assert!(profile.recent_count() <= 100);
            prop_assert!(profile.amount_n() <= 100);
            prop_assert!((0.0..=1.0).contains(&profile.variability_score()));
        }
    }
}
