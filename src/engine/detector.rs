//! Detector variants
//!
//! Two construction-time variants share the same learned core and differ
//! only in their behaviour before warm-up completes: the ensemble variant
//! reports a fixed "model-not-trained" normal verdict, the rule-based
//! variant applies a static rule set.

use std::sync::Arc;

use super::DetectionEngine;
use crate::config::DetectorVariant;
use crate::models::{AnomalyResult, Transaction};

/// Common surface the pipeline scores and learns through.
pub trait Detector: Send + Sync {
    fn score(&self, tx: &Transaction) -> AnomalyResult;
    fn observe(&self, tx: &Transaction) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
    fn supports_online_learning(&self) -> bool;
}

pub enum TransactionDetector {
    Ensemble(Arc<DetectionEngine>),
    RuleBased(Arc<DetectionEngine>),
}

impl TransactionDetector {
    pub fn new(variant: DetectorVariant, engine: Arc<DetectionEngine>) -> Self {
        match variant {
            DetectorVariant::Ensemble => Self::Ensemble(engine),
            DetectorVariant::RuleBased => Self::RuleBased(engine),
        }
    }

    pub fn engine(&self) -> &Arc<DetectionEngine> {
        match self {
            Self::Ensemble(engine) | Self::RuleBased(engine) => engine,
        }
    }
}

impl Detector for TransactionDetector {
    fn score(&self, tx: &Transaction) -> AnomalyResult {
        match self {
            Self::Ensemble(engine) => engine.score(tx),
            Self::RuleBased(engine) => engine.score_with_rules(tx),
        }
    }

    fn observe(&self, tx: &Transaction) -> anyhow::Result<()> {
        self.engine().observe(tx)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Ensemble(_) => "enhanced-ensemble",
            Self::RuleBased(_) => "statistical-rules",
        }
    }

    /// The ensemble variant keeps adapting for the life of the process; the
    /// rule set itself is static (its post-warm-up path adapts identically,
    /// but the rules never change).
    fn supports_online_learning(&self) -> bool {
        matches!(self, Self::Ensemble(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use chrono::NaiveDate;

    fn tx(amount: f64, hour: u32) -> Transaction {
        Transaction {
            transaction_id: "t".into(),
            user_id: "u".into(),
            merchant_id: "m".into(),
            amount,
            currency: "USD".into(),
            timestamp: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            location: None,
            payment_method: "card".into(),
            merchant_category: "grocery".into(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn variants_diverge_only_before_warm_up() {
        let engine = Arc::new(DetectionEngine::with_system_clock(EngineConfig::default()));
        let ensemble = TransactionDetector::new(DetectorVariant::Ensemble, engine.clone());
        let rules = TransactionDetector::new(DetectorVariant::RuleBased, engine);

        let probe = tx(6000.0, 3);
        let from_ensemble = ensemble.score(&probe);
        let from_rules = rules.score(&probe);

        assert!(!from_ensemble.is_anomaly);
        assert!(from_ensemble.reason.starts_with("model-not-trained"));
        assert!(from_rules.is_anomaly);

        assert_eq!(ensemble.name(), "enhanced-ensemble");
        assert_eq!(rules.name(), "statistical-rules");
        assert!(ensemble.supports_online_learning());
        assert!(!rules.supports_online_learning());
    }
}
