//! Detection Engine
//!
//! Ensemble anomaly scorer over per-user and per-merchant baselines.
//! Three weighted sub-scores (statistical, behavioural, temporal) combine
//! into one [0,1] score judged against a per-user adaptive threshold.
//!
//! Scoring is read-only and lock-light; `observe` is the only writer. Both
//! are safe to call concurrently across users: profiles live in sharded maps
//! with a per-entry RwLock.

mod detector;

pub use detector::{Detector, TransactionDetector};

use chrono::{Datelike, Timelike};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::models::{AnomalyResult, AnomalyType, Transaction};
use crate::profiles::{MerchantProfile, UserProfile};
use crate::stats::{StatsWindow, WindowSnapshot};

/// Fixed ensemble weights; they sum to exactly 1.
pub const STATISTICAL_WEIGHT: f64 = 0.3;
pub const BEHAVIOURAL_WEIGHT: f64 = 0.4;
pub const TEMPORAL_WEIGHT: f64 = 0.3;

/// A single saturated signal floors the combined score at this multiple of
/// the strongest component, so one decisive factor can flag on its own.
const SATURATION_FLOOR: f64 = 0.8;

/// Adaptive threshold: base + this gain times the user's variability,
/// capped at MAX_THRESHOLD.
const THRESHOLD_VARIABILITY_GAIN: f64 = 0.2;
const MAX_THRESHOLD: f64 = 0.95;
const THRESHOLD_MIN_TXNS: u64 = 10;

/// Static rule limits used by the rule-based variant during warm-up.
const RULE_AMOUNT_LIMIT: f64 = 5000.0;
const RULE_NIGHT_START: u32 = 22; // exclusive
const RULE_NIGHT_END: u32 = 6; // exclusive

const FRAUD_AMOUNT_LIMIT: f64 = 10_000.0;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub anomaly_threshold: f64,
    pub min_training_samples: u64,
    pub velocity_window_minutes: i64,
    pub velocity_burst_count: u32,
    pub global_window_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: 0.75,
            min_training_samples: 50,
            velocity_window_minutes: 5,
            velocity_burst_count: 3,
            global_window_capacity: 1000,
        }
    }
}

impl EngineConfig {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            anomaly_threshold: cfg.anomaly_threshold,
            min_training_samples: cfg.min_training_samples,
            ..Self::default()
        }
    }
}

/// Process-wide windows across all users.
#[derive(Debug)]
struct GlobalStats {
    amounts: StatsWindow,
    hours: StatsWindow,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct GlobalSnapshot {
    pub amounts: WindowSnapshot,
    pub hours: WindowSnapshot,
}

/// Raw per-factor scores, each already clamped to [0,1].
#[derive(Debug, Default, Clone, Copy)]
struct ComponentScores {
    /// min(|amount z| / 3, 1)
    amount: f64,
    /// Reserved frequency-anomaly component; always 0 for now.
    frequency: f64,
    category: f64,
    payment: f64,
    location: Option<f64>,
    hour: f64,
    day: f64,
    velocity: f64,
    velocity_count: usize,
}

impl ComponentScores {
    fn statistical(&self) -> f64 {
        (self.amount + self.frequency) / 2.0
    }

    fn behavioural(&self) -> f64 {
        match self.location {
            Some(loc) => (self.category + self.payment + loc) / 3.0,
            None => (self.category + self.payment) / 2.0,
        }
    }

    fn temporal(&self) -> f64 {
        (self.hour + self.day + self.velocity) / 3.0
    }

    fn strongest(&self) -> f64 {
        let mut strongest = self
            .amount
            .max(self.frequency)
            .max(self.category)
            .max(self.payment)
            .max(self.hour)
            .max(self.day)
            .max(self.velocity);
        if let Some(loc) = self.location {
            strongest = strongest.max(loc);
        }
        strongest
    }
}

/// The shared scoring/learning core behind both detector variants.
pub struct DetectionEngine {
    config: EngineConfig,
    users: DashMap<String, Arc<RwLock<UserProfile>>>,
    merchants: DashMap<String, Arc<RwLock<MerchantProfile>>>,
    global: Mutex<GlobalStats>,
    /// Cached adaptive thresholds, refreshed on every observe.
    thresholds: DashMap<String, f64>,
    observed: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl DetectionEngine {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.global_window_capacity;
        Self {
            config,
            users: DashMap::new(),
            merchants: DashMap::new(),
            global: Mutex::new(GlobalStats {
                amounts: StatsWindow::new(capacity),
                hours: StatsWindow::new(capacity),
            }),
            thresholds: DashMap::new(),
            observed: AtomicU64::new(0),
            clock,
        }
    }

    pub fn with_system_clock(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn is_trained(&self) -> bool {
        self.observed_count() >= self.config.min_training_samples
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn merchant_count(&self) -> usize {
        self.merchants.len()
    }

    pub fn user_profile(&self, user_id: &str) -> Option<Arc<RwLock<UserProfile>>> {
        self.users.get(user_id).map(|e| e.value().clone())
    }

    pub fn merchant_profile(&self, merchant_id: &str) -> Option<Arc<RwLock<MerchantProfile>>> {
        self.merchants.get(merchant_id).map(|e| e.value().clone())
    }

    pub fn global_snapshot(&self) -> GlobalSnapshot {
        let global = self.global.lock();
        GlobalSnapshot {
            amounts: global.amounts.snapshot(),
            hours: global.hours.snapshot(),
        }
    }

    /// Current decision threshold for a user; the base threshold until the
    /// user has enough history.
    pub fn threshold_for(&self, user_id: &str) -> f64 {
        self.thresholds
            .get(user_id)
            .map(|v| *v)
            .unwrap_or(self.config.anomaly_threshold)
    }

    /// Fold one transaction into global windows, both profiles, and the
    /// threshold cache. Creates profiles on first sight.
    pub fn observe(&self, tx: &Transaction) -> anyhow::Result<()> {
        {
            let mut global = self.global.lock();
            global.amounts.add(tx.amount);
            global.hours.add(tx.timestamp.hour() as f64);
        }

        let user = self
            .users
            .entry(tx.user_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(UserProfile::new())))
            .clone();
        let (txn_count, variability) = {
            let mut profile = user.write();
            profile.observe(tx);
            (profile.transaction_count(), profile.variability_score())
        };

        let base = self.config.anomaly_threshold;
        let threshold = if txn_count >= THRESHOLD_MIN_TXNS {
            (base + THRESHOLD_VARIABILITY_GAIN * variability).min(MAX_THRESHOLD)
        } else {
            base
        };
        self.thresholds.insert(tx.user_id.clone(), threshold);

        let merchant = self
            .merchants
            .entry(tx.merchant_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(MerchantProfile::new())))
            .clone();
        merchant.write().observe(tx);

        self.observed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ensemble-variant scoring: a fixed "model-not-trained" normal verdict
    /// until warm-up, the full ensemble afterwards. Never fails and never
    /// panics outwards.
    pub fn score(&self, tx: &Transaction) -> AnomalyResult {
        if !self.is_trained() {
            return self.untrained_normal(tx);
        }
        self.score_guarded(tx)
    }

    /// Rule-based-variant scoring: the static rule set until warm-up, the
    /// same ensemble afterwards.
    pub fn score_with_rules(&self, tx: &Transaction) -> AnomalyResult {
        if !self.is_trained() {
            return self.rule_score(tx);
        }
        self.score_guarded(tx)
    }

    fn score_guarded(&self, tx: &Transaction) -> AnomalyResult {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.ensemble_score(tx))) {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    transaction_id = %tx.transaction_id,
                    "scoring panicked; emitting safe normal result"
                );
                AnomalyResult::normal(
                    tx,
                    0.0,
                    0.5,
                    "scoring error: internal failure, treated as normal",
                    self.clock.now(),
                )
            }
        }
    }

    fn untrained_normal(&self, tx: &Transaction) -> AnomalyResult {
        let mut result = AnomalyResult::normal(
            tx,
            0.1,
            0.8,
            format!(
                "model-not-trained: {} of {} required samples",
                self.observed_count(),
                self.config.min_training_samples
            ),
            self.clock.now(),
        );
        result.features_used = base_features(tx);
        result
    }

    /// Static rule set used by the rule-based variant during warm-up.
    fn rule_score(&self, tx: &Transaction) -> AnomalyResult {
        let hour = tx.timestamp.hour();
        let mut score: f64 = 0.1;
        let mut flagged = false;
        let mut anomaly_type = AnomalyType::Unknown;
        let mut reason = "within rule bounds".to_string();

        if tx.amount > RULE_AMOUNT_LIMIT {
            score = 0.8;
            flagged = true;
            anomaly_type = AnomalyType::UnusualAmount;
            reason = format!(
                "amount {:.2} exceeds the {:.0} warm-up limit",
                tx.amount, RULE_AMOUNT_LIMIT
            );
        }

        if hour < RULE_NIGHT_END || hour > RULE_NIGHT_START {
            score = score.max(0.7);
            if !flagged {
                anomaly_type = AnomalyType::TimePattern;
                reason = format!("transaction at hour {hour} is outside regular hours");
                flagged = true;
            }
        }

        AnomalyResult {
            transaction_id: tx.transaction_id.clone(),
            is_anomaly: flagged,
            anomaly_score: score,
            confidence: if flagged { 0.6 } else { 0.9 },
            anomaly_type,
            detected_at: self.clock.now(),
            original_transaction: tx.clone(),
            features_used: base_features(tx),
            reason,
        }
    }

    fn ensemble_score(&self, tx: &Transaction) -> AnomalyResult {
        let now = self.clock.now();
        let mut features = base_features(tx);

        let user = self.users.get(&tx.user_id).map(|e| e.value().clone());
        let comps = match &user {
            // No baseline yet: every sub-score is 0 rather than an error.
            None => ComponentScores::default(),
            Some(profile) => {
                let profile = profile.read();
                features.insert("user_avg_amount".to_string(), profile.amount_mean());
                features.insert(
                    "user_transaction_count".to_string(),
                    profile.transaction_count() as f64,
                );
                self.component_scores(&profile, tx)
            }
        };

        if let Some(merchant) = self.merchants.get(&tx.merchant_id) {
            let merchant = merchant.value().read();
            features.insert("merchant_risk_score".to_string(), merchant.risk_score());
            features.insert(
                "merchant_amount_anomaly".to_string(),
                guarded("merchant_amount", || merchant.amount_anomaly(tx.amount)),
            );
        }

        let statistical = comps.statistical();
        let behavioural = comps.behavioural();
        let temporal = comps.temporal();
        features.insert("statistical_score".to_string(), statistical);
        features.insert("behavioral_score".to_string(), behavioural);
        features.insert("temporal_score".to_string(), temporal);
        features.insert("velocity_count".to_string(), comps.velocity_count as f64);

        let weighted = STATISTICAL_WEIGHT * statistical
            + BEHAVIOURAL_WEIGHT * behavioural
            + TEMPORAL_WEIGHT * temporal;
        let score = weighted
            .max(SATURATION_FLOOR * comps.strongest())
            .clamp(0.0, 1.0);

        let threshold = self.threshold_for(&tx.user_id);
        let is_anomaly = score > threshold;
        let confidence = (0.5 + (score - threshold).abs()).min(0.9);
        let anomaly_type = classify(&comps, temporal, tx.amount);
        let reason = describe(&comps, statistical, behavioural, temporal, score, threshold, tx);

        AnomalyResult {
            transaction_id: tx.transaction_id.clone(),
            is_anomaly,
            anomaly_score: score,
            confidence,
            anomaly_type,
            detected_at: now,
            original_transaction: tx.clone(),
            features_used: features,
            reason,
        }
    }

    fn component_scores(&self, profile: &UserProfile, tx: &Transaction) -> ComponentScores {
        let hour = tx.timestamp.hour();
        let day = tx.timestamp.weekday().number_from_monday();
        let velocity_count =
            profile.velocity_count(tx.timestamp, self.config.velocity_window_minutes);
        let burst = self.config.velocity_burst_count.max(1) as f64;

        ComponentScores {
            amount: guarded("amount_zscore", || profile.amount_zscore(tx.amount) / 3.0),
            frequency: 0.0,
            category: guarded("category", || profile.category_anomaly(&tx.merchant_category)),
            payment: guarded("payment", || profile.payment_anomaly(&tx.payment_method)),
            location: tx.location.as_ref().map(|loc| {
                guarded("location", || {
                    profile.location_anomaly(loc.latitude, loc.longitude)
                })
            }),
            hour: guarded("hour", || profile.hour_anomaly(hour)),
            day: guarded("day", || profile.day_anomaly(day)),
            velocity: guarded("velocity", || velocity_count as f64 / burst),
            velocity_count,
        }
    }
}

/// First-match classification; the fixed order makes ties deterministic.
fn classify(comps: &ComponentScores, temporal: f64, amount: f64) -> AnomalyType {
    if comps.velocity > 0.5 {
        AnomalyType::Velocity
    } else if comps.amount > 0.6 {
        AnomalyType::UnusualAmount
    } else if temporal > 0.5 {
        AnomalyType::TimePattern
    } else if amount > FRAUD_AMOUNT_LIMIT {
        AnomalyType::Fraud
    } else {
        AnomalyType::StatisticalOutlier
    }
}

fn describe(
    comps: &ComponentScores,
    statistical: f64,
    behavioural: f64,
    temporal: f64,
    score: f64,
    threshold: f64,
    tx: &Transaction,
) -> String {
    if score <= threshold && score < 0.3 {
        return format!("within learned baseline (score {score:.2}, threshold {threshold:.2})");
    }
    if statistical >= behavioural && statistical >= temporal {
        format!(
            "amount {:.2} deviates from the user's baseline (component {:.2})",
            tx.amount, comps.amount
        )
    } else if behavioural >= temporal {
        match comps.location {
            Some(loc) if loc >= comps.category && loc >= comps.payment => {
                "transaction location is far from the user's known locations".to_string()
            }
            _ => "unusual merchant category or payment method for this user".to_string(),
        }
    } else if comps.velocity > 0.5 {
        format!(
            "burst of {} transactions inside the velocity window",
            comps.velocity_count
        )
    } else {
        "transaction time is unusual for this user".to_string()
    }
}

fn base_features(tx: &Transaction) -> HashMap<String, f64> {
    let mut features = HashMap::new();
    features.insert("amount".to_string(), tx.amount);
    features.insert("hour_of_day".to_string(), tx.timestamp.hour() as f64);
    features.insert(
        "day_of_week".to_string(),
        tx.timestamp.weekday().number_from_monday() as f64,
    );
    features
}

/// Run one sub-scorer defensively: panics are logged and collapse to 0, and
/// every value is clamped into [0,1] with NaN/Inf discarded.
fn guarded(name: &'static str, scorer: impl FnOnce() -> f64) -> f64 {
    match std::panic::catch_unwind(AssertUnwindSafe(scorer)) {
        Ok(value) if value.is_finite() => value.clamp(0.0, 1.0),
        Ok(_) => 0.0,
        Err(_) => {
            warn!(scorer = name, "sub-scorer panicked; contributing 0");
            0.0
        }
    }
}
