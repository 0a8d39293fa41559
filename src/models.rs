//! Wire-level data model: incoming transactions and outgoing anomaly verdicts.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Discrete label attached to a scored record for downstream routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Fraud,
    UnusualAmount,
    Velocity,
    Location,
    TimePattern,
    MerchantPattern,
    StatisticalOutlier,
    Unknown,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Fraud => "fraud",
            AnomalyType::UnusualAmount => "unusual_amount",
            AnomalyType::Velocity => "velocity",
            AnomalyType::Location => "location",
            AnomalyType::TimePattern => "time_pattern",
            AnomalyType::MerchantPattern => "merchant_pattern",
            AnomalyType::StatisticalOutlier => "statistical_outlier",
            AnomalyType::Unknown => "unknown",
        }
    }
}

/// Geographic point attached to a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
}

/// One input event. Timestamps are civil date-times: no timezone is assumed
/// and none is applied; arithmetic treats all of them as living in the same
/// unspecified zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub user_id: String,
    pub merchant_id: String,
    pub amount: f64,
    pub currency: String,
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub location: Option<TxnLocation>,
    pub payment_method: String,
    pub merchant_category: String,
    /// Opaque to the engine; preserved through the pipeline untouched.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Transaction {
    /// Field-level validation applied after JSON decode. Records failing any
    /// of these checks are dropped by the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_id.is_empty() {
            return Err("empty transaction_id".into());
        }
        if self.user_id.is_empty() {
            return Err("empty user_id".into());
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(format!("invalid amount {}", self.amount));
        }
        if let Some(loc) = &self.location {
            if !(-90.0..=90.0).contains(&loc.latitude) {
                return Err(format!("latitude {} out of range", loc.latitude));
            }
            if !(-180.0..=180.0).contains(&loc.longitude) {
                return Err(format!("longitude {} out of range", loc.longitude));
            }
        }
        Ok(())
    }
}

/// Annotated judgement emitted for every scored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub transaction_id: String,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    pub confidence: f64,
    pub anomaly_type: AnomalyType,
    pub detected_at: DateTime<Utc>,
    pub original_transaction: Transaction,
    pub features_used: HashMap<String, f64>,
    pub reason: String,
}

impl AnomalyResult {
    /// Safe "normal" verdict used when scoring cannot run (untrained model,
    /// internal scoring failure). Never flags.
    pub fn normal(
        tx: &Transaction,
        score: f64,
        confidence: f64,
        reason: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: tx.transaction_id.clone(),
            is_anomaly: false,
            anomaly_score: score,
            confidence,
            anomaly_type: AnomalyType::Unknown,
            detected_at,
            original_transaction: tx.clone(),
            features_used: HashMap::new(),
            reason: reason.into(),
        }
    }
}
