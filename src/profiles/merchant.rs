//! Per-merchant baseline and risk scoring.

use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::models::Transaction;
use crate::stats::StatsWindow;

const AMOUNT_WINDOW_CAPACITY: usize = 100;
const INTER_ARRIVAL_WINDOW_CAPACITY: usize = 100;

/// Learned baseline for a single merchant.
#[derive(Debug)]
pub struct MerchantProfile {
    amounts: StatsWindow,
    payment_methods: HashMap<String, u64>,
    inter_arrival_minutes: StatsWindow,
    risk_score: f64,
    first_seen: Option<NaiveDateTime>,
    last_seen: Option<NaiveDateTime>,
    transaction_count: u64,
}

impl Default for MerchantProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl MerchantProfile {
    pub fn new() -> Self {
        Self {
            amounts: StatsWindow::new(AMOUNT_WINDOW_CAPACITY),
            payment_methods: HashMap::new(),
            inter_arrival_minutes: StatsWindow::new(INTER_ARRIVAL_WINDOW_CAPACITY),
            risk_score: 0.0,
            first_seen: None,
            last_seen: None,
            transaction_count: 0,
        }
    }

    pub fn observe(&mut self, tx: &Transaction) {
        self.amounts.add(tx.amount);
        *self
            .payment_methods
            .entry(tx.payment_method.clone())
            .or_insert(0) += 1;

        if let Some(last) = self.last_seen {
            let gap_minutes = (tx.timestamp - last).num_seconds() as f64 / 60.0;
            if gap_minutes > 0.0 {
                self.inter_arrival_minutes.add(gap_minutes);
            }
        }

        self.transaction_count += 1;
        if self.first_seen.is_none() {
            self.first_seen = Some(tx.timestamp);
        }
        self.last_seen = Some(tx.timestamp);
        self.risk_score = self.compute_risk_score();
    }

    /// Additive risk heuristics, clamped to 1:
    /// rapid-fire arrivals, erratic amounts, scattered payment mix, low volume.
    fn compute_risk_score(&self) -> f64 {
        let mut score: f64 = 0.0;

        if self.inter_arrival_minutes.n() > 10 && self.inter_arrival_minutes.mean() < 1.0 {
            score += 0.3;
        }

        if self.amounts.n() > 10 {
            let mean = self.amounts.mean();
            if mean > 0.0 && self.amounts.stddev() / mean > 2.0 {
                score += 0.2;
            }
        }

        if !self.payment_methods.is_empty() && self.transaction_count > 0 {
            let max_count = self.payment_methods.values().copied().max().unwrap_or(0);
            if (max_count as f64 / self.transaction_count as f64) < 0.3 {
                score += 0.2;
            }
        }

        if self.transaction_count < 50 {
            score += 0.1;
        }

        score.min(1.0)
    }

    /// z-score-based amount anomaly against this merchant's window,
    /// normalized so z ≥ 3 saturates at 1.
    pub fn amount_anomaly(&self, amount: f64) -> f64 {
        if self.amounts.n() < 5 || !amount.is_finite() {
            return 0.0;
        }
        let mean = self.amounts.mean();
        let stddev = self.amounts.stddev();
        let z = if stddev == 0.0 {
            if amount == mean {
                0.0
            } else {
                3.0
            }
        } else {
            (amount - mean).abs() / stddev
        };
        (z / 3.0).min(1.0)
    }

    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    pub fn first_seen(&self) -> Option<NaiveDateTime> {
        self.first_seen
    }

    pub fn last_seen(&self) -> Option<NaiveDateTime> {
        self.last_seen
    }

    pub fn payment_method_total(&self) -> u64 {
        self.payment_methods.values().sum()
    }
}
