//! Per-user behavioural baseline.

use chrono::{Datelike, NaiveDateTime, Timelike};
use std::collections::{HashMap, VecDeque};

use super::haversine_km;
use crate::models::Transaction;
use crate::stats::StatsWindow;

const AMOUNT_WINDOW_CAPACITY: usize = 100;
const MAX_LOCATIONS: usize = 50;
const MAX_RECENT: usize = 100;

/// Distance (km) at which a location is maximally anomalous.
const LOCATION_SATURATION_KM: f64 = 100.0;

#[derive(Debug, Clone, Copy)]
struct RecentTxn {
    timestamp: NaiveDateTime,
    #[allow(dead_code)]
    amount: f64,
}

/// Learned baseline for a single user. One writer (observe) at a time; any
/// number of readers behind the engine's per-entry lock.
#[derive(Debug)]
pub struct UserProfile {
    amounts: StatsWindow,
    categories: HashMap<String, u64>,
    payment_methods: HashMap<String, u64>,
    hours: [u64; 24],
    days: [u64; 7],
    locations: VecDeque<(f64, f64)>,
    recent: VecDeque<RecentTxn>,
    transaction_count: u64,
    variability_score: f64,
    last_seen: Option<NaiveDateTime>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl UserProfile {
    pub fn new() -> Self {
        Self {
            amounts: StatsWindow::new(AMOUNT_WINDOW_CAPACITY),
            categories: HashMap::new(),
            payment_methods: HashMap::new(),
            hours: [0; 24],
            days: [0; 7],
            locations: VecDeque::with_capacity(MAX_LOCATIONS),
            recent: VecDeque::with_capacity(MAX_RECENT),
            transaction_count: 0,
            variability_score: 0.0,
            last_seen: None,
        }
    }

    /// Fold one transaction into the baseline.
    pub fn observe(&mut self, tx: &Transaction) {
        self.amounts.add(tx.amount);

        *self.categories.entry(tx.merchant_category.clone()).or_insert(0) += 1;
        *self
            .payment_methods
            .entry(tx.payment_method.clone())
            .or_insert(0) += 1;
        self.hours[tx.timestamp.hour() as usize] += 1;
        self.days[(tx.timestamp.weekday().number_from_monday() - 1) as usize] += 1;

        if let Some(loc) = &tx.location {
            if self.locations.len() == MAX_LOCATIONS {
                self.locations.pop_front();
            }
            self.locations.push_back((loc.latitude, loc.longitude));
        }

        if self.recent.len() == MAX_RECENT {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentTxn {
            timestamp: tx.timestamp,
            amount: tx.amount,
        });

        self.transaction_count += 1;
        self.last_seen = Some(tx.timestamp);

        if self.amounts.n() > 5 {
            let mean = self.amounts.mean();
            self.variability_score = if mean <= 0.0 {
                1.0
            } else {
                (self.amounts.stddev() / mean / 2.0).clamp(0.0, 1.0)
            };
        }
    }

    /// |a − mean| / stddev over the amount window.
    ///
    /// Degenerate windows: fewer than 3 samples score 0; a zero-stddev window
    /// scores 0 on an exact match and 3 otherwise.
    pub fn amount_zscore(&self, amount: f64) -> f64 {
        if self.amounts.n() < 3 || !amount.is_finite() {
            return 0.0;
        }
        let mean = self.amounts.mean();
        let stddev = self.amounts.stddev();
        if stddev == 0.0 {
            return if amount == mean { 0.0 } else { 3.0 };
        }
        (amount - mean).abs() / stddev
    }

    pub fn category_anomaly(&self, category: &str) -> f64 {
        self.rarity_anomaly(self.categories.get(category).copied(), 5, 0.8, 4.0)
    }

    pub fn payment_anomaly(&self, method: &str) -> f64 {
        self.rarity_anomaly(self.payment_methods.get(method).copied(), 5, 0.7, 3.0)
    }

    pub fn hour_anomaly(&self, hour: u32) -> f64 {
        let count = self.hours.get(hour as usize).copied();
        self.rarity_anomaly(count, 10, 0.6, 10.0)
    }

    /// `day` is ISO day-of-week, 1 (Monday) ..= 7 (Sunday).
    pub fn day_anomaly(&self, day: u32) -> f64 {
        if !(1..=7).contains(&day) {
            return 0.0;
        }
        let count = self.days.get((day - 1) as usize).copied();
        self.rarity_anomaly(count, 10, 0.5, 7.0)
    }

    /// Shared `max(0, base − slope·f)` shape, where f is the observed
    /// frequency of the value among this user's transactions.
    fn rarity_anomaly(&self, count: Option<u64>, min_txns: u64, base: f64, slope: f64) -> f64 {
        if self.transaction_count < min_txns {
            return 0.0;
        }
        let f = count.unwrap_or(0) as f64 / self.transaction_count as f64;
        (base - slope * f).max(0.0)
    }

    /// Distance-based anomaly against the stored location history:
    /// min over priors of the great-circle distance, saturating at 100 km.
    pub fn location_anomaly(&self, latitude: f64, longitude: f64) -> f64 {
        if self.locations.is_empty() {
            return 0.0;
        }
        let min_km = self
            .locations
            .iter()
            .map(|&(lat, lon)| haversine_km(latitude, longitude, lat, lon))
            .fold(f64::INFINITY, f64::min);
        (min_km / LOCATION_SATURATION_KM).min(1.0)
    }

    /// Number of recent transactions stamped within `window_minutes` before
    /// (and including) `at`.
    pub fn velocity_count(&self, at: NaiveDateTime, window_minutes: i64) -> usize {
        self.recent
            .iter()
            .filter(|t| {
                let gap = at - t.timestamp;
                gap >= chrono::Duration::zero() && gap <= chrono::Duration::minutes(window_minutes)
            })
            .count()
    }

    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    pub fn variability_score(&self) -> f64 {
        self.variability_score
    }

    pub fn last_seen(&self) -> Option<NaiveDateTime> {
        self.last_seen
    }

    pub fn amount_mean(&self) -> f64 {
        self.amounts.mean()
    }

    pub fn amount_n(&self) -> usize {
        self.amounts.n()
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    /// Per-table frequency sums; each must equal `transaction_count`
    /// (locations aside, which only accumulate when present on the wire).
    pub fn frequency_totals(&self) -> FrequencyTotals {
        FrequencyTotals {
            categories: self.categories.values().sum(),
            payment_methods: self.payment_methods.values().sum(),
            hours: self.hours.iter().sum(),
            days: self.days.iter().sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyTotals {
    pub categories: u64,
    pub payment_methods: u64,
    pub hours: u64,
    pub days: u64,
}
