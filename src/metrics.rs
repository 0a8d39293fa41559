//! Pipeline Metrics
//!
//! Lock-free counters for the hot path, a bounded FIFO of recent anomalies,
//! and a trailing-minute rate window. System gauges (memory, load) are
//! refreshed by a background sampler.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::models::AnomalyResult;

const RECENT_ANOMALIES_CAP: usize = 100;
const RATE_WINDOW_SECS: i64 = 60;
const STALE_AFTER_SECS: i64 = 5 * 60;
const LOAD_CEILING: f64 = 0.9;

/// Compact record of one flagged transaction, kept in the recent FIFO.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalySummary {
    pub txn_id: String,
    pub score: f64,
    pub anomaly_type: &'static str,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SystemGauges {
    memory_used_bytes: u64,
    system_load: f64,
}

pub struct PipelineMetrics {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,

    total_transactions: AtomicU64,
    total_anomalies: AtomicU64,
    total_alerts: AtomicU64,
    sum_processing_micros: AtomicU64,
    decode_errors: AtomicU64,
    scoring_errors: AtomicU64,
    active_detectors: AtomicU64,

    system: RwLock<SystemGauges>,
    last_update: RwLock<DateTime<Utc>>,

    recent_anomalies: Mutex<VecDeque<AnomalySummary>>,
    type_histogram: Mutex<HashMap<&'static str, u64>>,
    /// Per-second counts for the trailing-minute rate.
    second_buckets: Mutex<VecDeque<(i64, u64)>>,
}

impl PipelineMetrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            total_transactions: AtomicU64::new(0),
            total_anomalies: AtomicU64::new(0),
            total_alerts: AtomicU64::new(0),
            sum_processing_micros: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            scoring_errors: AtomicU64::new(0),
            active_detectors: AtomicU64::new(0),
            system: RwLock::new(SystemGauges::default()),
            last_update: RwLock::new(started_at),
            recent_anomalies: Mutex::new(VecDeque::with_capacity(RECENT_ANOMALIES_CAP)),
            type_histogram: Mutex::new(HashMap::new()),
            second_buckets: Mutex::new(VecDeque::with_capacity(RATE_WINDOW_SECS as usize + 1)),
        }
    }

    /// Record one scored transaction flowing out of the pipeline.
    pub fn record_result(&self, result: &AnomalyResult, processing: Duration) {
        let now = self.clock.now();
        self.total_transactions.fetch_add(1, Ordering::Relaxed);
        self.sum_processing_micros
            .fetch_add(processing.as_micros() as u64, Ordering::Relaxed);
        *self.last_update.write() = now;
        self.bump_rate_bucket(now);

        if result.is_anomaly {
            self.total_anomalies.fetch_add(1, Ordering::Relaxed);
            *self
                .type_histogram
                .lock()
                .entry(result.anomaly_type.as_str())
                .or_insert(0) += 1;

            let mut recent = self.recent_anomalies.lock();
            if recent.len() == RECENT_ANOMALIES_CAP {
                recent.pop_front();
            }
            recent.push_back(AnomalySummary {
                txn_id: result.transaction_id.clone(),
                score: result.anomaly_score,
                anomaly_type: result.anomaly_type.as_str(),
                ts: result.detected_at,
            });
        }
    }

    /// Record a successful publish to the alerts sink.
    pub fn record_alert(&self) {
        self.total_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scoring_error(&self) {
        self.scoring_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_detectors(&self, n: u64) {
        self.active_detectors.store(n, Ordering::Relaxed);
    }

    pub fn set_system_gauges(&self, memory_used_bytes: u64, system_load: f64) {
        *self.system.write() = SystemGauges {
            memory_used_bytes,
            system_load: system_load.clamp(0.0, 1.0),
        };
    }

    fn bump_rate_bucket(&self, now: DateTime<Utc>) {
        let second = now.timestamp();
        let mut buckets = self.second_buckets.lock();
        match buckets.back_mut() {
            Some((ts, count)) if *ts == second => *count += 1,
            _ => buckets.push_back((second, 1)),
        }
        while buckets
            .front()
            .is_some_and(|&(ts, _)| ts < second - RATE_WINDOW_SECS)
        {
            buckets.pop_front();
        }
    }

    /// Transactions observed in the trailing minute, divided by 60.
    pub fn processing_rate_per_sec(&self) -> f64 {
        let cutoff = self.clock.now().timestamp() - RATE_WINDOW_SECS;
        let buckets = self.second_buckets.lock();
        let count: u64 = buckets
            .iter()
            .filter(|&&(ts, _)| ts >= cutoff)
            .map(|&(_, c)| c)
            .sum();
        count as f64 / RATE_WINDOW_SECS as f64
    }

    pub fn healthy(&self) -> bool {
        let now = self.clock.now();
        let fresh = (now - *self.last_update.read()).num_seconds() < STALE_AFTER_SECS;
        fresh && self.system.read().system_load < LOAD_CEILING
    }

    /// Newest-first copy of the recent-anomaly FIFO.
    pub fn recent_anomalies(&self) -> Vec<AnomalySummary> {
        self.recent_anomalies.lock().iter().rev().cloned().collect()
    }

    /// Flagged-count per anomaly type.
    pub fn distribution(&self) -> HashMap<String, u64> {
        self.type_histogram
            .lock()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let total = self.total_transactions.load(Ordering::Relaxed);
        let anomalies = self.total_anomalies.load(Ordering::Relaxed);
        let sum_ms = self.sum_processing_micros.load(Ordering::Relaxed) as f64 / 1000.0;
        let system = *self.system.read();

        MetricsSnapshot {
            total_transactions: total,
            total_anomalies: anomalies,
            total_alerts: self.total_alerts.load(Ordering::Relaxed),
            anomaly_rate: if total == 0 {
                0.0
            } else {
                anomalies as f64 / total as f64
            },
            avg_processing_time_ms: if total == 0 { 0.0 } else { sum_ms / total as f64 },
            sum_processing_time_ms: sum_ms,
            processing_rate_per_sec: self.processing_rate_per_sec(),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            scoring_errors: self.scoring_errors.load(Ordering::Relaxed),
            active_detectors: self.active_detectors.load(Ordering::Relaxed),
            memory_used_bytes: system.memory_used_bytes,
            system_load: system.system_load,
            last_update: *self.last_update.read(),
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            healthy: self.healthy(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_transactions: u64,
    pub total_anomalies: u64,
    pub total_alerts: u64,
    pub anomaly_rate: f64,
    pub avg_processing_time_ms: f64,
    pub sum_processing_time_ms: f64,
    pub processing_rate_per_sec: f64,
    pub decode_errors: u64,
    pub scoring_errors: u64,
    pub active_detectors: u64,
    pub memory_used_bytes: u64,
    pub system_load: f64,
    pub last_update: DateTime<Utc>,
    pub uptime_secs: u64,
    pub healthy: bool,
}

/// Background task refreshing memory and normalized load gauges.
pub fn spawn_system_sampler(
    metrics: Arc<PipelineMetrics>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new();
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            sys.refresh_memory();
            sys.refresh_cpu_usage();
            let cpus = sys.cpus().len().max(1);
            let load = sysinfo::System::load_average().one / cpus as f64;
            metrics.set_system_gauges(sys.used_memory(), load.clamp(0.0, 1.0));
            debug!(
                memory_used = sys.used_memory(),
                load = load,
                "system gauges refreshed"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AnomalyType, Transaction};
    use chrono::{NaiveDate, TimeZone};

    fn result(id: &str, flagged: bool, detected_at: DateTime<Utc>) -> AnomalyResult {
        let tx = Transaction {
            transaction_id: id.to_string(),
            user_id: "u".into(),
            merchant_id: "m".into(),
            amount: 10.0,
            currency: "USD".into(),
            timestamp: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            location: None,
            payment_method: "card".into(),
            merchant_category: "misc".into(),
            metadata: Default::default(),
        };
        AnomalyResult {
            transaction_id: id.to_string(),
            is_anomaly: flagged,
            anomaly_score: if flagged { 0.9 } else { 0.1 },
            confidence: 0.7,
            anomaly_type: if flagged {
                AnomalyType::Velocity
            } else {
                AnomalyType::Unknown
            },
            detected_at,
            original_transaction: tx,
            features_used: Default::default(),
            reason: String::new(),
        }
    }

    fn fixture() -> (Arc<ManualClock>, PipelineMetrics) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        let metrics = PipelineMetrics::new(clock.clone());
        (clock, metrics)
    }

    #[test]
    fn counters_and_rates() {
        let (clock, metrics) = fixture();
        for i in 0..10 {
            let flagged = i % 5 == 0;
            metrics.record_result(
                &result(&format!("t{i}"), flagged, clock.now()),
                Duration::from_millis(2),
            );
            if flagged {
                metrics.record_alert();
            }
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.total_transactions, 10);
        assert_eq!(snap.total_anomalies, 2);
        assert_eq!(snap.total_alerts, 2);
        assert!((snap.anomaly_rate - 0.2).abs() < 1e-12);
        assert!((snap.avg_processing_time_ms - 2.0).abs() < 0.2);
        assert!((snap.processing_rate_per_sec - 10.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn rate_window_expires() {
        let (clock, metrics) = fixture();
        for i in 0..30 {
            metrics.record_result(&result(&format!("t{i}"), false, clock.now()), Duration::ZERO);
        }
        assert!(metrics.processing_rate_per_sec() > 0.0);
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(metrics.processing_rate_per_sec(), 0.0);
    }

    #[test]
    fn recent_anomalies_capped_and_newest_first() {
        let (clock, metrics) = fixture();
        for i in 0..150 {
            clock.advance(chrono::Duration::seconds(1));
            metrics.record_result(&result(&format!("t{i}"), true, clock.now()), Duration::ZERO);
        }
        let recent = metrics.recent_anomalies();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent.first().unwrap().txn_id, "t149");
        assert_eq!(recent.last().unwrap().txn_id, "t50");
        assert_eq!(metrics.distribution().get("velocity"), Some(&150));
    }

    #[test]
    fn health_requires_freshness_and_headroom() {
        let (clock, metrics) = fixture();
        assert!(metrics.healthy());

        metrics.set_system_gauges(0, 0.95);
        assert!(!metrics.healthy());
        metrics.set_system_gauges(0, 0.2);
        assert!(metrics.healthy());

        clock.advance(chrono::Duration::minutes(6));
        assert!(!metrics.healthy());
        metrics.record_result(&result("t", false, clock.now()), Duration::ZERO);
        assert!(metrics.healthy());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let (_clock, metrics) = fixture();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert!(json.get("totalTransactions").is_some());
        assert!(json.get("anomalyRate").is_some());
        assert!(json.get("processingRatePerSec").is_some());
    }
}
