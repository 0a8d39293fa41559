//! Synthetic traffic generation
//!
//! Seeded generator producing mostly-normal transactions with a configurable
//! share of injected anomalies (oversized amounts, location jumps, rapid
//! bursts). Used by the demo binary and by `DEMO_MODE=1` on the service.

use chrono::NaiveDateTime;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Transaction, TxnLocation};
use crate::pipeline::{MemoryBus, Record};

const CATEGORIES: &[&str] = &["grocery", "restaurant", "fuel", "electronics", "travel"];
const PAYMENT_METHODS: &[&str] = &["credit_card", "debit_card", "wallet"];

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub users: usize,
    pub merchants: usize,
    pub seed: u64,
    /// Fraction of generated records carrying an injected anomaly.
    pub anomaly_ratio: f64,
    pub rate_per_sec: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            users: 25,
            merchants: 10,
            seed: 7,
            anomaly_ratio: 0.03,
            rate_per_sec: 50,
        }
    }
}

#[derive(Debug, Clone)]
struct UserSpec {
    user_id: String,
    mean_amount: f64,
    home: (f64, f64),
    category: &'static str,
    payment: &'static str,
}

pub struct TrafficGenerator {
    rng: ChaCha8Rng,
    users: Vec<UserSpec>,
    merchants: Vec<String>,
    anomaly_ratio: f64,
    /// Remaining records of an in-flight burst injection.
    burst_left: u32,
    burst_user: usize,
}

impl TrafficGenerator {
    pub fn new(cfg: &GeneratorConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let users = (0..cfg.users.max(1))
            .map(|i| UserSpec {
                user_id: format!("user-{i:04}"),
                mean_amount: rng.gen_range(20.0..180.0),
                home: (
                    rng.gen_range(-60.0..60.0),
                    rng.gen_range(-150.0..150.0),
                ),
                category: CATEGORIES[rng.gen_range(0..CATEGORIES.len())],
                payment: PAYMENT_METHODS[rng.gen_range(0..PAYMENT_METHODS.len())],
            })
            .collect();
        let merchants = (0..cfg.merchants.max(1))
            .map(|i| format!("merchant-{i:03}"))
            .collect();
        Self {
            rng,
            users,
            merchants,
            anomaly_ratio: cfg.anomaly_ratio.clamp(0.0, 1.0),
            burst_left: 0,
            burst_user: 0,
        }
    }

    /// Produce the next transaction stamped at `now`.
    pub fn next(&mut self, now: NaiveDateTime) -> Transaction {
        if self.burst_left > 0 {
            self.burst_left -= 1;
            let user = self.users[self.burst_user].clone();
            return self.baseline_tx(&user, now);
        }

        let user_idx = self.rng.gen_range(0..self.users.len());
        let user = self.users[user_idx].clone();
        let mut tx = self.baseline_tx(&user, now);

        if self.rng.gen_bool(self.anomaly_ratio) {
            match self.rng.gen_range(0..3u8) {
                0 => {
                    tx.amount = user.mean_amount * self.rng.gen_range(80.0..200.0);
                    tx.metadata
                        .insert("injected".into(), serde_json::json!("oversized_amount"));
                }
                1 => {
                    tx.location = Some(TxnLocation {
                        latitude: -user.home.0,
                        longitude: -user.home.1,
                        country: "??".into(),
                        city: "far away".into(),
                    });
                    tx.metadata
                        .insert("injected".into(), serde_json::json!("location_jump"));
                }
                _ => {
                    // The next few records replay this user immediately.
                    self.burst_left = 5;
                    self.burst_user = user_idx;
                    tx.metadata
                        .insert("injected".into(), serde_json::json!("burst"));
                }
            }
        }
        tx
    }

    fn baseline_tx(&mut self, user: &UserSpec, now: NaiveDateTime) -> Transaction {
        let amount = (user.mean_amount * self.rng.gen_range(0.7..1.3)).max(1.0);
        let merchant = self.merchants[self.rng.gen_range(0..self.merchants.len())].clone();
        Transaction {
            transaction_id: Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            merchant_id: merchant,
            amount,
            currency: "USD".to_string(),
            timestamp: now,
            location: Some(TxnLocation {
                latitude: user.home.0 + self.rng.gen_range(-0.05..0.05),
                longitude: user.home.1 + self.rng.gen_range(-0.05..0.05),
                country: "US".to_string(),
                city: "hometown".to_string(),
            }),
            payment_method: user.payment.to_string(),
            merchant_category: user.category.to_string(),
            metadata: Default::default(),
        }
    }
}

/// Feed generated traffic into the bus until shutdown (or the bus closes).
pub fn spawn_traffic(
    bus: MemoryBus,
    cfg: GeneratorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut generator = TrafficGenerator::new(&cfg);
        let period = Duration::from_micros(1_000_000 / cfg.rate_per_sec.max(1) as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut produced = 0u64;
        info!(
            rate = cfg.rate_per_sec,
            users = cfg.users,
            anomaly_ratio = cfg.anomaly_ratio,
            "📦 demo traffic generator running"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let tx = generator.next(chrono::Utc::now().naive_utc());
                    let payload = match serde_json::to_vec(&tx) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "generator encode failed");
                            continue;
                        }
                    };
                    if bus.publish(Record::new(tx.user_id.clone(), payload)).await.is_err() {
                        break;
                    }
                    produced += 1;
                }
            }
        }
        info!(produced, "traffic generator stopped");
        produced
    })
}
