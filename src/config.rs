//! Service configuration
//!
//! Defaults first, environment override second. Invalid values never abort
//! startup: they fall back to the default with a logged warning.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Which detector variant to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorVariant {
    /// Ensemble scorer; returns a fixed "model-not-trained" normal result
    /// until warm-up completes.
    Ensemble,
    /// Statistical variant; applies the static rule set until warm-up
    /// completes, then the same ensemble path.
    RuleBased,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Broker endpoints for the external bus client.
    pub bootstrap_servers: String,
    pub input_topic: String,
    pub output_topic: String,
    pub alerts_topic: String,
    /// Parallel pipeline workers (one partition each).
    pub num_threads: usize,
    /// Working directory handed to the bus client.
    pub state_dir: PathBuf,
    pub http_port: u16,
    pub commit_interval_ms: u64,
    pub anomaly_threshold: f64,
    pub min_training_samples: u64,
    pub detector_variant: DetectorVariant,
    pub shutdown_grace_secs: u64,
    /// When set, the service feeds itself synthetic traffic.
    pub demo_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            input_topic: "transactions".to_string(),
            output_topic: "anomalies".to_string(),
            alerts_topic: "alerts".to_string(),
            num_threads: 1,
            state_dir: env::temp_dir(),
            http_port: 3000,
            commit_interval_ms: 5000,
            anomaly_threshold: 0.75,
            min_training_samples: 50,
            detector_variant: DetectorVariant::Ensemble,
            shutdown_grace_secs: 10,
            demo_mode: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let detector_variant = match env::var("DETECTOR_VARIANT").ok().as_deref() {
            None => defaults.detector_variant,
            Some("ensemble") => DetectorVariant::Ensemble,
            Some("rule_based") => DetectorVariant::RuleBased,
            Some(other) => {
                warn!(value = other, "unknown DETECTOR_VARIANT, using ensemble");
                defaults.detector_variant
            }
        };

        Self {
            bootstrap_servers: env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or(defaults.bootstrap_servers),
            input_topic: env::var("KAFKA_INPUT_TOPIC").unwrap_or(defaults.input_topic),
            output_topic: env::var("KAFKA_OUTPUT_TOPIC").unwrap_or(defaults.output_topic),
            alerts_topic: env::var("KAFKA_ALERTS_TOPIC").unwrap_or(defaults.alerts_topic),
            num_threads: parse_env("KAFKA_NUM_THREADS", defaults.num_threads).max(1),
            state_dir: env::var("KAFKA_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            http_port: parse_env("HTTP_PORT", defaults.http_port),
            commit_interval_ms: parse_env("COMMIT_INTERVAL_MS", defaults.commit_interval_ms)
                .max(1),
            anomaly_threshold: parse_env("ANOMALY_THRESHOLD", defaults.anomaly_threshold)
                .clamp(0.0, 1.0),
            min_training_samples: parse_env(
                "MIN_TRAINING_SAMPLES",
                defaults.min_training_samples,
            ),
            detector_variant,
            shutdown_grace_secs: parse_env("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),
            demo_mode: env::var("DEMO_MODE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
                .unwrap_or(defaults.demo_mode),
        }
    }
}

/// Parse an env var, falling back to the default (with a warning) when the
/// value is present but malformed.
fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, fallback = %default, "invalid value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment is process-global; exercise every override in one test to
    // keep the harness race-free.
    #[test]
    fn env_overrides_and_fallbacks() {
        env::set_var("KAFKA_INPUT_TOPIC", "tx-in");
        env::set_var("KAFKA_NUM_THREADS", "4");
        env::set_var("COMMIT_INTERVAL_MS", "not-a-number");
        env::set_var("ANOMALY_THRESHOLD", "0.9");
        env::set_var("DETECTOR_VARIANT", "rule_based");

        let cfg = Config::from_env();
        assert_eq!(cfg.input_topic, "tx-in");
        assert_eq!(cfg.num_threads, 4);
        assert_eq!(cfg.commit_interval_ms, 5000); // fell back
        assert_eq!(cfg.anomaly_threshold, 0.9);
        assert_eq!(cfg.detector_variant, DetectorVariant::RuleBased);
        assert_eq!(cfg.output_topic, "anomalies");

        for key in [
            "KAFKA_INPUT_TOPIC",
            "KAFKA_NUM_THREADS",
            "COMMIT_INTERVAL_MS",
            "ANOMALY_THRESHOLD",
            "DETECTOR_VARIANT",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.bootstrap_servers, "localhost:9092");
        assert_eq!(cfg.input_topic, "transactions");
        assert_eq!(cfg.alerts_topic, "alerts");
        assert_eq!(cfg.num_threads, 1);
        assert_eq!(cfg.anomaly_threshold, 0.75);
        assert_eq!(cfg.min_training_samples, 50);
    }
}
