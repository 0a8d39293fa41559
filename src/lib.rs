//! TxnGuard Backend Library
//!
//! Real-time transaction anomaly detection: a streaming pipeline scoring
//! every record against per-user and per-merchant baselines learned from the
//! same stream, with a metrics dashboard on the side.

pub mod api;
pub mod clock;
pub mod config;
pub mod demo;
pub mod engine;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod profiles;
pub mod stats;

pub use config::Config;
pub use engine::{DetectionEngine, Detector, EngineConfig, TransactionDetector};
pub use models::{AnomalyResult, AnomalyType, Transaction};
