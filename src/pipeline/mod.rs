//! Stream Pipeline
//!
//! Record-level topology: decode → score → observe → encode → route. One
//! worker per partition keeps per-user order; every failure mode inside a
//! record is contained to that record.

mod bus;

pub use bus::{ChannelSink, LogSink, MemoryBus, MemorySource, Record, RecordSink, RecordSource};

use anyhow::{Context, Result};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{Detector, TransactionDetector};
use crate::metrics::PipelineMetrics;
use crate::models::Transaction;

pub struct StreamPipeline {
    detector: Arc<TransactionDetector>,
    metrics: Arc<PipelineMetrics>,
    results: Arc<dyn RecordSink>,
    alerts: Arc<dyn RecordSink>,
    commit_interval: Duration,
}

impl StreamPipeline {
    pub fn new(
        detector: Arc<TransactionDetector>,
        metrics: Arc<PipelineMetrics>,
        results: Arc<dyn RecordSink>,
        alerts: Arc<dyn RecordSink>,
        commit_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            detector,
            metrics,
            results,
            alerts,
            commit_interval,
        })
    }

    /// Spawn one worker per source. Each source is a partition: records for
    /// one user always arrive on the same source, so scoring for a record
    /// always reads state before that record's own observe.
    pub fn spawn(self: &Arc<Self>, sources: Vec<Box<dyn RecordSource>>) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.metrics.set_active_detectors(sources.len() as u64);
        info!(
            workers = sources.len(),
            detector = self.detector.name(),
            "🚀 stream pipeline starting"
        );

        let handles = sources
            .into_iter()
            .enumerate()
            .map(|(worker_id, source)| {
                let pipeline = Arc::clone(self);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    pipeline.worker_loop(worker_id, source, shutdown).await;
                })
            })
            .collect();

        PipelineHandle {
            shutdown_tx,
            handles,
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        mut source: Box<dyn RecordSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut commit_ticker = tokio::time::interval(self.commit_interval);
        commit_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; swallow it.
        commit_ticker.tick().await;

        let mut processed = 0u64;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = commit_ticker.tick() => {
                    if let Err(e) = source.commit().await {
                        warn!(worker_id, error = %e, "offset commit failed");
                    }
                }
                record = source.poll() => {
                    let Some(record) = record else { break };
                    processed += 1;
                    // Worker boundary: a panicking record must not take the
                    // worker down with it.
                    let outcome = AssertUnwindSafe(self.process_record(record))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(worker_id, error = %e, "record skipped"),
                        Err(_) => error!(worker_id, "record processing panicked; worker continues"),
                    }
                }
            }
        }

        if let Err(e) = source.commit().await {
            warn!(worker_id, error = %e, "final offset commit failed");
        }
        info!(worker_id, processed, "pipeline worker stopped");
    }

    /// The per-record protocol. Decode failures drop the record silently
    /// (counter + warning); everything downstream of a successful decode
    /// still emits a result.
    async fn process_record(&self, record: Record) -> Result<()> {
        let started = Instant::now();

        let tx = match decode(&record.payload) {
            Ok(tx) => tx,
            Err(reason) => {
                self.metrics.record_decode_error();
                warn!(key = %record.key, %reason, "⚠️ dropping undecodable record");
                return Ok(());
            }
        };

        let result = self.detector.score(&tx);
        if result.reason.starts_with("scoring error") {
            self.metrics.record_scoring_error();
        }

        // Observe runs for every well-formed record, flagged or not; a
        // failure here must not affect the emitted result.
        if let Err(e) = self.detector.observe(&tx) {
            warn!(transaction_id = %tx.transaction_id, error = %e, "observe failed; state may be partial");
        }

        let payload = match serde_json::to_vec(&result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(transaction_id = %tx.transaction_id, error = %e, "result encode failed; emission dropped");
                self.metrics.record_result(&result, started.elapsed());
                return Ok(());
            }
        };

        self.results
            .publish(Record::new(record.key.clone(), payload.clone()))
            .await
            .context("all-results publish")?;

        if result.is_anomaly {
            debug!(
                transaction_id = %result.transaction_id,
                score = result.anomaly_score,
                anomaly_type = result.anomaly_type.as_str(),
                "anomaly routed to alerts"
            );
            self.alerts
                .publish(Record::new(record.key, payload))
                .await
                .context("alerts publish")?;
            self.metrics.record_alert();
        }

        self.metrics.record_result(&result, started.elapsed());
        Ok(())
    }
}

fn decode(payload: &[u8]) -> Result<Transaction, String> {
    let tx: Transaction =
        serde_json::from_slice(payload).map_err(|e| format!("json decode: {e}"))?;
    tx.validate()?;
    Ok(tx)
}

/// Running pipeline: join for a natural drain, or shut down with a bounded
/// grace period.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for every worker to drain its source and exit.
    pub async fn join(self) {
        futures_util::future::join_all(self.handles).await;
    }

    /// Cooperative shutdown: signal, wait up to `grace`, then abort stragglers.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + grace;
        for handle in self.handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("grace period elapsed; aborting worker");
                abort.abort();
            }
        }
        info!("pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DetectorVariant;
    use crate::engine::{DetectionEngine, EngineConfig};
    use chrono::{TimeZone, Utc};

    fn make_pipeline(
        variant: DetectorVariant,
    ) -> (
        Arc<StreamPipeline>,
        Arc<DetectionEngine>,
        Arc<PipelineMetrics>,
        tokio::sync::mpsc::UnboundedReceiver<Record>,
        tokio::sync::mpsc::UnboundedReceiver<Record>,
    ) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        let engine = Arc::new(DetectionEngine::new(EngineConfig::default(), clock.clone()));
        let detector = Arc::new(TransactionDetector::new(variant, engine.clone()));
        let metrics = Arc::new(PipelineMetrics::new(clock));
        let (results_sink, results_rx) = ChannelSink::new();
        let (alerts_sink, alerts_rx) = ChannelSink::new();
        let pipeline = StreamPipeline::new(
            detector,
            metrics.clone(),
            Arc::new(results_sink),
            Arc::new(alerts_sink),
            Duration::from_millis(50),
        );
        (pipeline, engine, metrics, results_rx, alerts_rx)
    }

    fn wire_tx(user: &str, amount: f64, hour: u32, minute: u32) -> Vec<u8> {
        serde_json::json!({
            "transaction_id": format!("{user}-{amount}-{hour}-{minute}"),
            "user_id": user,
            "merchant_id": "m-1",
            "amount": amount,
            "currency": "USD",
            "timestamp": format!("2026-03-02T{hour:02}:{minute:02}:00"),
            "payment_method": "card",
            "merchant_category": "grocery",
            "metadata": {}
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_not_fatal() {
        let (pipeline, engine, metrics, mut results_rx, _alerts_rx) =
            make_pipeline(DetectorVariant::Ensemble);
        let (bus, sources) = MemoryBus::with_partitions(1);
        let handle = pipeline.spawn(
            sources
                .into_iter()
                .map(|s| Box::new(s) as Box<dyn RecordSource>)
                .collect(),
        );

        bus.publish(Record::new("u", b"not json at all".to_vec()))
            .await
            .unwrap();
        // Missing required fields.
        bus.publish(Record::new("u", b"{\"user_id\":\"u\"}".to_vec()))
            .await
            .unwrap();
        bus.publish(Record::new("u", wire_tx("u", 25.0, 10, 0)))
            .await
            .unwrap();
        drop(bus);
        handle.join().await;
        drop(pipeline); // release the sink senders so the drain below ends

        let snap = metrics.snapshot();
        assert_eq!(snap.decode_errors, 2);
        assert_eq!(snap.total_transactions, 1);
        assert_eq!(engine.observed_count(), 1);
        assert!(results_rx.recv().await.is_some());
        assert!(results_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn every_record_is_scored_and_observed_in_order() {
        let (pipeline, engine, metrics, mut results_rx, mut alerts_rx) =
            make_pipeline(DetectorVariant::RuleBased);
        let (bus, sources) = MemoryBus::with_partitions(2);
        let handle = pipeline.spawn(
            sources
                .into_iter()
                .map(|s| Box::new(s) as Box<dyn RecordSource>)
                .collect(),
        );

        for i in 0..10u32 {
            bus.publish(Record::new("user-a", wire_tx("user-a", 20.0, 12, i)))
                .await
                .unwrap();
        }
        // One rule-path anomaly.
        bus.publish(Record::new("user-a", wire_tx("user-a", 9000.0, 12, 30)))
            .await
            .unwrap();
        drop(bus);
        handle.join().await;
        drop(pipeline);

        assert_eq!(engine.observed_count(), 11);
        assert_eq!(metrics.snapshot().total_transactions, 11);
        assert_eq!(metrics.snapshot().total_anomalies, 1);
        assert_eq!(metrics.snapshot().total_alerts, 1);

        // Per-key order preserved on the all-results stream.
        let mut minutes = Vec::new();
        while let Some(record) = results_rx.recv().await {
            let value: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
            let ts = value["original_transaction"]["timestamp"].as_str().unwrap();
            let minute: u32 = ts[14..16].parse().unwrap();
            minutes.push(minute);
        }
        assert_eq!(minutes.len(), 11);
        assert!(minutes.windows(2).all(|w| w[0] <= w[1]));

        let alert = alerts_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&alert.payload).unwrap();
        assert_eq!(value["anomaly_type"], "unusual_amount");
        assert!(alerts_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_is_bounded() {
        let (pipeline, _engine, _metrics, _results_rx, _alerts_rx) =
            make_pipeline(DetectorVariant::Ensemble);
        let (_bus, sources) = MemoryBus::with_partitions(1);
        let handle = pipeline.spawn(
            sources
                .into_iter()
                .map(|s| Box::new(s) as Box<dyn RecordSource>)
                .collect(),
        );
        // Workers are idle on an open bus; shutdown must still return quickly.
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown(Duration::from_secs(1)))
            .await
            .expect("shutdown must finish inside the grace window");
    }
}
