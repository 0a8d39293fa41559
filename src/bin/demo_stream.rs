//! End-to-end demo: synthetic transaction stream through the full pipeline
//! with a console alert consumer and the live dashboard.
//!
//! ```text
//! cargo run --bin demo_stream -- --rate 100 --duration-secs 60
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txnguard_backend::{
    api::{self, ApiState},
    clock::{Clock, SystemClock},
    config::DetectorVariant,
    demo::{spawn_traffic, GeneratorConfig},
    engine::{DetectionEngine, Detector, EngineConfig, TransactionDetector},
    metrics::{spawn_system_sampler, PipelineMetrics},
    models::AnomalyResult,
    pipeline::{ChannelSink, MemoryBus, RecordSource, StreamPipeline},
};

#[derive(Debug, Parser)]
#[command(about = "Run the anomaly pipeline against synthetic traffic")]
struct Args {
    /// Generated transactions per second.
    #[arg(long, default_value_t = 50)]
    rate: u32,

    /// Number of synthetic users.
    #[arg(long, default_value_t = 25)]
    users: usize,

    /// Share of records carrying an injected anomaly.
    #[arg(long, default_value_t = 0.03)]
    anomaly_ratio: f64,

    /// RNG seed for reproducible traffic.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Pipeline worker count.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Dashboard port.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Use the rule-based detector variant instead of the ensemble.
    #[arg(long)]
    rule_based: bool,

    /// Stop after this many seconds (default: run until ctrl-c).
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo_stream=info,txnguard_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let variant = if args.rule_based {
        DetectorVariant::RuleBased
    } else {
        DetectorVariant::Ensemble
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(DetectionEngine::new(
        EngineConfig::default(),
        clock.clone(),
    ));
    let detector = Arc::new(TransactionDetector::new(variant, engine.clone()));
    let metrics = Arc::new(PipelineMetrics::new(clock.clone()));
    let sampler = spawn_system_sampler(metrics.clone(), Duration::from_secs(5));

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind dashboard on port {}", args.port))?;
    info!(port = args.port, "dashboard at http://localhost:{}/", args.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_state = ApiState {
        metrics: metrics.clone(),
        clock,
        detector_name: detector.name(),
    };
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(api::serve_with_listener(listener, api_state, async move {
        let _ = server_shutdown.changed().await;
    }));

    // Alerts go to the console; all-results are drained and counted.
    let (results_sink, mut results_rx) = ChannelSink::new();
    let (alerts_sink, mut alerts_rx) = ChannelSink::new();
    let results_drain = tokio::spawn(async move {
        let mut n = 0u64;
        while results_rx.recv().await.is_some() {
            n += 1;
        }
        n
    });
    let alert_printer = tokio::spawn(async move {
        while let Some(record) = alerts_rx.recv().await {
            match serde_json::from_slice::<AnomalyResult>(&record.payload) {
                Ok(alert) => info!(
                    "🚨 ALERT {} score={:.3} type={} reason=\"{}\"",
                    alert.transaction_id,
                    alert.anomaly_score,
                    alert.anomaly_type.as_str(),
                    alert.reason
                ),
                Err(e) => warn!(error = %e, "unreadable alert payload"),
            }
        }
    });

    let (bus, sources) = MemoryBus::with_partitions(args.workers);
    let pipeline = StreamPipeline::new(
        detector,
        metrics.clone(),
        Arc::new(results_sink),
        Arc::new(alerts_sink),
        Duration::from_millis(1000),
    );
    let handle = pipeline.spawn(
        sources
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn RecordSource>)
            .collect(),
    );

    let generator = spawn_traffic(
        bus.clone(),
        GeneratorConfig {
            users: args.users,
            merchants: args.users / 2 + 1,
            seed: args.seed,
            anomaly_ratio: args.anomaly_ratio,
            rate_per_sec: args.rate,
        },
        shutdown_rx,
    );

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    info!("stopping demo");
    let _ = shutdown_tx.send(true);
    let produced = generator.await.unwrap_or(0);
    drop(bus);
    drop(pipeline);
    handle.shutdown(Duration::from_secs(10)).await;
    sampler.abort();
    alert_printer.await.ok();
    let consumed = results_drain.await.unwrap_or(0);
    let _ = server.await;

    let snapshot = metrics.snapshot();
    info!(
        produced,
        consumed,
        anomalies = snapshot.total_anomalies,
        rate = %format!("{:.2}%", snapshot.anomaly_rate * 100.0),
        "demo finished"
    );
    Ok(())
}
