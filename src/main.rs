//! TxnGuard - Real-Time Transaction Anomaly Detection Service
//!
//! Boot order: environment → tracing → dashboard bind (fatal on failure) →
//! system sampler → pipeline workers → optional demo traffic. Shutdown is
//! cooperative: stop intake, drain in-flight records inside the grace
//! window, close the dashboard, exit 0.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txnguard_backend::{
    api::{self, ApiState},
    clock::{Clock, SystemClock},
    config::Config,
    demo::{spawn_traffic, GeneratorConfig},
    engine::{DetectionEngine, Detector, EngineConfig, TransactionDetector},
    metrics::{spawn_system_sampler, PipelineMetrics},
    pipeline::{LogSink, MemoryBus, RecordSink, RecordSource, StreamPipeline},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::from_env();
    info!("🚀 TxnGuard anomaly detection service starting");
    info!(
        brokers = %config.bootstrap_servers,
        input = %config.input_topic,
        output = %config.output_topic,
        alerts = %config.alerts_topic,
        workers = config.num_threads,
        "bus configuration loaded"
    );

    if !config.state_dir.exists() {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("failed to create state dir {:?}", config.state_dir))?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(DetectionEngine::new(
        EngineConfig::from_config(&config),
        clock.clone(),
    ));
    let detector = Arc::new(TransactionDetector::new(
        config.detector_variant,
        engine.clone(),
    ));
    info!(
        detector = detector.name(),
        online_learning = detector.supports_online_learning(),
        threshold = config.anomaly_threshold,
        min_training_samples = config.min_training_samples,
        "🧠 detection engine ready"
    );

    let metrics = Arc::new(PipelineMetrics::new(clock.clone()));
    let sampler = spawn_system_sampler(metrics.clone(), Duration::from_secs(5));

    // Bind the dashboard before spawning workers: a port conflict is a
    // startup failure, not something to discover mid-stream.
    let listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind dashboard on port {}", config.http_port))?;
    info!(port = config.http_port, "🎯 dashboard listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_state = ApiState {
        metrics: metrics.clone(),
        clock: clock.clone(),
        detector_name: detector.name(),
    };
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(api::serve_with_listener(listener, api_state, async move {
        let _ = server_shutdown.changed().await;
    }));

    // The external bus client attaches to these seams; in-process the same
    // topology runs over the memory bus.
    let results: Arc<dyn RecordSink> = Arc::new(LogSink::new(config.output_topic.clone()));
    let alerts: Arc<dyn RecordSink> = Arc::new(LogSink::announcing(config.alerts_topic.clone()));
    let (bus, sources) = MemoryBus::with_partitions(config.num_threads);
    let pipeline = StreamPipeline::new(
        detector,
        metrics.clone(),
        results,
        alerts,
        Duration::from_millis(config.commit_interval_ms),
    );
    let handle = pipeline.spawn(
        sources
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn RecordSource>)
            .collect(),
    );

    let generator = if config.demo_mode {
        info!("📦 DEMO_MODE enabled; generating synthetic traffic");
        Some(spawn_traffic(
            bus.clone(),
            GeneratorConfig::default(),
            shutdown_rx.clone(),
        ))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 shutdown requested; draining in-flight records");
    let _ = shutdown_tx.send(true);

    if let Some(generator) = generator {
        let _ = generator.await;
    }
    drop(bus); // close partitions so idle workers see end-of-stream
    handle
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;
    sampler.abort();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "dashboard exited with error"),
        Err(e) => warn!(error = %e, "dashboard task join failed"),
    }

    let snapshot = metrics.snapshot();
    info!(
        total = snapshot.total_transactions,
        anomalies = snapshot.total_anomalies,
        "✅ clean shutdown"
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txnguard_backend=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), plus the manifest dir for
    // runs started from elsewhere with --manifest-path.
    let _ = dotenv::dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
