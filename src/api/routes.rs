//! API Routes
//!
//! JSON endpoints over the metrics registry, the embedded dashboard page,
//! and the method/path policy for everything under /api.

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::clock::Clock;
use crate::metrics::{AnomalySummary, MetricsSnapshot, PipelineMetrics};

#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<PipelineMetrics>,
    pub clock: Arc<dyn Clock>,
    pub detector_name: &'static str,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(dashboard_page))
        .route("/api/metrics", get(get_metrics))
        .route("/api/anomalies", get(get_anomalies))
        .route("/api/distribution", get(get_distribution))
        .route("/api/health", get(get_health))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves. A failed bind is a
/// startup error and propagates.
pub async fn serve(
    state: ApiState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind dashboard on {addr}"))?;
    info!("🎯 dashboard listening on {addr}");
    serve_with_listener(listener, state, shutdown).await
}

pub async fn serve_with_listener(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("dashboard server error")
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    snapshot: MetricsSnapshot,
    detector: &'static str,
}

async fn get_metrics(State(state): State<ApiState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        snapshot: state.metrics.snapshot(),
        detector: state.detector_name,
    })
}

async fn get_anomalies(State(state): State<ApiState>) -> Json<Vec<AnomalySummary>> {
    Json(state.metrics.recent_anomalies())
}

async fn get_distribution(State(state): State<ApiState>) -> Json<HashMap<String, u64>> {
    Json(state.metrics.distribution())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    timestamp: DateTime<Utc>,
    processing_rate: f64,
    uptime_check: &'static str,
}

async fn get_health(State(state): State<ApiState>) -> impl IntoResponse {
    let healthy = state.metrics.healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(HealthResponse {
        healthy,
        timestamp: state.clock.now(),
        processing_rate: state.metrics.processing_rate_per_sec(),
        uptime_check: "OK",
    });
    (status, body)
}

/// Unmatched routes: GETs miss with 404, everything else is 405 (the API
/// surface is read-only).
async fn fallback(method: Method) -> StatusCode {
    if method == Method::GET {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::METHOD_NOT_ALLOWED
    }
}

async fn dashboard_page() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Transaction Anomaly Monitor</title>
<style>
  body { font-family: -apple-system, 'Segoe UI', sans-serif; margin: 0; background: #0f1419; color: #e6e6e6; }
  header { padding: 16px 24px; background: #1a2129; border-bottom: 1px solid #2a3441; }
  h1 { font-size: 18px; margin: 0; }
  main { padding: 24px; max-width: 1100px; margin: 0 auto; }
  .cards { display: grid; grid-template-columns: repeat(auto-fit, minmax(180px, 1fr)); gap: 12px; }
  .card { background: #1a2129; border: 1px solid #2a3441; border-radius: 8px; padding: 14px; }
  .card .label { font-size: 12px; color: #8b98a5; text-transform: uppercase; }
  .card .value { font-size: 26px; margin-top: 6px; }
  .bad { color: #ff6b6b; }
  .ok { color: #51cf66; }
  table { width: 100%; border-collapse: collapse; margin-top: 24px; font-size: 14px; }
  th, td { text-align: left; padding: 8px 10px; border-bottom: 1px solid #2a3441; }
  th { color: #8b98a5; font-weight: 500; }
</style>
</head>
<body>
<header><h1>Transaction Anomaly Monitor</h1></header>
<main>
  <div class="cards">
    <div class="card"><div class="label">Transactions</div><div class="value" id="total">-</div></div>
    <div class="card"><div class="label">Anomalies</div><div class="value" id="anomalies">-</div></div>
    <div class="card"><div class="label">Anomaly rate</div><div class="value" id="rate">-</div></div>
    <div class="card"><div class="label">Throughput /s</div><div class="value" id="tps">-</div></div>
    <div class="card"><div class="label">Avg latency ms</div><div class="value" id="latency">-</div></div>
    <div class="card"><div class="label">Health</div><div class="value" id="health">-</div></div>
  </div>
  <table>
    <thead><tr><th>Transaction</th><th>Score</th><th>Type</th><th>Detected</th></tr></thead>
    <tbody id="recent"></tbody>
  </table>
</main>
<script>
async function refresh() {
  try {
    const m = await (await fetch('/api/metrics')).json();
    document.getElementById('total').textContent = m.totalTransactions;
    document.getElementById('anomalies').textContent = m.totalAnomalies;
    document.getElementById('rate').textContent = (m.anomalyRate * 100).toFixed(2) + '%';
    document.getElementById('tps').textContent = m.processingRatePerSec.toFixed(1);
    document.getElementById('latency').textContent = m.avgProcessingTimeMs.toFixed(2);
    const health = document.getElementById('health');
    health.textContent = m.healthy ? 'HEALTHY' : 'DEGRADED';
    health.className = 'value ' + (m.healthy ? 'ok' : 'bad');

    const recent = await (await fetch('/api/anomalies')).json();
    document.getElementById('recent').innerHTML = recent.map(a =>
      `<tr><td>${a.txnId}</td><td>${a.score.toFixed(3)}</td><td>${a.anomalyType}</td><td>${a.ts}</td></tr>`
    ).join('');
  } catch (e) { /* dashboard keeps polling */ }
}
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use tower::ServiceExt;

    fn state() -> ApiState {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        ApiState {
            metrics: Arc::new(PipelineMetrics::new(clock.clone())),
            clock,
            detector_name: "enhanced-ensemble",
        }
    }

    #[tokio::test]
    async fn method_and_path_policy() {
        let app = router(state());

        let ok = app
            .clone()
            .oneshot(Request::get("/api/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let post_known = app
            .clone()
            .oneshot(Request::post("/api/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(post_known.status(), StatusCode::METHOD_NOT_ALLOWED);

        let get_missing = app
            .clone()
            .oneshot(Request::get("/api/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get_missing.status(), StatusCode::NOT_FOUND);

        let post_missing = app
            .clone()
            .oneshot(Request::post("/api/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(post_missing.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn json_responses_allow_any_origin() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::get("/api/metrics")
                    .header("origin", "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn health_returns_503_when_degraded() {
        let s = state();
        s.metrics.set_system_gauges(0, 0.99);
        let app = router(s);
        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn dashboard_page_is_served() {
        let app = router(state());
        let resp = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("setInterval(refresh, 5000)"));
    }
}
