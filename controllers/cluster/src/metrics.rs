//! Prometheus metrics and the probes server.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `aws_controller_reconciliations_total` | Counter | `kind`, `outcome` |
//! | `aws_controller_reconcile_duration_seconds` | Histogram | `kind` |
//! | `aws_controller_failed_dependencies_total` | Counter | `kind` |
//!
//! `/healthz` answers as soon as the server is up, `/readyz` once the
//! watchers are running, `/metrics` serves the registry in text format.

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Reconcile duration buckets in seconds
const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Errors raised while registering or encoding metrics
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode the registry
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result of one reconciliation, as recorded in `outcome`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finished, waiting for the next change
    Success,
    /// Finished, asked to run again later
    Requeue,
    /// Returned an error
    Error,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Requeue => "requeue",
            Outcome::Error => "error",
        }
    }
}

/// Controller metrics plus readiness; shared by every watcher
pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: CounterVec,
    reconcile_duration_seconds: HistogramVec,
    failed_dependencies_total: CounterVec,
    ready: AtomicBool,
}

impl ControllerMetrics {
    /// Create the metrics on a fresh registry
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let reconciliations_total = CounterVec::new(
            Opts::new("aws_controller_reconciliations_total", "Reconciliations by kind and outcome"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new("aws_controller_reconcile_duration_seconds", "Duration of one reconciliation")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["kind"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let failed_dependencies_total = CounterVec::new(
            Opts::new(
                "aws_controller_failed_dependencies_total",
                "Reconciliations that stopped on a dependency that is not ready yet",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(failed_dependencies_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            failed_dependencies_total,
            ready: AtomicBool::new(false),
        })
    }

    /// Record one finished reconciliation of `kind`
    pub fn observe(&self, kind: &str, outcome: Outcome, elapsed: Duration) {
        self.reconciliations_total
            .with_label_values(&[kind, outcome.as_str()])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a reconciliation of `kind` that hit a failed dependency
    pub fn failed_dependency(&self, kind: &str) {
        self.failed_dependencies_total.with_label_values(&[kind]).inc();
    }

    /// Mark the controller ready (or not) for `/readyz`
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether `/readyz` reports ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Registry contents in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(metrics): State<Arc<ControllerMetrics>>) -> Response {
    if metrics.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(metrics): State<Arc<ControllerMetrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode metrics: {e}")).into_response()
        }
    }
}

fn router(metrics: Arc<ControllerMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(metrics)
}

/// Serve the probes and metrics endpoints until the process exits
pub async fn serve(metrics: Arc<ControllerMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {addr}"))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .context("metrics server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_is_encoded() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.observe("AWSCluster", Outcome::Success, Duration::from_millis(120));
        metrics.observe("AWSCluster", Outcome::Requeue, Duration::from_millis(30));
        metrics.failed_dependency("AWSMachine");

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"aws_controller_reconciliations_total{kind="AWSCluster",outcome="success"} 1"#));
        assert!(text.contains(r#"aws_controller_reconciliations_total{kind="AWSCluster",outcome="requeue"} 1"#));
        assert!(text.contains(r#"aws_controller_failed_dependencies_total{kind="AWSMachine"} 1"#));
        assert!(text.contains(r#"aws_controller_reconcile_duration_seconds_count{kind="AWSCluster"} 2"#));
    }

    #[tokio::test]
    async fn test_readyz_follows_ready_flag() {
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        let response = readyz(State(metrics.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        metrics.set_ready(true);
        let response = readyz(State(metrics)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_handler_serves_text() {
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        metrics.observe("AWSMachine", Outcome::Error, Duration::from_secs(1));
        let response = metrics_handler(State(metrics)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
