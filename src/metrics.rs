//! Operator metrics.
//!
//! Components report through the [`MetricsSink`] trait so that tests can
//! substitute a recording sink. [`PrometheusMetrics`] is the production sink,
//! exposed over HTTP by [`serve_metrics`].

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OperatorError, Result};

/// Gauge of stacks currently being followed.
pub const STACKS_FOLLOWING: &str = "stack_operator_stacks_following";

/// Monotonic counter of stacks ever followed.
pub const STACKS_FOLLOWED_TOTAL: &str = "stack_operator_stacks_followed_total";

/// Destination for operator metrics.
pub trait MetricsSink: Send + Sync {
    /// Increments a metric by one.
    fn increment(&self, name: &str);

    /// Decrements a gauge by one.
    fn decrement(&self, name: &str);

    /// Sets a gauge to a value.
    fn set(&self, name: &str, value: i64);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str) {}

    fn decrement(&self, _name: &str) {}

    fn set(&self, _name: &str, _value: i64) {}
}

/// Prometheus-backed sink.
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    /// Registry holding the operator metrics.
    registry: Registry,
    /// Stacks currently followed.
    stacks_following: IntGauge,
    /// Stacks followed since start.
    stacks_followed_total: IntCounter,
}

impl PrometheusMetrics {
    /// Creates and registers the operator metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be created or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let stacks_following = IntGauge::new(STACKS_FOLLOWING, "Number of stacks currently followed")
            .map_err(|e| OperatorError::internal(format!("Failed to create {STACKS_FOLLOWING}: {e}")))?;
        registry
            .register(Box::new(stacks_following.clone()))
            .map_err(|e| OperatorError::internal(format!("Failed to register {STACKS_FOLLOWING}: {e}")))?;

        let stacks_followed_total =
            IntCounter::new(STACKS_FOLLOWED_TOTAL, "Number of stacks followed since start")
                .map_err(|e| {
                    OperatorError::internal(format!("Failed to create {STACKS_FOLLOWED_TOTAL}: {e}"))
                })?;
        registry
            .register(Box::new(stacks_followed_total.clone()))
            .map_err(|e| {
                OperatorError::internal(format!("Failed to register {STACKS_FOLLOWED_TOTAL}: {e}"))
            })?;

        Ok(Self {
            registry,
            stacks_following,
            stacks_followed_total,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| OperatorError::internal(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| OperatorError::internal(format!("Metrics are not valid UTF-8: {e}")))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, name: &str) {
        match name {
            STACKS_FOLLOWING => self.stacks_following.inc(),
            STACKS_FOLLOWED_TOTAL => self.stacks_followed_total.inc(),
            _ => debug!("Ignoring increment of unknown metric {name}"),
        }
    }

    fn decrement(&self, name: &str) {
        match name {
            STACKS_FOLLOWING => self.stacks_following.dec(),
            // Counters are monotonic
            _ => debug!("Ignoring decrement of metric {name}"),
        }
    }

    fn set(&self, name: &str, value: i64) {
        match name {
            STACKS_FOLLOWING => self.stacks_following.set(value),
            _ => debug!("Ignoring set of metric {name}"),
        }
    }
}

/// Routes serving the Prometheus scrape endpoint.
pub fn metrics_routes(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// GET /metrics
async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    match metrics.render() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(text))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            warn!("Failed to render metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves `/metrics` on `listener` until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Serving metrics on http://{addr}/metrics");
    }

    axum::serve(listener, metrics_routes(metrics))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| OperatorError::internal(format!("Metrics server failed: {e}")))
}
