//! Prometheus metrics for boot observability.
//!
//! Metrics are exported from a dedicated listener so the scrape path never
//! competes with booting machines on the public port. The stage-1 counter is
//! the primary alerting signal: a machine that stops requesting stage 1 has
//! stopped booting.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors raised while building or encoding metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registration or encoding failed inside the prometheus client.
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// The boot server's metric family handles.
pub struct Metrics {
    registry: Registry,

    /// Stage-1 requests served, labeled by host name.
    pub stage1_total: CounterVec,

    /// Request handling latency, labeled by target.
    pub request_duration: HistogramVec,
}

impl Metrics {
    /// Creates and registers all metric families.
    ///
    /// # Errors
    ///
    /// Fails only when a family cannot be registered, which indicates a
    /// duplicate registration bug.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let stage1_total = CounterVec::new(
            Opts::new("epoxy_stage1_total", "Number of stage1 requests served per host."),
            &["host"],
        )?;
        registry.register(Box::new(stage1_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "epoxy_request_duration_seconds",
                "Time spent handling boot requests.",
            ),
            &["target"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self { registry, stage1_total, request_duration })
    }

    /// Encodes every registered family in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Propagates encoder failures.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// A router serving `/metrics` for the dedicated scrape listener.
    pub fn router(metrics: &Arc<Self>) -> Router {
        let metrics = Arc::clone(metrics);
        Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    metrics
                        .encode_text()
                        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage1_counter_appears_in_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.stage1_total.with_label_values(&["m1.example.org"]).inc();
        metrics.stage1_total.with_label_values(&["m1.example.org"]).inc();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("epoxy_stage1_total{host=\"m1.example.org\"} 2"));
    }

    #[test]
    fn request_duration_records_observations() {
        let metrics = Metrics::new().unwrap();
        metrics
            .request_duration
            .with_label_values(&["stage1.ipxe"])
            .observe(0.02);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("epoxy_request_duration_seconds"));
    }
}
