use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::error;

use crate::certs::rotation::RotationOutcome;

lazy_static! {
    /// Global metrics registry. `None` only if metric registration failed at startup.
    pub static ref METRICS_REGISTRY: Option<Arc<MetricsRegistry>> = match MetricsRegistry::new() {
        Ok(registry) => Some(Arc::new(registry)),
        Err(e) => {
            error!("Failed to initialize metrics registry: {}", e);
            None
        }
    };
}

pub struct MetricsRegistry {
    pub registry: Registry,

    // Token metrics
    pub tokens_issued_total: IntCounterVec,
    pub token_validation_failures_total: IntCounterVec,
    pub tokens_verified_total: IntCounterVec,
    pub token_signing_duration_seconds: Histogram,

    // Rotation metrics
    pub rotation_actions_total: IntCounterVec,
    pub rotation_failures_total: IntCounter,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tokens_issued_total = IntCounterVec::new(
            Opts::new("jvs_tokens_issued_total", "Total number of justification tokens issued"),
            &["key"],
        )?;

        let token_validation_failures_total = IntCounterVec::new(
            Opts::new(
                "jvs_token_validation_failures_total",
                "Token requests rejected during justification validation",
            ),
            &["reason"],
        )?;

        let tokens_verified_total = IntCounterVec::new(
            Opts::new("jvs_tokens_verified_total", "Token verification attempts"),
            &["result"],
        )?;

        let token_signing_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "jvs_token_signing_duration_seconds",
                "Time spent signing a token with the backend",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;

        let rotation_actions_total = IntCounterVec::new(
            Opts::new("jvs_rotation_actions_total", "Key version lifecycle actions applied"),
            &["action"],
        )?;

        let rotation_failures_total = IntCounter::new(
            "jvs_rotation_failures_total",
            "Keys whose rotation failed",
        )?;

        registry.register(Box::new(tokens_issued_total.clone()))?;
        registry.register(Box::new(token_validation_failures_total.clone()))?;
        registry.register(Box::new(tokens_verified_total.clone()))?;
        registry.register(Box::new(token_signing_duration_seconds.clone()))?;
        registry.register(Box::new(rotation_actions_total.clone()))?;
        registry.register(Box::new(rotation_failures_total.clone()))?;

        Ok(Self {
            registry,
            tokens_issued_total,
            token_validation_failures_total,
            tokens_verified_total,
            token_signing_duration_seconds,
            rotation_actions_total,
            rotation_failures_total,
        })
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

// Convenience functions for common metrics operations

pub fn record_token_issued(key: &str) {
    if let Some(metrics) = METRICS_REGISTRY.as_ref() {
        metrics.tokens_issued_total.with_label_values(&[key]).inc();
    }
}

pub fn record_validation_failure(reason: &str) {
    if let Some(metrics) = METRICS_REGISTRY.as_ref() {
        metrics
            .token_validation_failures_total
            .with_label_values(&[reason])
            .inc();
    }
}

pub fn record_token_verified(result: &str) {
    if let Some(metrics) = METRICS_REGISTRY.as_ref() {
        metrics.tokens_verified_total.with_label_values(&[result]).inc();
    }
}

pub fn record_signing_duration(duration_secs: f64) {
    if let Some(metrics) = METRICS_REGISTRY.as_ref() {
        metrics.token_signing_duration_seconds.observe(duration_secs);
    }
}

pub fn record_rotation_outcome(outcome: &RotationOutcome) {
    let Some(metrics) = METRICS_REGISTRY.as_ref() else {
        return;
    };
    let actions = &metrics.rotation_actions_total;
    if outcome.created.is_some() {
        actions.with_label_values(&["create"]).inc();
    }
    if outcome.promoted.is_some() {
        actions.with_label_values(&["promote"]).inc();
    }
    if outcome.demoted.is_some() {
        actions.with_label_values(&["demote"]).inc();
    }
    actions
        .with_label_values(&["disable"])
        .inc_by(outcome.disabled.len() as u64);
    actions
        .with_label_values(&["destroy"])
        .inc_by(outcome.destroy_scheduled.len() as u64);
}

pub fn record_rotation_failures(count: usize) {
    if let Some(metrics) = METRICS_REGISTRY.as_ref() {
        metrics.rotation_failures_total.inc_by(count as u64);
    }
}

/// Metrics handler for Prometheus
pub async fn metrics_handler() -> Response {
    let rendered = match METRICS_REGISTRY.as_ref() {
        Some(metrics) => metrics.render().map_err(|e| e.to_string()),
        None => Err("metrics registry unavailable".to_string()),
    };

    match rendered {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        )
            .into_response(),
    }
}
