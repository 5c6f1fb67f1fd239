pub mod prometheus_metrics;

pub use prometheus_metrics::{
    METRICS_REGISTRY, MetricsRegistry, metrics_handler, record_rotation_failures,
    record_rotation_outcome, record_signing_duration, record_token_issued, record_token_verified,
    record_validation_failure,
};
