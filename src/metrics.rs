//! Prometheus metrics for authentication and settlement.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `hbar_gate_auth_requests_total` | Counter | `method` |
//! | `hbar_gate_auth_failures_total` | Counter | `method`, `reason` |
//! | `hbar_gate_api_requests_total` | Counter | `endpoint`, `status` |
//! | `hbar_gate_payments_total` | Counter | `status` |
//! | `hbar_gate_credits_purchased_total` | Counter | `account` |
//! | `hbar_gate_credits_consumed_total` | Counter | `account` |
//! | `hbar_gate_key_rotations_total` | Counter | `account` |
//! | `hbar_gate_api_key_age_days` | Histogram | |
//! | `hbar_gate_operation_duration_seconds` | Histogram | `operation` |
//!
//! All metrics are lock-free and safe to share across threads; the sink is
//! cheap to clone.

use crate::error::Result;
use prometheus::{
    CounterVec, Histogram, HistogramOpts, HistogramTimer, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Label values longer than this are truncated to bound series cardinality.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for API key age, in days.
pub const KEY_AGE_BUCKETS: &[f64] = &[7.0, 30.0, 60.0, 90.0, 180.0, 365.0];

/// Buckets for operation latency, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

#[derive(Clone)]
pub struct MetricsSink {
    registry: Registry,
    auth_requests: CounterVec,
    auth_failures: CounterVec,
    api_requests: CounterVec,
    payments: CounterVec,
    credits_purchased: CounterVec,
    credits_consumed: CounterVec,
    key_rotations: CounterVec,
    key_age_days: Histogram,
    operation_duration: HistogramVec,
}

impl MetricsSink {
    /// Create a sink with its own registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register every metric family with `registry`.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<CounterVec> {
            let vec = CounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let auth_requests = counter(
            "hbar_gate_auth_requests_total",
            "Authentication requests by method",
            &["method"],
        )?;
        let auth_failures = counter(
            "hbar_gate_auth_failures_total",
            "Rejected authentication attempts by method and reason",
            &["method", "reason"],
        )?;
        let api_requests = counter(
            "hbar_gate_api_requests_total",
            "Authenticated API requests by endpoint and status",
            &["endpoint", "status"],
        )?;
        let payments = counter(
            "hbar_gate_payments_total",
            "Payment status transitions",
            &["status"],
        )?;
        let credits_purchased = counter(
            "hbar_gate_credits_purchased_total",
            "Credits granted by settled payments",
            &["account"],
        )?;
        let credits_consumed = counter(
            "hbar_gate_credits_consumed_total",
            "Credits spent on metered usage",
            &["account"],
        )?;
        let key_rotations = counter(
            "hbar_gate_key_rotations_total",
            "API keys issued to replace a key inside its rotation window",
            &["account"],
        )?;

        let key_age_days = Histogram::with_opts(
            HistogramOpts::new(
                "hbar_gate_api_key_age_days",
                "Age of API keys when used, in days",
            )
            .buckets(KEY_AGE_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(key_age_days.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "hbar_gate_operation_duration_seconds",
                "Duration of authentication and settlement operations",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            registry,
            auth_requests,
            auth_failures,
            api_requests,
            payments,
            credits_purchased,
            credits_consumed,
            key_rotations,
            key_age_days,
            operation_duration,
        })
    }

    pub fn record_auth_request(&self, method: &str) {
        self.auth_requests
            .with_label_values(&[truncate_label(method)])
            .inc();
    }

    pub fn record_auth_failure(&self, method: &str, reason: &str) {
        self.auth_failures
            .with_label_values(&[truncate_label(method), truncate_label(reason)])
            .inc();
    }

    pub fn record_api_request(&self, endpoint: &str, status: u16) {
        let status = status.to_string();
        self.api_requests
            .with_label_values(&[truncate_label(endpoint), status.as_str()])
            .inc();
    }

    pub fn record_payment(&self, status: &str) {
        self.payments.with_label_values(&[truncate_label(status)]).inc();
    }

    pub fn record_credits_purchased(&self, account: &str, credits: u64) {
        self.credits_purchased
            .with_label_values(&[truncate_label(account)])
            .inc_by(credits as f64);
    }

    pub fn record_credits_consumed(&self, account: &str, credits: u64) {
        self.credits_consumed
            .with_label_values(&[truncate_label(account)])
            .inc_by(credits as f64);
    }

    pub fn record_key_rotation(&self, account: &str) {
        self.key_rotations
            .with_label_values(&[truncate_label(account)])
            .inc();
    }

    pub fn observe_key_age(&self, days: f64) {
        self.key_age_days.observe(days.max(0.0));
    }

    /// Starts a timer that records into `operation_duration_seconds` when
    /// dropped.
    pub fn start_timer(&self, operation: &str) -> HistogramTimer {
        self.operation_duration
            .with_label_values(&[truncate_label(operation)])
            .start_timer()
    }

    /// Prometheus text exposition (`HELP`/`TYPE` lines included).
    pub fn render(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

/// Truncate on a char boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
