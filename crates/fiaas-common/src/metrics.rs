//! OpenTelemetry metrics for the deploy controller
//!
//! Instruments are created lazily from the global meter provider, so they are
//! no-ops until telemetry is initialized with an OTLP endpoint.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("fiaas"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of reconciliation duration
///
/// Labels:
/// - `app`: application name
/// - `result`: running, failed, cancelled
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("fiaas_reconcile_duration_seconds")
        .with_description("Duration of application reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of finished reconciliations
///
/// Labels:
/// - `result`: running, failed, cancelled
pub static RECONCILE_RESULTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fiaas_reconcile_results_total")
        .with_description("Total number of finished reconciliations by result")
        .with_unit("{reconciliations}")
        .build()
});

/// Counter of optimistic-concurrency conflicts seen while applying objects
///
/// Labels:
/// - `kind`: Deployment, Service, Ingress, HorizontalPodAutoscaler
pub static APPLY_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fiaas_apply_conflicts_total")
        .with_description("Total number of resourceVersion conflicts during apply")
        .with_unit("{conflicts}")
        .build()
});

// ============================================================================
// Notification Metrics
// ============================================================================

/// Counter of outbound pipeline notifications
///
/// Labels:
/// - `event`: deploy_started, deploy_end
/// - `outcome`: delivered, failed
pub static NOTIFICATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fiaas_notifications_total")
        .with_description("Total number of pipeline notifications by outcome")
        .with_unit("{notifications}")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconciliation and records its result on completion
pub struct ReconcileTimer {
    app: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record completion with the given result label
    pub fn finish(self, result: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("app", self.app),
                KeyValue::new("result", result),
            ],
        );
        RECONCILE_RESULTS.add(1, &[KeyValue::new("result", result)]);
    }
}

/// Record one apply conflict for the given kind
pub fn record_conflict(kind: &str) {
    APPLY_CONFLICTS.add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record one notification attempt
pub fn record_notification(event: &str, delivered: bool) {
    let outcome = if delivered { "delivered" } else { "failed" };
    NOTIFICATIONS.add(
        1,
        &[
            KeyValue::new("event", event.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}
