//! Metrics registry for certwarden observability
//!
//! Provides OpenTelemetry metrics for:
//! - Controller sync passes
//! - Certificate expiry
//! - ACME client requests
//!
//! Instruments are recorded fire-and-forget; the export pipeline is set up
//! by [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Global meter for certwarden metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("certwarden"));

// ============================================================================
// Controller Metrics
// ============================================================================

/// Counter of reconciliation passes
///
/// Labels:
/// - `controller`: controller name
pub static CONTROLLER_SYNC_CALL_COUNT: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("certwarden_controller_sync_call_count")
        .with_description("The number of sync() calls made by a controller")
        .with_unit("{calls}")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `controller`: controller name
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("certwarden_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Certificate Metrics
// ============================================================================

/// Gauge of certificate expiry as a unix timestamp
///
/// Labels:
/// - `name`: certificate name
/// - `namespace`: certificate namespace
pub static CERTIFICATE_EXPIRATION_TIMESTAMP: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("certwarden_certificate_expiration_timestamp_seconds")
        .with_description("The date after which the certificate expires")
        .with_unit("s")
        .build()
});

// ============================================================================
// ACME Metrics
// ============================================================================

/// Counter of requests made to ACME servers
///
/// Labels:
/// - `method`: operation (new_account, new_order, finalize, ...)
/// - `status`: ok, error
pub static ACME_CLIENT_REQUEST_COUNT: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("certwarden_acme_client_request_count")
        .with_description("The number of requests made by the ACME client")
        .with_unit("{requests}")
        .build()
});

/// Error classification for reconcile error metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorType {
    /// Retried with backoff
    Transient,
    /// Dropped until the resource changes
    Permanent,
}

impl ErrorType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Record one sync pass for `controller`
pub fn record_sync_call(controller: &str) {
    CONTROLLER_SYNC_CALL_COUNT.add(1, &[KeyValue::new("controller", controller.to_string())]);
}

/// Record a reconcile error for `controller`
pub fn record_reconcile_error(controller: &str, error_type: ErrorType) {
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("error_type", error_type.as_str()),
        ],
    );
}

/// Publish the expiry of a certificate
pub fn update_certificate_expiry(
    namespace: &str,
    name: &str,
    not_after: chrono::DateTime<chrono::Utc>,
) {
    CERTIFICATE_EXPIRATION_TIMESTAMP.record(
        not_after.timestamp() as f64,
        &[
            KeyValue::new("name", name.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
        ],
    );
}

/// Reset the expiry series of a deleted certificate
///
/// OpenTelemetry gauges cannot drop a series, so a deleted certificate
/// reports zero until the exporter's staleness window removes it.
pub fn remove_certificate_expiry(namespace: &str, name: &str) {
    CERTIFICATE_EXPIRATION_TIMESTAMP.record(
        0.0,
        &[
            KeyValue::new("name", name.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
        ],
    );
}

/// Record one ACME request
pub fn record_acme_request(method: &str, ok: bool) {
    ACME_CLIENT_REQUEST_COUNT.add(
        1,
        &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", if ok { "ok" } else { "error" }),
        ],
    );
}
