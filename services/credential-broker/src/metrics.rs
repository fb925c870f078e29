//! Prometheus metrics
//!
//! - `broker_requests_total` (counter): labels `op`, `outcome`
//! - `broker_request_duration_seconds` (histogram): label `op`
//! - `broker_rate_limited_total` (counter)
//! - `broker_peer_rejections_total` (counter)
//! - `broker_oauth_sessions_active` (gauge)
//! - `broker_refresh_total` (counter, emitted by the refresh crate): label `outcome`
//!
//! Without an installed recorder every call here is a no-op. The exporter is
//! only installed when `[metrics].listen_addr` is configured.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

const REQUEST_DURATION: &str = "broker_request_duration_seconds";

/// Buckets from 1ms to 30s. Local store operations land at the low end,
/// provider round trips (exchange, poll, refresh) at the high end.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
}

/// Install the global recorder with an HTTP scrape endpoint on `addr`.
///
/// Must be called from inside the tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    builder()?.with_http_listener(addr).install()
}

/// Record a completed request.
pub fn record_request(op: &'static str, outcome: &str, duration_secs: f64) {
    metrics::counter!("broker_requests_total", "op" => op, "outcome" => outcome.to_string())
        .increment(1);
    metrics::histogram!(REQUEST_DURATION, "op" => op).record(duration_secs);
}

pub fn record_rate_limited() {
    metrics::counter!("broker_rate_limited_total").increment(1);
}

pub fn record_peer_rejection() {
    metrics::counter!("broker_peer_rejections_total").increment(1);
}

pub fn set_sessions_active(active: usize) {
    metrics::gauge!("broker_oauth_sessions_active").set(active as f64);
}
