//! Metrics collection and exposition.
//!
//! # Metrics
//! - `conduit_connections_total` (counter): accepted connections
//! - `conduit_active_connections` (gauge): currently open connections
//! - `conduit_requests_total` (counter): responses by protocol and status
//! - `conduit_tls_handshake_failures_total` (counter)
//! - `conduit_forwarded_rejected_total` (counter): malformed or untrusted
//!   forwarding headers
//! - `conduit_crlf_rejected_total` (counter)

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Starts the Prometheus scrape endpoint. Must run inside the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn connection_opened() {
    ::metrics::counter!("conduit_connections_total").increment(1);
    ::metrics::gauge!("conduit_active_connections").increment(1.0);
}

pub fn connection_closed() {
    ::metrics::gauge!("conduit_active_connections").decrement(1.0);
}

pub fn record_request(protocol: &'static str, status: u16) {
    ::metrics::counter!(
        "conduit_requests_total",
        "protocol" => protocol,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn tls_handshake_failed() {
    ::metrics::counter!("conduit_tls_handshake_failures_total").increment(1);
}

pub fn forwarded_rejected() {
    ::metrics::counter!("conduit_forwarded_rejected_total").increment(1);
}

pub fn crlf_rejected() {
    ::metrics::counter!("conduit_crlf_rejected_total").increment(1);
}
