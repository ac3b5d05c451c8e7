//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): relayed requests by method, status
//! - `proxy_response_bytes_total` (counter): relayed response body bytes
//! - `proxy_upstream_errors_total` (counter): failures by kind
//! - `proxy_tunnels_total` (counter): CONNECT outcomes
//! - `proxy_active_tunnels` (gauge): tunnels currently relaying
//! - `proxy_tunnel_bytes_total` (counter): tunneled bytes by direction
//! - `proxy_active_connections` (gauge): tracked client connections
//!
//! Without an installed exporter every call is a no-op.

use std::net::SocketAddr;

use axum::http::Method;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &Method, status: u16, bytes: u64) {
    metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::counter!("proxy_response_bytes_total").increment(bytes);
}

/// `kind` is one of `build`, `call`, `dial`, `upgrade`.
pub fn record_upstream_error(kind: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_tunnel(outcome: &'static str) {
    metrics::counter!("proxy_tunnels_total", "outcome" => outcome).increment(1);
}

pub fn tunnel_opened() {
    metrics::gauge!("proxy_active_tunnels").increment(1.0);
}

pub fn tunnel_closed(client_to_destination: u64, destination_to_client: u64) {
    metrics::gauge!("proxy_active_tunnels").decrement(1.0);
    metrics::counter!("proxy_tunnel_bytes_total", "direction" => "upstream")
        .increment(client_to_destination);
    metrics::counter!("proxy_tunnel_bytes_total", "direction" => "downstream")
        .increment(destination_to_client);
}

pub fn connection_opened() {
    metrics::gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("proxy_active_connections").decrement(1.0);
}
