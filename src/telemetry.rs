use std::net::SocketAddr;

use color_eyre::eyre::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

pub(crate) const TELEMETRY_COUNTER_SSH_CONNECTIONS: &str = "lighthouse_ssh_connections_total";
pub(crate) const TELEMETRY_COUNTER_AUTH_FAILURES: &str = "lighthouse_auth_failures_total";
pub(crate) const TELEMETRY_COUNTER_NEGOTIATION_TIMEOUTS: &str =
    "lighthouse_negotiation_timeouts_total";
pub(crate) const TELEMETRY_COUNTER_TARGET_CONNECT_FAILURES: &str =
    "lighthouse_target_connect_failures_total";
pub(crate) const TELEMETRY_COUNTER_RELAYED_BYTES: &str = "lighthouse_relayed_bytes_total";
pub(crate) const TELEMETRY_GAUGE_ACTIVE_BRIDGES: &str = "lighthouse_active_bridges";

pub(crate) const TELEMETRY_KEY_REASON: &str = "reason";
pub(crate) const TELEMETRY_KEY_DIRECTION: &str = "direction";

/// Serve every recorded metric in the Prometheus text format on `address`.
pub fn install_exporter(address: SocketAddr) -> color_eyre::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .with_context(|| format!("Error starting metrics exporter on {address}"))
}
