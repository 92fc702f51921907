use std::net::{Ipv4Addr, SocketAddr};

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

/// Install the Prometheus text exporter on `port`.
///
/// The exporter is an optional capability: a bind or install failure is
/// logged and the gateway keeps running without it. The `vs_opc_*` series
/// are emitted through the `metrics` facade either way.
pub fn install_exporter(port: u16) {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "prometheus exporter listening"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter unavailable, continuing without it"),
    }
}
