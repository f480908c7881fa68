use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port of the Prometheus scrape endpoint.
pub const METRICS_PORT: u16 = 9000;

/// Installs the global metrics recorder and serves it on `[::]:9000/metrics`.
///
/// Every recorded series carries the `workspace` and `destination` global labels when given.
pub fn init_metrics(workspace_id: Option<&str>, destination_id: Option<&str>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        METRICS_PORT,
    ));

    if let Some(workspace_id) = workspace_id {
        builder = builder.add_global_label("workspace", workspace_id);
    }
    if let Some(destination_id) = destination_id {
        builder = builder.add_global_label("destination", destination_id);
    }

    builder.install()?;

    Ok(())
}
