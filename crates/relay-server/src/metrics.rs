//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections released from the registry (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Registered WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrade requests refused at admission (counter, labels: reason).
pub const WS_ADMISSION_REJECTS_TOTAL: &str = "ws_admission_rejects_total";
/// Inbound messages routed (counter).
pub const WS_MESSAGES_ROUTED_TOTAL: &str = "ws_messages_routed_total";
/// Inbound messages discarded as malformed (counter).
pub const WS_MESSAGES_DISCARDED_TOTAL: &str = "ws_messages_discarded_total";
/// Deliveries dropped on a full outbound queue (counter).
pub const WS_DELIVERY_DROPS_TOTAL: &str = "ws_delivery_drops_total";
/// Connections closed for exceeding the message rate (counter).
pub const WS_RATE_LIMIT_CLOSES_TOTAL: &str = "ws_rate_limit_closes_total";
/// Connections evicted by the liveness monitor (counter).
pub const WS_LIVENESS_EVICTIONS_TOTAL: &str = "ws_liveness_evictions_total";
/// WebSocket connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// HTTP requests answered with 429 (counter).
pub const HTTP_RATE_LIMITED_TOTAL: &str = "http_rate_limited_total";
/// Firmware lookups (counter, labels: outcome).
pub const FIRMWARE_LOOKUPS_TOTAL: &str = "firmware_lookups_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_ADMISSION_REJECTS_TOTAL,
            WS_MESSAGES_ROUTED_TOTAL,
            WS_MESSAGES_DISCARDED_TOTAL,
            WS_DELIVERY_DROPS_TOTAL,
            WS_RATE_LIMIT_CLOSES_TOTAL,
            WS_LIVENESS_EVICTIONS_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            HTTP_RATE_LIMITED_TOTAL,
            FIRMWARE_LOOKUPS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
