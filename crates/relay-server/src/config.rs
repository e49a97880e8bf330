//! Server configuration.

use std::time::Duration;

use relay_settings::RelaySettings;
use serde::{Deserialize, Serialize};

use crate::websocket::registry::HubLimits;

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub outbound_queue: usize,
    /// Liveness sweep interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Wait for a close handshake before dropping the transport, in milliseconds.
    pub close_grace_ms: u64,
    /// Inbound messages allowed per connection per window.
    pub rate_limit_max: u32,
    /// Per-connection rate window in milliseconds.
    pub rate_limit_window_ms: u64,
    /// HTTP requests allowed per client per window.
    pub http_rate_limit_max: u32,
    /// HTTP rate window in milliseconds.
    pub http_rate_limit_window_ms: u64,
    /// Allowed CORS origins; empty allows any.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 16 * 1024 * 1024, // 16 MiB
            outbound_queue: 256,
            heartbeat_interval_ms: 15_000,
            close_grace_ms: 2_000,
            rate_limit_max: 25,
            rate_limit_window_ms: 1_000,
            http_rate_limit_max: 5,
            http_rate_limit_window_ms: 1_000,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Liveness sweep interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Close handshake grace period.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// HTTP ingress window.
    pub fn http_rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.http_rate_limit_window_ms)
    }

    /// Per-connection limits for the registry.
    pub fn hub_limits(&self) -> HubLimits {
        HubLimits {
            outbound_queue: self.outbound_queue,
            rate_limit_max: self.rate_limit_max,
            rate_limit_window: Duration::from_millis(self.rate_limit_window_ms),
        }
    }
}

impl From<&RelaySettings> for ServerConfig {
    fn from(settings: &RelaySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_message_size: server.max_message_size,
            outbound_queue: server.outbound_queue,
            heartbeat_interval_ms: server.heartbeat_interval_ms,
            close_grace_ms: server.close_grace_ms,
            rate_limit_max: server.rate_limit.max_messages,
            rate_limit_window_ms: server.rate_limit.window_ms,
            http_rate_limit_max: settings.http.rate_limit.max_messages,
            http_rate_limit_window_ms: settings.http.rate_limit.window_ms,
            cors_origins: settings.http.cors_origins.clone(),
        }
    }
}
