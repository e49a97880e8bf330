//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial JSON
//! is accepted and missing fields get their production default.

use relay_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Root settings type for the relay hub.
///
/// Loaded from `~/.relay-hub/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "server": { "port": 9000, "rateLimit": { "maxMessages": 50 } },
///   "logging": { "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// WebSocket relay settings.
    pub server: ServerSettings,
    /// Plain HTTP ingress settings.
    pub http: HttpSettings,
    /// Firmware lookup settings.
    pub firmware: FirmwareSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations that would make the relay misbehave at runtime.
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.heartbeat_interval_ms == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be greater than 0".into(),
            ));
        }
        if self.server.outbound_queue == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "server.outboundQueue must be greater than 0".into(),
            ));
        }
        self.server.rate_limit.validate("server.rateLimit")?;
        self.http.rate_limit.validate("http.rateLimit")?;
        Ok(())
    }
}

/// WebSocket relay settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (HTTP and WebSocket share it).
    pub port: u16,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before deliveries are dropped.
    pub outbound_queue: usize,
    /// Liveness probe interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long a locally-initiated close waits for the peer before the
    /// transport is dropped, in milliseconds.
    pub close_grace_ms: u64,
    /// Inbound message rate limit per connection.
    pub rate_limit: RateLimitSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
            outbound_queue: 256,
            heartbeat_interval_ms: 15_000,
            close_grace_ms: 2_000,
            rate_limit: RateLimitSettings {
                window_ms: 1_000,
                max_messages: 25,
            },
        }
    }
}

/// Fixed-window rate limit parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Messages allowed per window.
    pub max_messages: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            max_messages: 25,
        }
    }
}

impl RateLimitSettings {
    fn validate(&self, path: &str) -> crate::Result<()> {
        if self.window_ms == 0 || self.max_messages == 0 {
            return Err(crate::SettingsError::InvalidValue(format!(
                "{path} window and limit must both be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Plain HTTP ingress settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
    /// Per-client request rate limit for HTTP routes.
    pub rate_limit: RateLimitSettings,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            cors_origins: Vec::new(),
            rate_limit: RateLimitSettings {
                window_ms: 1_000,
                max_messages: 5,
            },
        }
    }
}

/// Firmware lookup settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirmwareSettings {
    /// Directory holding firmware objects. Lookup is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Public URL prefix the object key is appended to.
    pub public_base_url: String,
    /// Only keys starting with this prefix are considered.
    pub prefix: String,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self {
            directory: None,
            public_base_url: "http://localhost:8080/firmware/files".to_string(),
            prefix: String::new(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
