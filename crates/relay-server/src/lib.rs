//! # relay-server
//!
//! Axum HTTP + `WebSocket` relay hub.
//!
//! - `WebSocket` gateway: admission by `device-id` / `product-id`, per-connection
//!   rate limiting, hub-wide heartbeat, identifier-addressed fan-out
//! - HTTP endpoints: health check, Prometheus metrics, latest-firmware lookup
//! - CORS and per-client HTTP ingress rate limiting
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
