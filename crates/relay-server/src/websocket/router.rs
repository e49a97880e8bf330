//! Inbound message validation and routing.
//!
//! A relayed message is any JSON object carrying a `target` of `"device"` or
//! `"product"` and the matching non-empty `deviceId` / `productId`. All other
//! fields are opaque and forwarded as-is.

use std::sync::Arc;

use metrics::counter;
use relay_core::{DeviceId, ProductId};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::Connection;
use super::lifecycle::{CloseReason, LifecycleEvent};
use super::registry::HubRegistry;
use crate::metrics::{
    WS_MESSAGES_DISCARDED_TOTAL, WS_MESSAGES_ROUTED_TOTAL, WS_RATE_LIMIT_CLOSES_TOTAL,
};

/// Validated destination of a relayed message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every open connection registered under this device identifier.
    Device(DeviceId),
    /// Every open connection registered under this product identifier.
    Product(ProductId),
}

impl Target {
    /// Namespace name as it appears in the `target` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Device(_) => "device",
            Self::Product(_) => "product",
        }
    }

    /// The addressed identifier.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Device(id) => id.as_str(),
            Self::Product(id) => id.as_str(),
        }
    }
}

/// A parsed message ready for fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Resolved destination.
    pub target: Target,
    /// The full message object, addressing fields included.
    pub message: Map<String, Value>,
}

impl Envelope {
    /// Serialize the whole message for delivery.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.message)
    }
}

/// Why an inbound message was discarded.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    /// Not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// Valid JSON, but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// `target` missing or not one of the known namespaces.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// `target` is `"device"` without a usable `deviceId`.
    #[error("missing deviceId for device target")]
    MissingDeviceId,
    /// `target` is `"product"` without a usable `productId`.
    #[error("missing productId for product target")]
    MissingProductId,
}

/// Parse and validate one inbound text frame.
pub fn parse_envelope(text: &str) -> Result<Envelope, MalformedMessage> {
    let Value::Object(message) = serde_json::from_str::<Value>(text)? else {
        return Err(MalformedMessage::NotAnObject);
    };

    let target = match message.get("target") {
        Some(Value::String(kind)) if kind == "device" => {
            let id = non_empty_str(&message, "deviceId").ok_or(MalformedMessage::MissingDeviceId)?;
            Target::Device(DeviceId::from(id))
        }
        Some(Value::String(kind)) if kind == "product" => {
            let id =
                non_empty_str(&message, "productId").ok_or(MalformedMessage::MissingProductId)?;
            Target::Product(ProductId::from(id))
        }
        Some(other) => return Err(MalformedMessage::InvalidTarget(other.to_string())),
        None => return Err(MalformedMessage::InvalidTarget("<missing>".into())),
    };

    Ok(Envelope { target, message })
}

fn non_empty_str<'a>(message: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    message
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum Disposition {
    /// Fanned out; `recipients` may be zero.
    Routed {
        /// Connections the message was queued for.
        recipients: usize,
    },
    /// Dropped without affecting the connection.
    Discarded(MalformedMessage),
    /// Over the rate limit; the connection is closing.
    RateLimited,
    /// The connection is no longer open.
    Ignored,
}

/// Rate-limit, validate and route one inbound frame from `conn`.
pub fn handle_inbound(
    hub: &HubRegistry,
    conn: &Arc<Connection>,
    text: &str,
    now: Instant,
) -> Disposition {
    if !conn.is_open() {
        return Disposition::Ignored;
    }

    if !conn.admit_message(now) {
        counter!(WS_RATE_LIMIT_CLOSES_TOTAL).increment(1);
        warn!(conn_id = %conn.id, role = %conn.role(), "rate limit exceeded, closing");
        let _ = hub.dispatch(
            conn,
            LifecycleEvent::CloseRequested(CloseReason::RateLimitExceeded),
        );
        return Disposition::RateLimited;
    }

    match parse_envelope(text) {
        Ok(envelope) => {
            let recipients = hub.route(&envelope);
            counter!(WS_MESSAGES_ROUTED_TOTAL).increment(1);
            debug!(
                conn_id = %conn.id,
                target = envelope.target.kind(),
                identifier = envelope.target.identifier(),
                recipients,
                "message routed"
            );
            Disposition::Routed { recipients }
        }
        Err(error) => {
            counter!(WS_MESSAGES_DISCARDED_TOTAL).increment(1);
            warn!(conn_id = %conn.id, %error, "discarding malformed message");
            Disposition::Discarded(error)
        }
    }
}
