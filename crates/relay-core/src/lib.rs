//! # relay-core
//!
//! Foundation types shared by the relay hub crates.
//!
//! - Branded ID newtypes for connections and the two identifier namespaces
//! - `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, DeviceId, ProductId};
