//! Connection registry, liveness, rate limiting, and message routing.

pub mod admission;
pub mod connection;
pub mod heartbeat;
pub mod lifecycle;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod session;
