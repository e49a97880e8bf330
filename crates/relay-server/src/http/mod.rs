//! Plain HTTP glue around the relay: firmware lookup and ingress policy.

pub mod firmware;
pub mod ingress;
