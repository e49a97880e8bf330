//! Per-connection lifecycle state machine.
//!
//! Transport callbacks are reduced to [`LifecycleEvent`]s and fed through
//! [`step`], a pure function returning the next state plus the side effects
//! the registry must carry out. Keeping the transitions pure makes close
//! idempotency and teardown ordering testable without a socket.
//!
//! ```text
//!  Connecting ──Admitted──▶ Open ──CloseRequested──▶ Closing
//!                            │                        │
//!                            ├──Evicted───────────────┤
//!                            └──TransportClosed──▶ Closed ◀──TransportClosed
//! ```

use axum::extract::ws::close_code;
use thiserror::Error;

/// Lifecycle state of a single connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake accepted, not yet registered.
    Connecting,
    /// Registered and eligible for delivery.
    Open,
    /// Close frame queued; inbound messages are discarded.
    Closing,
    /// Released from the registry. Terminal.
    Closed,
}

/// Why the hub closes a connection on its own initiative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// The inbound message rate exceeded the per-connection limit.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    /// The server is stopping.
    #[error("Server shutting down")]
    ShuttingDown,
}

impl CloseReason {
    /// WebSocket close code sent with this reason.
    pub fn code(self) -> u16 {
        match self {
            Self::RateLimitExceeded => close_code::POLICY,
            Self::ShuttingDown => close_code::AWAY,
        }
    }
}

/// Something that happened to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Admission checks passed.
    Admitted,
    /// The hub wants to close the connection with a close frame.
    CloseRequested(CloseReason),
    /// The hub drops the connection without a closing handshake
    /// (missed heartbeat, server drain).
    Evicted,
    /// The transport closed or failed.
    TransportClosed,
}

/// Side effect the registry performs after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Insert into the connection table and the identifier bucket.
    Register,
    /// Queue a close frame.
    SendClose(CloseReason),
    /// Drop the transport immediately.
    Terminate,
    /// Remove from the connection table and the identifier bucket.
    Release,
}

/// Result of applying one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State after the event.
    pub next: ConnectionState,
    /// Effects to carry out, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: ConnectionState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }
}

/// Apply `event` to `state`.
pub fn step(state: ConnectionState, event: LifecycleEvent) -> Transition {
    use ConnectionState::{Closed, Closing, Connecting, Open};
    use LifecycleEvent::{Admitted, CloseRequested, Evicted, TransportClosed};

    match (state, event) {
        (Connecting, Admitted) => Transition::to(Open, vec![Effect::Register]),
        // Nothing was registered yet.
        (Connecting, TransportClosed | Evicted) => Transition::to(Closed, Vec::new()),
        (Open, CloseRequested(reason)) => Transition::to(Closing, vec![Effect::SendClose(reason)]),
        (Open | Closing, Evicted) => {
            Transition::to(Closed, vec![Effect::Terminate, Effect::Release])
        }
        (Open | Closing, TransportClosed) => Transition::to(Closed, vec![Effect::Release]),
        // Close already in flight, already closed, or out-of-order admission.
        (Connecting, CloseRequested(_))
        | (Open | Closing | Closed, Admitted)
        | (Closing | Closed, CloseRequested(_))
        | (Closed, Evicted | TransportClosed) => Transition::stay(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::{Closed, Closing, Connecting, Open};

    const RATE: LifecycleEvent = LifecycleEvent::CloseRequested(CloseReason::RateLimitExceeded);

    #[test]
    fn admission_registers() {
        let t = step(Connecting, LifecycleEvent::Admitted);
        assert_eq!(t.next, Open);
        assert_eq!(t.effects, vec![Effect::Register]);
    }

    #[test]
    fn close_request_moves_to_closing() {
        let t = step(Open, RATE);
        assert_eq!(t.next, Closing);
        assert_eq!(
            t.effects,
            vec![Effect::SendClose(CloseReason::RateLimitExceeded)]
        );
    }

    #[test]
    fn second_close_request_is_noop() {
        let t = step(Closing, RATE);
        assert_eq!(t, Transition::stay(Closing));
    }

    #[test]
    fn transport_close_releases_once() {
        let first = step(Open, LifecycleEvent::TransportClosed);
        assert_eq!(first.next, Closed);
        assert_eq!(first.effects, vec![Effect::Release]);

        let second = step(first.next, LifecycleEvent::TransportClosed);
        assert_eq!(second.next, Closed);
        assert!(second.effects.is_empty());
    }

    #[test]
    fn closing_then_transport_close_releases() {
        let t = step(Closing, LifecycleEvent::TransportClosed);
        assert_eq!(t.next, Closed);
        assert_eq!(t.effects, vec![Effect::Release]);
    }

    #[test]
    fn eviction_terminates_and_releases() {
        for state in [Open, Closing] {
            let t = step(state, LifecycleEvent::Evicted);
            assert_eq!(t.next, Closed);
            assert_eq!(t.effects, vec![Effect::Terminate, Effect::Release]);
        }
    }

    #[test]
    fn closed_is_terminal() {
        for event in [
            LifecycleEvent::Admitted,
            RATE,
            LifecycleEvent::Evicted,
            LifecycleEvent::TransportClosed,
        ] {
            assert_eq!(step(Closed, event), Transition::stay(Closed));
        }
    }

    #[test]
    fn connecting_close_registers_nothing() {
        let t = step(Connecting, LifecycleEvent::TransportClosed);
        assert_eq!(t.next, Closed);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn close_reason_codes() {
        assert_eq!(CloseReason::RateLimitExceeded.code(), 1008);
        assert_eq!(CloseReason::ShuttingDown.code(), 1001);
        assert_eq!(
            CloseReason::RateLimitExceeded.to_string(),
            "Rate limit exceeded"
        );
    }
}
