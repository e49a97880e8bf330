//! Relay connection state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use relay_core::{ConnectionId, DeviceId, ProductId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::lifecycle::{self, CloseReason, ConnectionState, Effect, LifecycleEvent};
use super::rate_limit::SlidingWindowCounter;

/// The identifier namespace a connection is bound to. Fixed at admission.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Hand-held or companion device.
    Device(DeviceId),
    /// Fixed product endpoint.
    Product(ProductId),
}

impl Role {
    /// Namespace name, as used in the `target` field of messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Device(_) => "device",
            Self::Product(_) => "product",
        }
    }

    /// The identifier within the namespace.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Device(id) => id.as_str(),
            Self::Product(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.identifier())
    }
}

/// Frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Relayed JSON text.
    Text(Arc<str>),
    /// Heartbeat ping.
    Probe,
    /// Close frame; the writer stops after sending it.
    Close(CloseReason),
}

/// One accepted relay connection.
pub struct Connection {
    /// Server-assigned ID.
    pub id: ConnectionId,
    role: Role,
    state: Mutex<ConnectionState>,
    /// Cleared when a probe is sent, set again on pong.
    alive: AtomicBool,
    rate: Mutex<SlidingWindowCounter>,
    tx: mpsc::Sender<Outbound>,
    terminate: CancellationToken,
    /// When the connection was accepted.
    pub connected_at: Instant,
    dropped: AtomicU64,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    pub fn new(
        id: ConnectionId,
        role: Role,
        tx: mpsc::Sender<Outbound>,
        rate: SlidingWindowCounter,
    ) -> Self {
        Self {
            id,
            role,
            state: Mutex::new(ConnectionState::Connecting),
            alive: AtomicBool::new(true),
            rate: Mutex::new(rate),
            tx,
            terminate: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped: AtomicU64::new(0),
        }
    }

    /// The namespace binding.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection is eligible for delivery.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Run `event` through the state machine and return the effects to apply.
    pub(crate) fn apply(&self, event: LifecycleEvent) -> Vec<Effect> {
        let mut state = self.state.lock();
        let transition = lifecycle::step(*state, event);
        *state = transition.next;
        transition.effects
    }

    /// Count one inbound message at `now`; `false` once over the limit.
    pub fn admit_message(&self, now: Instant) -> bool {
        self.rate.lock().hit(now)
    }

    /// Queue relayed text without waiting.
    ///
    /// Returns `false` if the queue is full or the writer is gone, and
    /// increments the dropped message counter.
    pub fn deliver(&self, text: Arc<str>) -> bool {
        self.enqueue(Outbound::Text(text))
    }

    /// Queue a heartbeat ping.
    pub fn probe(&self) -> bool {
        self.enqueue(Outbound::Probe)
    }

    /// Queue a close frame.
    pub(crate) fn send_close(&self, reason: CloseReason) -> bool {
        self.enqueue(Outbound::Close(reason))
    }

    fn enqueue(&self, frame: Outbound) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Drop the transport without a closing handshake.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once the connection is terminated.
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminate.cancelled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
