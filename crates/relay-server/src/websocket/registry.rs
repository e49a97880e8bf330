//! Connection table and identifier buckets.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{ConnectionId, DeviceId, ProductId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{Connection, Outbound, Role};
use super::lifecycle::{CloseReason, Effect, LifecycleEvent};
use super::rate_limit::SlidingWindowCounter;
use super::router::{Envelope, Target};
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_DELIVERY_DROPS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_LIVENESS_EVICTIONS_TOTAL,
};

/// Per-connection limits applied at admission.
#[derive(Clone, Copy, Debug)]
pub struct HubLimits {
    /// Outbound frames buffered per connection.
    pub outbound_queue: usize,
    /// Inbound messages allowed per window.
    pub rate_limit_max: u32,
    /// Rate limit window.
    pub rate_limit_window: Duration,
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            rate_limit_max: 25,
            rate_limit_window: Duration::from_millis(1000),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    devices: HashMap<DeviceId, HashSet<ConnectionId>>,
    products: HashMap<ProductId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn insert(&mut self, conn: &Arc<Connection>) {
        let _ = self.connections.insert(conn.id.clone(), Arc::clone(conn));
        let _ = match conn.role() {
            Role::Device(id) => bucket_insert(&mut self.devices, id, &conn.id),
            Role::Product(id) => bucket_insert(&mut self.products, id, &conn.id),
        };
    }

    fn remove(&mut self, conn: &Connection) -> bool {
        let in_table = self.connections.remove(&conn.id).is_some();
        let in_bucket = match conn.role() {
            Role::Device(id) => bucket_remove(&mut self.devices, id, &conn.id),
            Role::Product(id) => bucket_remove(&mut self.products, id, &conn.id),
        };
        in_table || in_bucket
    }

    fn members(&self, target: &Target) -> Option<&HashSet<ConnectionId>> {
        match target {
            Target::Device(id) => self.devices.get(id),
            Target::Product(id) => self.products.get(id),
        }
    }
}

/// Add `conn` to the bucket for `key`, creating it on first use.
///
/// Returns `false` if the id was already a member.
fn bucket_insert<K>(
    buckets: &mut HashMap<K, HashSet<ConnectionId>>,
    key: &K,
    conn: &ConnectionId,
) -> bool
where
    K: Eq + Hash + Clone,
{
    buckets.entry(key.clone()).or_default().insert(conn.clone())
}

/// Remove `conn` from the bucket for `key`, dropping the bucket once empty.
///
/// Returns `true` if the id was a member.
fn bucket_remove<K>(
    buckets: &mut HashMap<K, HashSet<ConnectionId>>,
    key: &K,
    conn: &ConnectionId,
) -> bool
where
    K: Eq + Hash,
{
    let Some(bucket) = buckets.get_mut(key) else {
        return false;
    };
    let removed = bucket.remove(conn);
    if bucket.is_empty() {
        let _ = buckets.remove(key);
    }
    removed
}

/// Outcome of one liveness sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections sent a probe.
    pub probed: usize,
    /// Connections terminated for missing the previous probe.
    pub evicted: usize,
}

/// Owns every live connection and the identifier buckets that address them.
///
/// All mutation happens under one lock. Connection state locks are only ever
/// taken while this lock is held, never the other way round.
pub struct HubRegistry {
    inner: Mutex<RegistryInner>,
    limits: HubLimits,
}

impl HubRegistry {
    /// Create an empty registry.
    pub fn new(limits: HubLimits) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            limits,
        }
    }

    /// Limits applied to new connections.
    pub fn limits(&self) -> HubLimits {
        self.limits
    }

    /// Create a connection for `role`, register it and return it together
    /// with the receiving end of its outbound queue.
    pub fn admit(&self, role: Role) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.limits.outbound_queue);
        let rate = SlidingWindowCounter::new(
            self.limits.rate_limit_max,
            self.limits.rate_limit_window,
            Instant::now(),
        );
        let conn = Arc::new(Connection::new(ConnectionId::new(), role, tx, rate));
        let _ = self.dispatch(&conn, LifecycleEvent::Admitted);
        (conn, rx)
    }

    /// Feed `event` to `conn`'s state machine and carry out the resulting
    /// effects. Returns the effects that were applied.
    pub fn dispatch(&self, conn: &Arc<Connection>, event: LifecycleEvent) -> Vec<Effect> {
        let mut inner = self.inner.lock();
        let effects = conn.apply(event);
        for effect in &effects {
            match *effect {
                Effect::Register => {
                    inner.insert(conn);
                    debug!(conn_id = %conn.id, role = %conn.role(), "connection registered");
                }
                Effect::SendClose(reason) => {
                    if !conn.send_close(reason) {
                        // Writer can't take the close frame; drop the transport instead.
                        conn.terminate();
                    }
                }
                Effect::Terminate => conn.terminate(),
                Effect::Release => {
                    if inner.remove(conn) {
                        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
                        debug!(conn_id = %conn.id, role = %conn.role(), "connection released");
                    }
                }
            }
        }
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_CONNECTIONS_ACTIVE).set(inner.connections.len() as f64);
        effects
    }

    /// Release `conn` after its transport closed. Safe to call repeatedly.
    pub fn teardown(&self, conn: &Arc<Connection>) {
        let _ = self.dispatch(conn, LifecycleEvent::TransportClosed);
    }

    /// Queue `envelope` for every open connection in the addressed bucket.
    ///
    /// Returns how many connections accepted the message. Zero recipients is
    /// not an error.
    pub fn route(&self, envelope: &Envelope) -> usize {
        let json: Arc<str> = match envelope.to_json() {
            Ok(json) => Arc::from(json),
            Err(error) => {
                warn!(%error, "failed to serialize relayed message");
                return 0;
            }
        };

        let inner = self.inner.lock();
        let Some(members) = inner.members(&envelope.target) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            let Some(conn) = inner.connections.get(id) else {
                continue;
            };
            if !conn.is_open() {
                continue;
            }
            if conn.deliver(Arc::clone(&json)) {
                delivered += 1;
            } else {
                counter!(WS_DELIVERY_DROPS_TOTAL).increment(1);
                warn!(conn_id = %conn.id, "outbound queue full, dropping message");
            }
        }
        delivered
    }

    /// One liveness tick: evict connections that never answered the last
    /// probe, probe the rest.
    pub fn sweep_liveness(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.snapshot() {
            if conn.check_alive() {
                let _ = conn.probe();
                report.probed += 1;
            } else {
                let effects = self.dispatch(&conn, LifecycleEvent::Evicted);
                if effects.contains(&Effect::Release) {
                    counter!(WS_LIVENESS_EVICTIONS_TOTAL).increment(1);
                    info!(conn_id = %conn.id, role = %conn.role(), "evicting unresponsive connection");
                    report.evicted += 1;
                }
            }
        }
        report
    }

    /// Close every connection for server shutdown.
    ///
    /// Sends a close frame to each, waits up to `grace` for the peers to
    /// finish the handshake, then drops whatever is left.
    pub async fn drain(&self, grace: Duration) {
        let conns = self.snapshot();
        if conns.is_empty() {
            return;
        }
        info!(connections = conns.len(), "draining connections");
        for conn in &conns {
            let _ = self.dispatch(
                conn,
                LifecycleEvent::CloseRequested(CloseReason::ShuttingDown),
            );
        }

        let deadline = Instant::now() + grace;
        while self.connection_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        for conn in self.snapshot() {
            let _ = self.dispatch(&conn, LifecycleEvent::Evicted);
        }
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.values().cloned().collect()
    }

    /// Look up a registered connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(id).cloned()
    }

    /// Whether `id` is in the connection table.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(id)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Number of device identifiers with at least one connection.
    pub fn device_count(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// Number of product identifiers with at least one connection.
    pub fn product_count(&self) -> usize {
        self.inner.lock().products.len()
    }

    /// Connection ids registered under a device identifier.
    pub fn device_members(&self, id: &DeviceId) -> Option<HashSet<ConnectionId>> {
        self.inner.lock().devices.get(id).cloned()
    }

    /// Connection ids registered under a product identifier.
    pub fn product_members(&self, id: &ProductId) -> Option<HashSet<ConnectionId>> {
        self.inner.lock().products.get(id).cloned()
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new(HubLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::lifecycle::ConnectionState;
    use crate::websocket::router::parse_envelope;

    fn device(id: &str) -> Role {
        Role::Device(DeviceId::from(id))
    }

    fn product(id: &str) -> Role {
        Role::Product(ProductId::from(id))
    }

    #[test]
    fn admit_registers_in_table_and_bucket() {
        let hub = HubRegistry::default();
        let (conn, _rx) = hub.admit(device("lamp"));
        assert!(conn.is_open());
        assert!(hub.contains(&conn.id));
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.device_count(), 1);
        assert_eq!(hub.product_count(), 0);
        let members = hub.device_members(&DeviceId::from("lamp")).unwrap();
        assert!(members.contains(&conn.id));
    }

    #[test]
    fn namespaces_are_disjoint() {
        let hub = HubRegistry::default();
        let (_d, _rx1) = hub.admit(device("same"));
        let (_p, _rx2) = hub.admit(product("same"));
        assert_eq!(hub.device_members(&DeviceId::from("same")).unwrap().len(), 1);
        assert_eq!(hub.product_members(&ProductId::from("same")).unwrap().len(), 1);
    }

    #[test]
    fn teardown_removes_empty_bucket() {
        let hub = HubRegistry::default();
        let (conn, _rx) = hub.admit(device("lamp"));
        hub.teardown(&conn);
        assert!(!hub.contains(&conn.id));
        assert!(hub.device_members(&DeviceId::from("lamp")).is_none());
        assert_eq!(hub.device_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn teardown_keeps_other_members() {
        let hub = HubRegistry::default();
        let (a, _rx1) = hub.admit(product("kiosk"));
        let (b, _rx2) = hub.admit(product("kiosk"));
        hub.teardown(&a);
        let members = hub.product_members(&ProductId::from("kiosk")).unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains(&b.id));
    }

    #[test]
    fn teardown_twice_is_noop() {
        let hub = HubRegistry::default();
        let (a, _rx1) = hub.admit(device("lamp"));
        let (b, _rx2) = hub.admit(device("lamp"));
        hub.teardown(&a);
        hub.teardown(&a);
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.device_members(&DeviceId::from("lamp")).unwrap().contains(&b.id));
        assert!(hub.dispatch(&a, LifecycleEvent::TransportClosed).is_empty());
    }

    #[test]
    fn bucket_remove_reports_membership() {
        let mut buckets: HashMap<DeviceId, HashSet<ConnectionId>> = HashMap::new();
        let key = DeviceId::from("lamp");
        let id = ConnectionId::from("c1");
        assert!(bucket_insert(&mut buckets, &key, &id));
        assert!(!bucket_insert(&mut buckets, &key, &id));
        assert!(bucket_remove(&mut buckets, &key, &id));
        assert!(buckets.is_empty());
        assert!(!bucket_remove(&mut buckets, &key, &id));
    }

    #[tokio::test]
    async fn route_fans_out_identical_json() {
        let hub = HubRegistry::default();
        let (_a, mut rx_a) = hub.admit(device("lamp"));
        let (_b, mut rx_b) = hub.admit(device("lamp"));
        let (_c, mut rx_c) = hub.admit(device("fan"));
        let (_p, mut rx_p) = hub.admit(product("lamp"));

        let text = r#"{"target":"device","deviceId":"lamp","level":3}"#;
        let env = parse_envelope(text).unwrap();
        assert_eq!(hub.route(&env), 2);

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a, Outbound::Text(Arc::from(text)));
        assert_eq!(a, b);
        assert!(rx_c.try_recv().is_err());
        assert!(rx_p.try_recv().is_err());
    }

    #[test]
    fn route_to_unknown_identifier_is_silent() {
        let hub = HubRegistry::default();
        let env = parse_envelope(r#"{"target":"product","productId":"ghost"}"#).unwrap();
        assert_eq!(hub.route(&env), 0);
    }

    #[test]
    fn route_skips_closing_connections() {
        let hub = HubRegistry::default();
        let (a, mut rx_a) = hub.admit(device("lamp"));
        let _ = hub.dispatch(
            &a,
            LifecycleEvent::CloseRequested(CloseReason::RateLimitExceeded),
        );
        let _ = rx_a.try_recv();
        let env = parse_envelope(r#"{"target":"device","deviceId":"lamp"}"#).unwrap();
        assert_eq!(hub.route(&env), 0);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_delivery() {
        let hub = HubRegistry::new(HubLimits {
            outbound_queue: 1,
            ..HubLimits::default()
        });
        let (conn, _rx) = hub.admit(device("lamp"));
        let env = parse_envelope(r#"{"target":"device","deviceId":"lamp"}"#).unwrap();
        assert_eq!(hub.route(&env), 1);
        assert_eq!(hub.route(&env), 0);
        assert_eq!(conn.drop_count(), 1);
        assert!(conn.is_open());
    }

    #[test]
    fn close_request_sends_one_close_frame() {
        let hub = HubRegistry::default();
        let (conn, mut rx) = hub.admit(device("lamp"));
        let reason = LifecycleEvent::CloseRequested(CloseReason::RateLimitExceeded);
        let _ = hub.dispatch(&conn, reason);
        let _ = hub.dispatch(&conn, reason);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(CloseReason::RateLimitExceeded)
        );
        assert!(rx.try_recv().is_err());
        // Still registered until the transport goes away.
        assert!(hub.contains(&conn.id));
    }

    #[test]
    fn sweep_probes_then_evicts() {
        let hub = HubRegistry::default();
        let (conn, mut rx) = hub.admit(device("lamp"));

        let first = hub.sweep_liveness();
        assert_eq!(first, SweepReport { probed: 1, evicted: 0 });
        assert_eq!(rx.try_recv().unwrap(), Outbound::Probe);

        let second = hub.sweep_liveness();
        assert_eq!(second, SweepReport { probed: 0, evicted: 1 });
        assert!(conn.is_terminated());
        assert!(!hub.contains(&conn.id));
        assert_eq!(hub.device_count(), 0);
    }

    #[test]
    fn pong_between_sweeps_keeps_connection() {
        let hub = HubRegistry::default();
        let (conn, _rx) = hub.admit(device("lamp"));
        for _ in 0..5 {
            let report = hub.sweep_liveness();
            assert_eq!(report.evicted, 0);
            conn.mark_alive();
        }
        assert!(hub.contains(&conn.id));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_closes_then_evicts() {
        let hub = HubRegistry::default();
        let (a, mut rx_a) = hub.admit(device("lamp"));
        let (b, _rx_b) = hub.admit(product("kiosk"));

        hub.drain(Duration::from_millis(100)).await;

        assert_eq!(
            rx_a.try_recv().unwrap(),
            Outbound::Close(CloseReason::ShuttingDown)
        );
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.device_count(), 0);
        assert_eq!(hub.product_count(), 0);
        assert!(a.is_terminated());
        assert!(b.is_terminated());
    }
}
