//! Hub-wide ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::HubRegistry;

/// Sweep every connection once per `interval` until `cancel` fires.
///
/// The first sweep runs one full interval after start. A connection that
/// has not answered the previous probe by the next sweep is evicted, so a
/// silent peer is gone within two intervals of its last pong.
pub async fn run_liveness_monitor(
    hub: Arc<HubRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = hub.sweep_liveness();
                if report.evicted > 0 {
                    info!(evicted = report.evicted, probed = report.probed, "liveness sweep");
                } else {
                    debug!(probed = report.probed, "liveness sweep");
                }
            }
            () = cancel.cancelled() => {
                debug!("liveness monitor stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{Outbound, Role};
    use relay_core::DeviceId;

    const INTERVAL: Duration = Duration::from_secs(15);

    fn spawn_monitor(hub: &Arc<HubRegistry>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_liveness_monitor(
            Arc::clone(hub),
            INTERVAL,
            cancel.clone(),
        ));
        (cancel, handle)
    }

    #[tokio::test]
    async fn monitor_cancelled() {
        let hub = Arc::new(HubRegistry::default());
        let (cancel, handle) = spawn_monitor(&hub);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_probe_before_first_interval() {
        let hub = Arc::new(HubRegistry::default());
        let (_conn, mut rx) = hub.admit(Role::Device(DeviceId::from("lamp")));
        let (cancel, handle) = spawn_monitor(&hub);

        time::sleep(INTERVAL - Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_evicted_after_two_ticks() {
        let hub = Arc::new(HubRegistry::default());
        let (conn, mut rx) = hub.admit(Role::Device(DeviceId::from("lamp")));
        let (cancel, handle) = spawn_monitor(&hub);

        time::sleep(INTERVAL + Duration::from_millis(10)).await;
        assert_eq!(rx.try_recv().unwrap(), Outbound::Probe);
        assert!(hub.contains(&conn.id));

        time::sleep(INTERVAL).await;
        assert!(!hub.contains(&conn.id));
        assert!(conn.is_terminated());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_connection_survives() {
        let hub = Arc::new(HubRegistry::default());
        let (conn, mut rx) = hub.admit(Role::Device(DeviceId::from("lamp")));
        let (cancel, handle) = spawn_monitor(&hub);

        time::sleep(Duration::from_millis(10)).await;
        for _ in 0..4 {
            time::sleep(INTERVAL).await;
            assert_eq!(rx.try_recv().unwrap(), Outbound::Probe);
            conn.mark_alive();
        }
        assert!(hub.contains(&conn.id));

        cancel.cancel();
        handle.await.unwrap();
    }
}
