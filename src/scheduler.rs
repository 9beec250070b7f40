// MIT License - Copyright (c) 2026 Peter Wright
// Periodic status polling

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::packet::{DeviceAddress, Packet};
use crate::transport::LinkHandle;

/// Queries a fixed set of devices on an interval.
///
/// Thermostats do not report temperature changes on their own, so they are
/// the usual targets. A device that is busy with a host command is skipped
/// for the round.
pub struct Poller {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Poller {
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        link: LinkHandle,
        targets: Vec<DeviceAddress>,
        every: Duration,
        spacing: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Poller stopped");
                            return;
                        }
                        continue;
                    }
                }
                if !link.is_connected() {
                    debug!("Skipping poll round, bridge disconnected");
                    continue;
                }
                tokio::select! {
                    _ = poll_round(&dispatcher, &targets, spacing) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("Poller stopped mid-round");
                        return;
                    }
                }
            }
        });
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_round(dispatcher: &Dispatcher, targets: &[DeviceAddress], spacing: Duration) {
    for (i, &address) in targets.iter().enumerate() {
        if i > 0 {
            sleep(spacing).await;
        }
        match dispatcher.try_submit(Packet::query(address)).await {
            None => debug!("{} busy, not polled this round", address),
            Some(Ok(_)) => debug!("Polled {}", address),
            Some(Err(e)) => warn!("Polling {} failed: {}", address, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Decoded};
    use crate::dispatcher::RetryPolicy;
    use tokio::time::timeout;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            ack_timeout: Duration::from_millis(200),
            max_attempts: 1,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_polls_each_target_and_skips_busy() {
        let (link, mut frames, _conn) = LinkHandle::loopback();
        let dispatcher = Arc::new(Dispatcher::new(link.clone(), policy()));
        let busy = dispatcher.lock_device(DeviceAddress::thermostat(1)).await;

        let poller = Poller::start(
            dispatcher.clone(),
            link,
            vec![DeviceAddress::thermostat(0), DeviceAddress::thermostat(1)],
            Duration::from_millis(50),
            Duration::from_millis(5),
        );

        let (frame, done) = timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        let _ = done.send(Ok(()));
        let Decoded::Packet(query) = codec::decode(&frame).0 else {
            panic!("bad frame");
        };
        assert_eq!(query.dst, DeviceAddress::thermostat(0));
        dispatcher
            .on_received(&Packet::ack_for(&query, [0x11, 0, 22, 0, 20, 0, 0, 0]))
            .await;

        // thermostat 1 is locked, so the next frame is thermostat 0 again
        let (frame, done) = timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        let _ = done.send(Ok(()));
        let Decoded::Packet(query) = codec::decode(&frame).0 else {
            panic!("bad frame");
        };
        assert_eq!(query.dst, DeviceAddress::thermostat(0));

        poller.stop();
        drop(busy);
    }

    #[tokio::test]
    async fn test_no_polling_while_disconnected() {
        let (link, mut frames, conn) = LinkHandle::loopback();
        conn.send_replace(false);
        let dispatcher = Arc::new(Dispatcher::new(link.clone(), policy()));
        let _poller = Poller::start(
            dispatcher,
            link,
            vec![DeviceAddress::thermostat(0)],
            Duration::from_millis(10),
            Duration::ZERO,
        );
        assert!(timeout(Duration::from_millis(100), frames.recv()).await.is_err());
    }
}
