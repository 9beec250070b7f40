// MIT License - Copyright (c) 2026 Peter Wright
// Command dispatch: acknowledgement matching and retransmission

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{KocomError, Result};
use crate::packet::{Command, DeviceAddress, DeviceClass, Packet};
use crate::transport::LinkHandle;

/// Proof that the caller holds the per-device command lock.
pub type DeviceGuard = OwnedMutexGuard<()>;

/// How long to wait for an acknowledgement and how often to retransmit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    /// Transmissions including the first one.
    pub max_attempts: u8,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl From<&SessionConfig> for RetryPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            max_attempts: config.max_attempts,
            jitter_min: Duration::from_millis(config.retry_jitter_min_ms),
            jitter_max: Duration::from_millis(config.retry_jitter_max_ms),
        }
    }
}

impl RetryPolicy {
    fn retry_pause(&self) -> Duration {
        let lo = self.jitter_min.as_millis() as u64;
        let hi = self.jitter_max.as_millis() as u64;
        if hi <= lo {
            return self.jitter_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

struct PendingCommand {
    id: u64,
    dst: DeviceAddress,
    command: Command,
    responder: oneshot::Sender<Result<Packet>>,
}

/// Sends requests and routes acknowledgements back to the waiting caller.
///
/// Outstanding requests are matched oldest first on (device, command). A
/// per-device lock keeps at most one command in flight for any device.
pub struct Dispatcher {
    link: LinkHandle,
    policy: RetryPolicy,
    pending: Mutex<VecDeque<PendingCommand>>,
    device_locks: Mutex<HashMap<DeviceAddress, Arc<Mutex<()>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(link: LinkHandle, policy: RetryPolicy) -> Self {
        Self {
            link,
            policy,
            pending: Mutex::new(VecDeque::new()),
            device_locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn device_lock(&self, address: DeviceAddress) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().await;
        locks
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive use of `address`.
    pub async fn lock_device(&self, address: DeviceAddress) -> DeviceGuard {
        self.device_lock(address).await.lock_owned().await
    }

    /// Take the device lock only if nobody else holds it.
    pub async fn try_lock_device(&self, address: DeviceAddress) -> Option<DeviceGuard> {
        self.device_lock(address).await.try_lock_owned().ok()
    }

    /// Write `packet` once, without waiting for an acknowledgement.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(KocomError::Cancelled);
        }
        self.link.send(packet).await
    }

    /// Lock the destination and send `packet` until it is acknowledged.
    pub async fn submit(&self, packet: Packet) -> Result<Packet> {
        let guard = self.lock_device(packet.dst).await;
        self.submit_locked(&guard, packet).await
    }

    /// Like [`Dispatcher::submit`], but gives up with `None` when the device
    /// is busy with another command.
    pub async fn try_submit(&self, packet: Packet) -> Option<Result<Packet>> {
        let guard = self.try_lock_device(packet.dst).await?;
        Some(self.submit_locked(&guard, packet).await)
    }

    /// Send `packet` up to `max_attempts` times and return the acknowledgement.
    ///
    /// The caller must already hold the lock of `packet.dst`.
    pub async fn submit_locked(&self, _guard: &DeviceGuard, packet: Packet) -> Result<Packet> {
        let attempts = self.policy.max_attempts;
        for attempt in 0..attempts {
            if self.closed.load(Ordering::Acquire) {
                return Err(KocomError::Cancelled);
            }
            if attempt > 0 {
                sleep(self.policy.retry_pause()).await;
            }

            let frame = packet.clone().with_attempt(attempt);
            let (id, mut rx) = self.register(&frame).await;
            if let Err(e) = self.link.send(&frame).await {
                self.forget(id).await;
                return Err(e);
            }
            debug!(
                "Sent {} to {} (attempt {}/{})",
                frame.command,
                frame.dst,
                attempt + 1,
                attempts
            );

            match timeout(self.policy.ack_timeout, &mut rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(KocomError::Cancelled),
                Err(_) => {
                    self.forget(id).await;
                    // the ack may have landed between the timeout and the removal
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                    warn!(
                        "No acknowledgement from {} for {} (attempt {}/{})",
                        frame.dst,
                        frame.command,
                        attempt + 1,
                        attempts
                    );
                }
            }
        }
        Err(KocomError::CommandTimeout {
            address: packet.dst,
            command: packet.command,
            attempts,
        })
    }

    async fn register(&self, packet: &Packet) -> (u64, oneshot::Receiver<Result<Packet>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, rx) = oneshot::channel();
        self.pending.lock().await.push_back(PendingCommand {
            id,
            dst: packet.dst,
            command: packet.command,
            responder,
        });
        (id, rx)
    }

    async fn forget(&self, id: u64) {
        self.pending.lock().await.retain(|p| p.id != id);
    }

    /// Offer a received frame to the outstanding requests.
    ///
    /// Returns true if it acknowledged one of them.
    pub async fn on_received(&self, packet: &Packet) -> bool {
        if !packet.is_ack() || packet.dst.class != DeviceClass::Wallpad {
            return false;
        }
        let mut pending = self.pending.lock().await;
        let Some(pos) = pending
            .iter()
            .position(|p| p.dst == packet.src && p.command == packet.command)
        else {
            return false;
        };
        if let Some(entry) = pending.remove(pos) {
            debug!("Acknowledged {} by {}", entry.command, entry.dst);
            let _ = entry.responder.send(Ok(packet.clone()));
        }
        true
    }

    /// Fail every outstanding request with a fresh error from `make`.
    pub async fn fail_all(&self, make: impl Fn() -> KocomError) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!("Failing {} pending commands", pending.len());
        }
        for entry in pending.drain(..) {
            let _ = entry.responder.send(Err(make()));
        }
    }

    /// Refuse new work and cancel everything in flight.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.fail_all(|| KocomError::Cancelled).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
