// MIT License - Copyright (c) 2026 Peter Wright
// Persistent EW11 link: reader, serialized writer, reconnect

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use super::{BoxStream, Connector, Endpoint};
use crate::codec::{self, Decoded};
use crate::config::SessionConfig;
use crate::constants::FRAME_LEN;
use crate::error::{FrameError, KocomError, Result};
use crate::packet::{Packet, hex_bytes};

const OUTBOUND_CAPACITY: usize = 64;
const READ_BUF_LEN: usize = 512;

/// Everything the link reports upward, in receipt order.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Packet(Packet),
    /// A frame was found but rejected; the reader has already resynchronized.
    Malformed(FrameError),
}

struct Outbound {
    frame: [u8; FRAME_LEN],
    done: oneshot::Sender<Result<()>>,
}

/// Cloneable sending side of a link.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<Outbound>,
    connected: watch::Receiver<bool>,
}

impl LinkHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolve once the link is (or already was) connected.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.connected.clone();
        rx.wait_for(|c| *c)
            .await
            .map_err(|_| KocomError::ChannelClosed)?;
        Ok(())
    }

    /// Queue one frame and wait until it has been written to the socket.
    ///
    /// Fails fast with `Disconnected` while the bridge is unreachable.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        if !self.is_connected() {
            return Err(KocomError::Disconnected);
        }
        let (done, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame: codec::encode(packet),
                done,
            })
            .await
            .map_err(|_| KocomError::Cancelled)?;
        rx.await.map_err(|_| KocomError::Cancelled)?
    }

    /// A handle whose frames land in the returned receiver instead of a socket.
    #[cfg(test)]
    pub(crate) fn loopback() -> (Self, mpsc::Receiver<([u8; FRAME_LEN], oneshot::Sender<Result<()>>)>, watch::Sender<bool>) {
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (conn_tx, conn_rx) = watch::channel(true);
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                if frames_tx.send((out.frame, out.done)).await.is_err() {
                    break;
                }
            }
        });
        (
            Self {
                outbound: out_tx,
                connected: conn_rx,
            },
            frames_rx,
            conn_tx,
        )
    }
}

/// Connection parameters taken from the session configuration.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub read: Endpoint,
    pub write: Option<Endpoint>,
    pub send_gap: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl From<&SessionConfig> for LinkSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            read: config.endpoint.clone(),
            write: config.write_endpoint.clone(),
            send_gap: Duration::from_millis(config.send_gap_ms),
            reconnect_base: Duration::from_millis(config.reconnect_delay_ms),
            reconnect_max: Duration::from_millis(config.max_reconnect_delay_ms),
        }
    }
}

/// Start the link supervisor. It connects, reconnects forever with backoff,
/// and stops once every `LinkHandle` is dropped or `events` is closed.
pub fn spawn(
    settings: LinkSettings,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<LinkEvent>,
) -> (LinkHandle, JoinHandle<()>) {
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (conn_tx, conn_rx) = watch::channel(false);
    let task = tokio::spawn(supervise(settings, connector, out_rx, conn_tx, events));
    (
        LinkHandle {
            outbound: out_tx,
            connected: conn_rx,
        },
        task,
    )
}

/// Exponential reconnect delay: `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(max)
}

/// Spread a delay by up to 25% either way, still capped at `max`.
fn jittered(delay: Duration, max: Duration) -> Duration {
    let ms = delay.as_millis() as f64;
    let jitter = rand::thread_rng().gen_range(-0.25..=0.25) * ms;
    Duration::from_millis((ms + jitter).max(0.0) as u64).min(max)
}

struct Streams {
    reader: ReadHalf<BoxStream>,
    writer: WriteHalf<BoxStream>,
    /// Read side of a dedicated write bridge, drained and discarded.
    extra: Option<ReadHalf<BoxStream>>,
}

enum End {
    Shutdown,
    Lost(String),
}

async fn open(settings: &LinkSettings, connector: &dyn Connector) -> Result<Streams> {
    let read = connector.connect(&settings.read).await?;
    match &settings.write {
        None => {
            let (reader, writer) = tokio::io::split(read);
            Ok(Streams {
                reader,
                writer,
                extra: None,
            })
        }
        Some(endpoint) => {
            let write = connector.connect(endpoint).await?;
            let (reader, _) = tokio::io::split(read);
            let (extra, writer) = tokio::io::split(write);
            Ok(Streams {
                reader,
                writer,
                extra: Some(extra),
            })
        }
    }
}

async fn supervise(
    settings: LinkSettings,
    connector: Arc<dyn Connector>,
    mut outbound: mpsc::Receiver<Outbound>,
    connected: watch::Sender<bool>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match open(&settings, connector.as_ref()).await {
            Ok(streams) => {
                attempt = 0;
                info!("Connected to EW11 at {}", settings.read);
                connected.send_replace(true);
                if events.send(LinkEvent::Connected).await.is_err() {
                    return;
                }

                let end = run(streams, &settings, &mut outbound, &events).await;
                connected.send_replace(false);
                match end {
                    End::Shutdown => {
                        debug!("Link to {} shut down", settings.read);
                        return;
                    }
                    End::Lost(reason) => {
                        warn!("Connection to EW11 at {} lost: {}", settings.read, reason);
                        if events.send(LinkEvent::Disconnected).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Connecting to EW11 at {} failed: {}", settings.read, e);
            }
        }

        attempt += 1;
        let delay = jittered(
            backoff_delay(settings.reconnect_base, settings.reconnect_max, attempt),
            settings.reconnect_max,
        );
        info!(
            "Reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            attempt
        );

        // writes queued while the bridge is down fail immediately
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                msg = outbound.recv() => match msg {
                    Some(out) => {
                        let _ = out.done.send(Err(KocomError::Disconnected));
                    }
                    None => return,
                },
            }
        }
    }
}

async fn run(
    mut streams: Streams,
    settings: &LinkSettings,
    outbound: &mut mpsc::Receiver<Outbound>,
    events: &mpsc::Sender<LinkEvent>,
) -> End {
    let mut buf = [0u8; READ_BUF_LEN];
    let mut extra_buf = [0u8; READ_BUF_LEN];
    let mut pending: Vec<u8> = Vec::with_capacity(FRAME_LEN * 4);
    let mut ready_at = Instant::now();

    loop {
        tokio::select! {
            read = streams.reader.read(&mut buf) => match read {
                Ok(0) => return End::Lost("closed by bridge".into()),
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    for decoded in codec::drain(&mut pending) {
                        let event = match decoded {
                            Decoded::Packet(packet) => LinkEvent::Packet(packet),
                            Decoded::Invalid(e) => {
                                warn!("Dropping malformed frame: {}", e);
                                LinkEvent::Malformed(e)
                            }
                            Decoded::Incomplete => continue,
                        };
                        if events.send(event).await.is_err() {
                            return End::Shutdown;
                        }
                    }
                }
                Err(e) => {
                    error!("EW11 read error: {}", e);
                    return End::Lost(e.to_string());
                }
            },
            read = read_or_park(&mut streams.extra, &mut extra_buf) => match read {
                Ok(0) => return End::Lost("write bridge closed".into()),
                Ok(n) => trace!("Discarding {} bytes from write bridge", n),
                Err(e) => {
                    error!("EW11 write bridge read error: {}", e);
                    return End::Lost(e.to_string());
                }
            },
            msg = next_outbound(outbound, ready_at) => match msg {
                None => return End::Shutdown,
                Some(out) => {
                    trace!("TX {}", hex_bytes(&out.frame));
                    let result = write_frame(&mut streams.writer, &out.frame).await;
                    ready_at = Instant::now() + settings.send_gap;
                    match result {
                        Ok(()) => {
                            let _ = out.done.send(Ok(()));
                        }
                        Err(e) => {
                            error!("EW11 write error: {}", e);
                            let reason = e.to_string();
                            let _ = out.done.send(Err(KocomError::Io(e)));
                            return End::Lost(reason);
                        }
                    }
                }
            },
        }
    }
}

/// Wait out the inter-frame gap, then take the next queued frame.
async fn next_outbound(outbound: &mut mpsc::Receiver<Outbound>, ready_at: Instant) -> Option<Outbound> {
    sleep_until(ready_at).await;
    outbound.recv().await
}

async fn read_or_park(
    reader: &mut Option<ReadHalf<BoxStream>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxStream>, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
