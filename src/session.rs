// MIT License - Copyright (c) 2026 Peter Wright
// Wallpad session: binds link, dispatcher, registry and poller

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::devices::{DeviceRequest, DeviceState, FanSpeed, ThermostatMode};
use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::error::{KocomError, Result};
use crate::event::{EventReceiver, EventSender, SessionEvent, event_channel};
use crate::packet::{DeviceAddress, DeviceClass, Packet};
use crate::registry::{DeviceRegistry, ListenerId};
use crate::scheduler::Poller;
use crate::transport::link::{self, LinkSettings};
use crate::transport::{Connector, LinkEvent, LinkHandle, TcpConnector};

const LINK_EVENT_CAPACITY: usize = 256;

/// One running connection to a Kocom wallpad bus.
///
/// The session keeps reconnecting on its own until it is shut down or
/// dropped. Host commands resolve with the device state after the device has
/// acknowledged them.
///
/// ```no_run
/// use std::time::Duration;
/// use kocom_wallpad::{DeviceAddress, DeviceMap, Session, SessionConfig};
///
/// # async fn demo() -> kocom_wallpad::Result<()> {
/// let config = SessionConfig::builder()
///     .host("192.168.0.200")
///     .devices(DeviceMap::new().with_light(0, 3).with_thermostat(0))
///     .build();
/// let session = Session::start(config)?;
/// session.wait_connected(Duration::from_secs(10)).await?;
/// session.turn_on(DeviceAddress::light(0)).await?;
/// session.set_target_temperature(DeviceAddress::thermostat(0), 22).await?;
/// session.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    config: SessionConfig,
    link: LinkHandle,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RwLock<DeviceRegistry>>,
    event_tx: EventSender,
    poller: Option<Poller>,
    link_handle: JoinHandle<()>,
    ingest_handle: JoinHandle<()>,
}

impl Session {
    /// Validate `config` and start talking to the bridge over TCP.
    ///
    /// Must be called from inside a Tokio runtime. Returns before the first
    /// connection is made; see [`Session::wait_connected`].
    pub fn start(config: SessionConfig) -> Result<Self> {
        let connector = TcpConnector::new(Duration::from_millis(config.connect_timeout_ms));
        Self::start_with_connector(config, Arc::new(connector))
    }

    /// Like [`Session::start`], opening bridge streams through `connector`.
    pub fn start_with_connector(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let (event_tx, _event_rx) = event_channel(config.event_capacity);
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let (link, link_handle) = link::spawn(LinkSettings::from(&config), connector, link_tx);

        let dispatcher = Arc::new(Dispatcher::new(link.clone(), RetryPolicy::from(&config)));
        let registry = Arc::new(RwLock::new(DeviceRegistry::new(&config.devices)));

        let ingest = Ingest {
            dispatcher: dispatcher.clone(),
            registry: registry.clone(),
            event_tx: event_tx.clone(),
            refresh_on_connect: config.refresh_on_connect,
        };
        let ingest_handle = tokio::spawn(ingest.run(link_rx));

        let poller = config.poll_interval_ms.map(|every| {
            let targets = config
                .devices
                .thermostats
                .iter()
                .map(|&room| DeviceAddress::thermostat(room))
                .collect();
            Poller::start(
                dispatcher.clone(),
                link.clone(),
                targets,
                Duration::from_millis(every),
                Duration::from_millis(config.poll_spacing_ms),
            )
        });

        info!(
            "Session started for EW11 at {} ({} devices)",
            config.endpoint,
            config.devices.addresses().len()
        );

        Ok(Self {
            config,
            link,
            dispatcher,
            registry,
            event_tx,
            poller,
            link_handle,
            ingest_handle,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Wait until the bridge is connected, at most `limit`.
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        timeout(limit, self.link.wait_connected())
            .await
            .map_err(|_| KocomError::ConnectionTimeout)?
    }

    // -----------------------------------------------------------------------
    // Host commands
    // -----------------------------------------------------------------------

    /// Switch a device on: every light channel, heating, or the fan.
    /// A gas valve cannot be opened remotely.
    pub async fn turn_on(&self, address: DeviceAddress) -> Result<DeviceState> {
        self.execute(address, power_request(address, true)?).await
    }

    /// Switch a device off. On the gas valve this closes it.
    pub async fn turn_off(&self, address: DeviceAddress) -> Result<DeviceState> {
        self.execute(address, power_request(address, false)?).await
    }

    pub async fn turn_on_channel(&self, address: DeviceAddress, channel: u8) -> Result<DeviceState> {
        self.execute(address, DeviceRequest::LightChannel { channel, on: true })
            .await
    }

    pub async fn turn_off_channel(&self, address: DeviceAddress, channel: u8) -> Result<DeviceState> {
        self.execute(address, DeviceRequest::LightChannel { channel, on: false })
            .await
    }

    /// Change a thermostat setpoint (whole degrees Celsius, 5..=40).
    pub async fn set_target_temperature(
        &self,
        address: DeviceAddress,
        celsius: u8,
    ) -> Result<DeviceState> {
        self.execute(address, DeviceRequest::ThermostatTarget(celsius))
            .await
    }

    pub async fn set_mode(&self, address: DeviceAddress, mode: ThermostatMode) -> Result<DeviceState> {
        self.execute(address, DeviceRequest::ThermostatMode(mode)).await
    }

    /// Select a fan speed, powering the fan on if needed.
    pub async fn set_fan_speed(&self, address: DeviceAddress, speed: FanSpeed) -> Result<DeviceState> {
        self.execute(address, DeviceRequest::FanSpeed(speed)).await
    }

    /// Close the gas valve. Succeeds without sending anything when the valve
    /// is already known to be closed.
    pub async fn close_valve(&self) -> Result<DeviceState> {
        self.execute(DeviceAddress::gas_valve(), DeviceRequest::Valve { open: false })
            .await
    }

    async fn execute(&self, address: DeviceAddress, request: DeviceRequest) -> Result<DeviceState> {
        let guard = self.dispatcher.lock_device(address).await;
        let planned = match self.registry.read().await.request_state(address, request) {
            Err(KocomError::NotSynchronized(_)) => None,
            other => Some(other?),
        };
        let planned = match planned {
            Some(planned) => planned,
            None => {
                debug!("{} has not reported yet, querying before {:?}", address, request);
                self.dispatcher
                    .submit_locked(&guard, Packet::query(address))
                    .await?;
                self.registry.read().await.request_state(address, request)?
            }
        };
        let Some((planned, packet)) = planned else {
            return self
                .current_state(address)
                .await?
                .ok_or(KocomError::UnknownDevice(address));
        };

        debug!("{}: {:?}", address, request);
        self.dispatcher.submit_locked(&guard, packet).await?;
        Ok(self.current_state(address).await?.unwrap_or(planned))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Ask one device for its state and wait for the answer.
    pub async fn refresh(&self, address: DeviceAddress) -> Result<Option<DeviceState>> {
        if !self.config.devices.contains(address) {
            return Err(KocomError::UnknownDevice(address));
        }
        self.dispatcher.submit(Packet::query(address)).await?;
        self.current_state(address).await
    }

    /// Query every configured device in turn. All devices are tried; the
    /// first failure is returned.
    pub async fn refresh_all(&self) -> Result<()> {
        let addresses = self.registry.read().await.addresses();
        refresh_addresses(&self.dispatcher, &addresses).await
    }

    /// Last known state of `address`, `None` until it has reported since the
    /// last (re)connection.
    pub async fn current_state(&self, address: DeviceAddress) -> Result<Option<DeviceState>> {
        self.registry.read().await.current_state(address)
    }

    /// Every configured device with its last known state.
    pub async fn devices(&self) -> Vec<(DeviceAddress, Option<DeviceState>)> {
        self.registry.read().await.snapshot()
    }

    /// Register a synchronous listener called on every state change.
    ///
    /// Listeners run on the session's receive path and must not block.
    pub async fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(DeviceAddress, &DeviceState) + Send + Sync + 'static,
    {
        self.registry.write().await.subscribe(Box::new(listener))
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.registry.write().await.unsubscribe(id)
    }

    /// Stop polling, fail every in-flight command with `Cancelled` and close
    /// the bridge connection.
    ///
    /// Callable through a shared reference, so a session held by command
    /// tasks can still be shut down; those commands resolve with `Cancelled`.
    pub async fn shutdown(&self) {
        info!("Shutting down session for {}", self.config.endpoint);
        if let Some(poller) = &self.poller {
            poller.stop();
        }
        self.dispatcher.close().await;
        self.ingest_handle.abort();
        self.link_handle.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.ingest_handle.abort();
        self.link_handle.abort();
    }
}

fn power_request(address: DeviceAddress, on: bool) -> Result<DeviceRequest> {
    Ok(match address.class {
        DeviceClass::Light => DeviceRequest::LightAll { on },
        DeviceClass::Thermostat => DeviceRequest::ThermostatMode(if on {
            ThermostatMode::Heat
        } else {
            ThermostatMode::Off
        }),
        DeviceClass::Ventilator => DeviceRequest::FanPower(on),
        DeviceClass::GasValve => DeviceRequest::Valve { open: on },
        DeviceClass::Wallpad | DeviceClass::Other(_) => {
            return Err(KocomError::UnknownDevice(address));
        }
    })
}

async fn refresh_addresses(dispatcher: &Dispatcher, addresses: &[DeviceAddress]) -> Result<()> {
    let mut first_error = None;
    for &address in addresses {
        if let Err(e) = dispatcher.submit(Packet::query(address)).await {
            warn!("Refreshing {} failed: {}", address, e);
            if matches!(e, KocomError::Cancelled) {
                return Err(e);
            }
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Receive path: applies frames in arrival order.
struct Ingest {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RwLock<DeviceRegistry>>,
    event_tx: EventSender,
    refresh_on_connect: bool,
}

impl Ingest {
    async fn run(self, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected => {
                    self.registry.write().await.rehydrate();
                    let _ = self.event_tx.send(SessionEvent::Connected);
                    if self.refresh_on_connect {
                        let dispatcher = self.dispatcher.clone();
                        let addresses = self.registry.read().await.addresses();
                        tokio::spawn(async move {
                            match refresh_addresses(&dispatcher, &addresses).await {
                                Ok(()) => info!("All {} devices refreshed", addresses.len()),
                                Err(e) => debug!("Refresh after connect incomplete: {}", e),
                            }
                        });
                    }
                }
                LinkEvent::Disconnected => {
                    self.dispatcher.fail_all(|| KocomError::Disconnected).await;
                    let _ = self.event_tx.send(SessionEvent::Disconnected);
                }
                LinkEvent::Packet(packet) => {
                    let applied = self.registry.write().await.apply_incoming(&packet);
                    match applied {
                        Ok(Some(state)) => {
                            let _ = self.event_tx.send(SessionEvent::StateChanged {
                                address: packet.src,
                                state,
                            });
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Ignoring frame {}: {}", packet, e),
                    }
                    self.dispatcher.on_received(&packet).await;
                }
                // logged by the link
                LinkEvent::Malformed(_) => {}
            }
        }
        debug!("Ingest task finished");
    }
}
