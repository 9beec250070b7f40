// MIT License - Copyright (c) 2026 Peter Wright
// Device registry: last known state of every configured device

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, info, warn};

use crate::config::DeviceMap;
use crate::constants::VALUE_LEN;
use crate::devices::{self, DeviceRequest, DeviceState};
use crate::error::{KocomError, Result};
use crate::packet::{DeviceAddress, DeviceClass, Packet};

pub type ListenerId = u64;

type Listener = Box<dyn Fn(DeviceAddress, &DeviceState) + Send + Sync>;

struct DeviceEntry {
    /// None until the device has reported since the last (re)connection.
    state: Option<DeviceState>,
    /// Last payload the device reported, echoed into outgoing requests.
    raw: [u8; VALUE_LEN],
    channels: u8,
}

impl DeviceEntry {
    fn new(class: DeviceClass, channels: u8) -> Self {
        Self {
            state: None,
            raw: devices::initial_raw(class),
            channels,
        }
    }
}

pub struct DeviceRegistry {
    devices: BTreeMap<DeviceAddress, DeviceEntry>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
}

impl DeviceRegistry {
    pub fn new(map: &DeviceMap) -> Self {
        let devices = map
            .addresses()
            .into_iter()
            .map(|addr| (addr, DeviceEntry::new(addr.class, map.channels(addr))))
            .collect();
        Self {
            devices,
            listeners: Vec::new(),
            next_listener: 1,
        }
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.devices.keys().copied().collect()
    }

    /// Fold a frame received from the bus into the registry.
    ///
    /// Returns the new state when the frame changed it. Frames sent by the
    /// wallpad and frames from devices that are not configured are ignored.
    pub fn apply_incoming(&mut self, packet: &Packet) -> Result<Option<DeviceState>> {
        if packet.from_wallpad() {
            return Ok(None);
        }
        let address = packet.src;
        let Some(entry) = self.devices.get_mut(&address) else {
            debug!("Ignoring frame from unconfigured device {}", address);
            return Ok(None);
        };
        let Some(state) = devices::decode_report(packet, entry.channels)? else {
            return Ok(None);
        };

        if address.class != DeviceClass::GasValve {
            entry.raw = packet.value;
        }
        if entry.state == Some(state) {
            return Ok(None);
        }
        match entry.state {
            Some(_) => info!("{} changed: {:?}", address, state),
            None => info!("{} synchronized: {:?}", address, state),
        }
        entry.state = Some(state);
        self.notify(address, &state);
        Ok(Some(state))
    }

    fn notify(&self, address: DeviceAddress, state: &DeviceState) {
        for (id, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(address, state))).is_err() {
                warn!("State listener {} panicked on {}", id, address);
            }
        }
    }

    /// Plan the packet for a host request against the last known state.
    ///
    /// `Ok(None)` means the device is already where the request wants it and
    /// nothing needs to be sent.
    pub fn request_state(
        &self,
        address: DeviceAddress,
        request: DeviceRequest,
    ) -> Result<Option<(DeviceState, Packet)>> {
        let entry = self
            .devices
            .get(&address)
            .ok_or(KocomError::UnknownDevice(address))?;

        if let (Some(DeviceState::GasValve(s)), DeviceRequest::Valve { open: false }) =
            (entry.state, request)
        {
            if s.is_closed() {
                debug!("{} already closed", address);
                return Ok(None);
            }
        }

        let current = match entry.state {
            Some(state) => state,
            None if needs_sync(&request) => {
                return Err(KocomError::NotSynchronized(address));
            }
            None => DeviceState::initial(address.class, entry.channels)
                .ok_or(KocomError::UnknownDevice(address))?,
        };
        devices::plan(address, &current, &entry.raw, request).map(Some)
    }

    /// Last known state, `Ok(None)` while the device has not reported yet.
    pub fn current_state(&self, address: DeviceAddress) -> Result<Option<DeviceState>> {
        self.devices
            .get(&address)
            .map(|e| e.state)
            .ok_or(KocomError::UnknownDevice(address))
    }

    pub fn snapshot(&self) -> Vec<(DeviceAddress, Option<DeviceState>)> {
        self.devices.iter().map(|(a, e)| (*a, e.state)).collect()
    }

    pub fn subscribe(&mut self, listener: Listener) -> ListenerId {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    /// Forget every state so devices resynchronize after a reconnection.
    /// Listeners are not told.
    pub fn rehydrate(&mut self) {
        for (address, entry) in self.devices.iter_mut() {
            entry.state = None;
            entry.raw = devices::initial_raw(address.class);
        }
    }
}

/// Requests that change one field of a payload carrying others, and so must
/// be built on top of a reported state.
fn needs_sync(request: &DeviceRequest) -> bool {
    matches!(
        request,
        DeviceRequest::LightChannel { .. }
            | DeviceRequest::ThermostatMode(_)
            | DeviceRequest::ThermostatTarget(_)
    )
}
