// MIT License - Copyright (c) 2026 Peter Wright
// Session configuration

use std::collections::{BTreeMap, BTreeSet};

use crate::constants::{DEFAULT_EW11_PORT, MAX_LIGHT_CHANNELS, MAX_TRANSMISSIONS};
use crate::error::{KocomError, Result};
use crate::packet::{DeviceAddress, DeviceClass};
use crate::transport::Endpoint;

/// Which devices exist in the household.
///
/// Frames from devices that are not listed here are decoded but ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    /// Room index to number of wired light channels.
    pub lights: BTreeMap<u8, u8>,
    /// Rooms with a thermostat.
    pub thermostats: BTreeSet<u8>,
    pub ventilator: bool,
    pub gas_valve: bool,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_light(mut self, room: u8, channels: u8) -> Self {
        self.lights.insert(room, channels);
        self
    }

    pub fn with_thermostat(mut self, room: u8) -> Self {
        self.thermostats.insert(room);
        self
    }

    pub fn with_ventilator(mut self) -> Self {
        self.ventilator = true;
        self
    }

    pub fn with_gas_valve(mut self) -> Self {
        self.gas_valve = true;
        self
    }

    /// Parse the installer's light list, e.g. `"0:3,1:2,2:1"` (room:channels).
    pub fn parse_lights(s: &str) -> Result<BTreeMap<u8, u8>> {
        let mut lights = BTreeMap::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (room, channels) = item.split_once(':').ok_or_else(|| {
                KocomError::InvalidConfig(format!("light entry '{}' is not room:channels", item))
            })?;
            let room = parse_u8(room, "light room")?;
            let channels = parse_u8(channels, "light channel count")?;
            if lights.insert(room, channels).is_some() {
                return Err(KocomError::InvalidConfig(format!(
                    "light room {} listed twice",
                    room
                )));
            }
        }
        Ok(lights)
    }

    /// Parse the installer's thermostat list, e.g. `"0,1,2"`.
    pub fn parse_thermostats(s: &str) -> Result<BTreeSet<u8>> {
        let mut rooms = BTreeSet::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let room = parse_u8(item, "thermostat room")?;
            if !rooms.insert(room) {
                return Err(KocomError::InvalidConfig(format!(
                    "thermostat room {} listed twice",
                    room
                )));
            }
        }
        Ok(rooms)
    }

    /// Every configured address, lights first, in a stable order.
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        let mut out: Vec<DeviceAddress> =
            self.lights.keys().map(|&r| DeviceAddress::light(r)).collect();
        out.extend(self.thermostats.iter().map(|&r| DeviceAddress::thermostat(r)));
        if self.ventilator {
            out.push(DeviceAddress::ventilator());
        }
        if self.gas_valve {
            out.push(DeviceAddress::gas_valve());
        }
        out
    }

    pub fn contains(&self, address: DeviceAddress) -> bool {
        match address.class {
            DeviceClass::Light => self.lights.contains_key(&address.id),
            DeviceClass::Thermostat => self.thermostats.contains(&address.id),
            DeviceClass::Ventilator => self.ventilator && address.id == 0,
            DeviceClass::GasValve => self.gas_valve && address.id == 0,
            DeviceClass::Wallpad | DeviceClass::Other(_) => false,
        }
    }

    /// Number of light channels for a light address, 0 for anything else.
    pub fn channels(&self, address: DeviceAddress) -> u8 {
        match address.class {
            DeviceClass::Light => self.lights.get(&address.id).copied().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty() && self.thermostats.is_empty() && !self.ventilator && !self.gas_valve
    }

    fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(KocomError::InvalidConfig("no devices configured".into()));
        }
        for (&room, &channels) in &self.lights {
            if channels == 0 || channels > MAX_LIGHT_CHANNELS {
                return Err(KocomError::InvalidConfig(format!(
                    "light room {} has {} channels (must be 1..={})",
                    room, channels, MAX_LIGHT_CHANNELS
                )));
            }
        }
        Ok(())
    }
}

fn parse_u8(s: &str, what: &str) -> Result<u8> {
    s.trim()
        .parse()
        .map_err(|_| KocomError::InvalidConfig(format!("invalid {}: '{}'", what, s.trim())))
}

/// Configuration for one wallpad session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// EW11 the session reads from (and writes to, unless `write_endpoint` is set)
    pub endpoint: Endpoint,
    /// Second EW11 used only for sending, for split-bus installations
    pub write_endpoint: Option<Endpoint>,
    pub devices: DeviceMap,
    /// Thermostat polling interval in milliseconds (None = no polling)
    pub poll_interval_ms: Option<u64>,
    /// Gap between two thermostat queries of one polling round
    pub poll_spacing_ms: u64,
    /// How long to wait for an acknowledgement before retransmitting
    pub ack_timeout_ms: u64,
    /// Transmissions per command, first send included (1..=3)
    pub max_attempts: u8,
    /// Random extra delay before each retransmission, lower bound
    pub retry_jitter_min_ms: u64,
    /// Random extra delay before each retransmission, upper bound
    pub retry_jitter_max_ms: u64,
    /// Quiet time on the bus after each written frame
    pub send_gap_ms: u64,
    /// Reconnection delay in milliseconds (base delay for exponential backoff)
    pub reconnect_delay_ms: u64,
    /// Upper bound of the reconnection backoff
    pub max_reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Query every configured device after each (re)connection
    pub refresh_on_connect: bool,
    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("192.168.0.200", DEFAULT_EW11_PORT),
            write_endpoint: None,
            devices: DeviceMap::default(),
            poll_interval_ms: None,
            poll_spacing_ms: 500,
            ack_timeout_ms: 1000,
            max_attempts: MAX_TRANSMISSIONS,
            retry_jitter_min_ms: 50,
            retry_jitter_max_ms: 250,
            send_gap_ms: 250,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 60_000,
            connect_timeout_ms: 5000,
            refresh_on_connect: true,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.devices.validate()?;
        if self.endpoint.host.is_empty() {
            return Err(KocomError::InvalidConfig("EW11 host is empty".into()));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_TRANSMISSIONS {
            return Err(KocomError::InvalidConfig(format!(
                "max_attempts must be 1..={}, got {}",
                MAX_TRANSMISSIONS, self.max_attempts
            )));
        }
        if self.retry_jitter_min_ms > self.retry_jitter_max_ms {
            return Err(KocomError::InvalidConfig(
                "retry jitter lower bound exceeds upper bound".into(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(KocomError::InvalidConfig("ack_timeout_ms must be non-zero".into()));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(KocomError::InvalidConfig("reconnect_delay_ms must be non-zero".into()));
        }
        if self.reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(KocomError::InvalidConfig(
                "reconnect_delay_ms exceeds max_reconnect_delay_ms".into(),
            ));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(KocomError::InvalidConfig(
                "poll interval must be non-zero (omit it to disable polling)".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(KocomError::InvalidConfig("event_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.endpoint.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.endpoint.port = port;
        self
    }

    pub fn write_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.write_endpoint = Some(Endpoint::new(host, port));
        self
    }

    pub fn devices(mut self, devices: DeviceMap) -> Self {
        self.config.devices = devices;
        self
    }

    pub fn poll_interval_ms(mut self, ms: Option<u64>) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_spacing_ms(mut self, ms: u64) -> Self {
        self.config.poll_spacing_ms = ms;
        self
    }

    pub fn ack_timeout_ms(mut self, ms: u64) -> Self {
        self.config.ack_timeout_ms = ms;
        self
    }

    pub fn max_attempts(mut self, attempts: u8) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_jitter_ms(mut self, min: u64, max: u64) -> Self {
        self.config.retry_jitter_min_ms = min;
        self.config.retry_jitter_max_ms = max;
        self
    }

    pub fn send_gap_ms(mut self, ms: u64) -> Self {
        self.config.send_gap_ms = ms;
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    pub fn max_reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.max_reconnect_delay_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn refresh_on_connect(mut self, refresh: bool) -> Self {
        self.config.refresh_on_connect = refresh;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
