// MIT License - Copyright (c) 2026 Peter Wright
// Device state model

pub mod gas_valve;
pub mod light;
pub mod thermostat;
pub mod ventilator;

use serde::Serialize;

use crate::constants::VALUE_LEN;
use crate::error::{KocomError, Result};
use crate::packet::{Command, DeviceAddress, DeviceClass, Packet};

pub use gas_valve::{GasValveState, ValvePosition};
pub use light::{LightChannels, LightState};
pub use thermostat::{ThermostatMode, ThermostatState};
pub use ventilator::{FanSpeed, VentilatorState};

/// Semantic state of one device, tagged by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceState {
    Light(LightState),
    Thermostat(ThermostatState),
    GasValve(GasValveState),
    Ventilator(VentilatorState),
}

impl DeviceState {
    /// State assumed before the first report. `channels` only matters for lights.
    pub fn initial(class: DeviceClass, channels: u8) -> Option<Self> {
        let raw = initial_raw(class);
        match class {
            DeviceClass::Light => Some(Self::Light(LightState::new(channels))),
            DeviceClass::Thermostat => Some(Self::Thermostat(thermostat::decode(&raw))),
            DeviceClass::Ventilator => Some(Self::Ventilator(ventilator::decode(&raw))),
            DeviceClass::GasValve => Some(Self::GasValve(GasValveState {
                position: ValvePosition::Open,
            })),
            DeviceClass::Wallpad | DeviceClass::Other(_) => None,
        }
    }

    pub fn class(&self) -> DeviceClass {
        match self {
            Self::Light(_) => DeviceClass::Light,
            Self::Thermostat(_) => DeviceClass::Thermostat,
            Self::GasValve(_) => DeviceClass::GasValve,
            Self::Ventilator(_) => DeviceClass::Ventilator,
        }
    }

    /// Coarse on/off view: any light channel on, heating enabled, fan running,
    /// or valve open.
    pub fn is_on(&self) -> bool {
        match self {
            Self::Light(s) => s.any_on(),
            Self::Thermostat(s) => s.mode != ThermostatMode::Off,
            Self::GasValve(s) => !s.is_closed(),
            Self::Ventilator(s) => s.on,
        }
    }
}

/// Raw payload assumed before the first report.
pub fn initial_raw(class: DeviceClass) -> [u8; VALUE_LEN] {
    match class {
        DeviceClass::Ventilator => ventilator::default_raw(),
        _ => [0; VALUE_LEN],
    }
}

/// A desired-state change asked for by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    LightChannel { channel: u8, on: bool },
    LightAll { on: bool },
    ThermostatMode(ThermostatMode),
    ThermostatTarget(u8),
    FanPower(bool),
    FanSpeed(FanSpeed),
    Valve { open: bool },
}

/// Decode a report from a device into its semantic state.
///
/// Returns `Ok(None)` when the frame is well-formed but carries no state (a
/// query request, or a gas valve frame without a lock/unlock code), and
/// `ProtocolViolation` for command codes the device class never sends.
pub fn decode_report(packet: &Packet, channels: u8) -> Result<Option<DeviceState>> {
    let address = packet.src;
    match (address.class, packet.command) {
        (DeviceClass::GasValve, Command::Lock | Command::Unlock) => {
            Ok(gas_valve::decode(packet.command).map(DeviceState::GasValve))
        }
        (DeviceClass::GasValve, Command::State | Command::Query) => Ok(None),
        // a query request carries no state; its acknowledgement does
        (_, Command::Query) if !packet.is_ack() => Ok(None),
        (DeviceClass::Light, Command::State | Command::Query) => Ok(Some(DeviceState::Light(
            light::decode(&packet.value, channels),
        ))),
        (DeviceClass::Thermostat, Command::State | Command::Query) => Ok(Some(
            DeviceState::Thermostat(thermostat::decode(&packet.value)),
        )),
        (DeviceClass::Ventilator, Command::State | Command::Query) => Ok(Some(
            DeviceState::Ventilator(ventilator::decode(&packet.value)),
        )),
        (_, command) => Err(KocomError::ProtocolViolation {
            address,
            command,
            details: format!("unexpected command code {:#04X}", command.code()),
        }),
    }
}

/// Work out the state a request leads to and the packet that asks for it.
///
/// `raw` is the last payload reported by the device, echoed in bytes the
/// request does not touch. Rejected requests never produce a packet.
pub fn plan(
    address: DeviceAddress,
    current: &DeviceState,
    raw: &[u8; VALUE_LEN],
    request: DeviceRequest,
) -> Result<(DeviceState, Packet)> {
    let set = |value| Packet::request(address, Command::State, value);
    match (current, request) {
        (DeviceState::Light(s), DeviceRequest::LightChannel { channel, on }) => {
            let next = light::set_channel(address, s, channel, on)?;
            Ok((DeviceState::Light(next), set(light::encode(&next, raw))))
        }
        (DeviceState::Light(s), DeviceRequest::LightAll { on }) => {
            let next = light::set_all(s, on);
            Ok((DeviceState::Light(next), set(light::encode(&next, raw))))
        }
        (DeviceState::Thermostat(s), DeviceRequest::ThermostatMode(mode)) => {
            let next = thermostat::set_mode(s, mode);
            Ok((DeviceState::Thermostat(next), set(thermostat::encode(&next, raw))))
        }
        (DeviceState::Thermostat(s), DeviceRequest::ThermostatTarget(target)) => {
            let next = thermostat::set_target(address, s, target)?;
            Ok((DeviceState::Thermostat(next), set(thermostat::encode(&next, raw))))
        }
        (DeviceState::Ventilator(s), DeviceRequest::FanPower(on)) => {
            let next = ventilator::set_power(s, on);
            Ok((DeviceState::Ventilator(next), set(ventilator::encode(&next, raw))))
        }
        (DeviceState::Ventilator(_), DeviceRequest::FanSpeed(speed)) => {
            let next = ventilator::set_speed(speed);
            Ok((DeviceState::Ventilator(next), set(ventilator::encode(&next, raw))))
        }
        (DeviceState::GasValve(_), DeviceRequest::Valve { open }) => {
            let next = gas_valve::set_open(address, open)?;
            Ok((
                DeviceState::GasValve(next),
                Packet::request(address, Command::Lock, [0; VALUE_LEN]),
            ))
        }
        (state, request) => Err(KocomError::invalid_transition(
            address,
            format!("{:?} is not supported by a {}", request, state.class().name()),
        )),
    }
}
