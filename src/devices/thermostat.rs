// MIT License - Copyright (c) 2026 Peter Wright
// Thermostat payload rules

use serde::Serialize;

use crate::constants::{
    THERMO_AWAY, THERMO_HEATING_OFF, THERMO_HEATING_ON, THERMO_PRESENT, THERMO_TARGET_MAX,
    THERMO_TARGET_MIN, VALUE_LEN,
};
use crate::error::{KocomError, Result};
use crate::packet::DeviceAddress;

/// Heating mode of one room thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatMode {
    Off,
    Heat,
    /// Heating on at the reduced away setpoint.
    Away,
}

impl ThermostatMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "heat" => Some(Self::Heat),
            "away" => Some(Self::Away),
            _ => None,
        }
    }

    /// Payload bytes 0 and 1 for this mode.
    fn bytes(self) -> [u8; 2] {
        match self {
            Self::Off => [THERMO_HEATING_OFF, THERMO_PRESENT],
            Self::Heat => [THERMO_HEATING_ON, THERMO_PRESENT],
            Self::Away => [THERMO_HEATING_ON, THERMO_AWAY],
        }
    }
}

/// Temperatures are whole degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThermostatState {
    pub mode: ThermostatMode,
    pub target: u8,
    pub current: u8,
}

pub fn decode(value: &[u8; VALUE_LEN]) -> ThermostatState {
    let heating = value[0] == THERMO_HEATING_ON;
    let away = value[1] == THERMO_AWAY;
    let mode = match (heating, away) {
        (false, _) => ThermostatMode::Off,
        (true, true) => ThermostatMode::Away,
        (true, false) => ThermostatMode::Heat,
    };
    ThermostatState {
        mode,
        target: value[2],
        current: value[4],
    }
}

/// Build a set payload. Only mode and target are written; the current
/// temperature and the unused bytes are echoed from the last raw report.
pub fn encode(state: &ThermostatState, raw: &[u8; VALUE_LEN]) -> [u8; VALUE_LEN] {
    let mut value = *raw;
    value[..2].copy_from_slice(&state.mode.bytes());
    value[2] = state.target;
    value
}

pub fn set_mode(current: &ThermostatState, mode: ThermostatMode) -> ThermostatState {
    ThermostatState { mode, ..*current }
}

/// Change the setpoint, leaving the mode alone.
pub fn set_target(
    address: DeviceAddress,
    current: &ThermostatState,
    target: u8,
) -> Result<ThermostatState> {
    if !(THERMO_TARGET_MIN..=THERMO_TARGET_MAX).contains(&target) {
        return Err(KocomError::invalid_transition(
            address,
            format!(
                "target {}°C outside {}..={}",
                target, THERMO_TARGET_MIN, THERMO_TARGET_MAX
            ),
        ));
    }
    Ok(ThermostatState {
        target,
        ..*current
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_modes() {
        assert_eq!(decode(&[0x11, 0x00, 22, 0, 19, 0, 0, 0]).mode, ThermostatMode::Heat);
        assert_eq!(decode(&[0x11, 0x01, 18, 0, 19, 0, 0, 0]).mode, ThermostatMode::Away);
        assert_eq!(decode(&[0x01, 0x00, 22, 0, 19, 0, 0, 0]).mode, ThermostatMode::Off);
        // away flag without heating is still off
        assert_eq!(decode(&[0x01, 0x01, 22, 0, 19, 0, 0, 0]).mode, ThermostatMode::Off);
    }

    #[test]
    fn test_decode_temperatures() {
        let state = decode(&[0x11, 0x00, 22, 0, 19, 0, 0, 0]);
        assert_eq!(state.target, 22);
        assert_eq!(state.current, 19);
    }

    #[test]
    fn test_encode_echoes_current_and_padding() {
        let raw = [0x11, 0x00, 20, 0x05, 19, 0xAB, 0, 0];
        let current = decode(&raw);
        let next = set_target(DeviceAddress::thermostat(1), &current, 22).unwrap();
        assert_eq!(encode(&next, &raw), [0x11, 0x00, 22, 0x05, 19, 0xAB, 0, 0]);

        let away = set_mode(&next, ThermostatMode::Away);
        assert_eq!(encode(&away, &raw)[..3], [0x11, 0x01, 22]);
        let off = set_mode(&next, ThermostatMode::Off);
        assert_eq!(encode(&off, &raw)[..2], [0x01, 0x00]);
    }

    #[test]
    fn test_target_range() {
        let current = decode(&[0; 8]);
        let address = DeviceAddress::thermostat(0);
        assert!(set_target(address, &current, 5).is_ok());
        assert!(set_target(address, &current, 40).is_ok());
        assert!(matches!(
            set_target(address, &current, 4),
            Err(KocomError::InvalidTransition { .. })
        ));
        assert!(set_target(address, &current, 41).is_err());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(ThermostatMode::from_name("HEAT"), Some(ThermostatMode::Heat));
        assert_eq!(ThermostatMode::from_name("cool"), None);
    }
}
