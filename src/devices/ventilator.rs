// MIT License - Copyright (c) 2026 Peter Wright
// Heat-exchange ventilator payload rules

use serde::Serialize;

use crate::constants::{FAN_DEFAULT_MODE, FAN_OFF, FAN_ON, FAN_SPEED_STEP, VALUE_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FanSpeed {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl FanSpeed {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FanSpeed {
    type Error = u8;

    fn try_from(level: u8) -> std::result::Result<Self, u8> {
        Self::from_level(level).ok_or(level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VentilatorState {
    pub on: bool,
    /// `None` until the fan has reported a non-zero speed.
    pub speed: Option<FanSpeed>,
}

/// Payload the ventilator starts from before its first report.
pub fn default_raw() -> [u8; VALUE_LEN] {
    [FAN_OFF, FAN_DEFAULT_MODE, 0, 0, 0, 0, 0, 0]
}

pub fn decode(value: &[u8; VALUE_LEN]) -> VentilatorState {
    VentilatorState {
        on: value[0] == FAN_ON,
        speed: FanSpeed::from_level(value[2] / FAN_SPEED_STEP),
    }
}

/// Build a set payload. The ventilation mode byte is echoed, falling back to
/// the default mode when the fan never reported one.
pub fn encode(state: &VentilatorState, raw: &[u8; VALUE_LEN]) -> [u8; VALUE_LEN] {
    let mut value = *raw;
    value[0] = if state.on { FAN_ON } else { FAN_OFF };
    if value[1] == 0 {
        value[1] = FAN_DEFAULT_MODE;
    }
    if let Some(speed) = state.speed {
        value[2] = speed.level() * FAN_SPEED_STEP;
    }
    value
}

/// Power on at the previous speed (medium if there is none), or power off
/// keeping the speed for next time.
pub fn set_power(current: &VentilatorState, on: bool) -> VentilatorState {
    VentilatorState {
        on,
        speed: if on {
            Some(current.speed.unwrap_or(FanSpeed::Medium))
        } else {
            current.speed
        },
    }
}

/// Selecting a speed also powers the fan on.
pub fn set_speed(speed: FanSpeed) -> VentilatorState {
    VentilatorState {
        on: true,
        speed: Some(speed),
    }
}
