// MIT License - Copyright (c) 2026 Peter Wright
// Light controller payload rules

use bitflags::bitflags;
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::constants::{LIGHT_OFF, LIGHT_ON, MAX_LIGHT_CHANNELS, VALUE_LEN};
use crate::error::{KocomError, Result};
use crate::packet::DeviceAddress;

bitflags! {
    /// On/off state of the channels of one light controller.
    ///
    /// Bit *n* mirrors payload byte *n*: `FF` on the wire is a set bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LightChannels: u8 {
        const CH0 = 1 << 0;
        const CH1 = 1 << 1;
        const CH2 = 1 << 2;
        const CH3 = 1 << 3;
        const CH4 = 1 << 4;
        const CH5 = 1 << 5;
        const CH6 = 1 << 6;
        const CH7 = 1 << 7;
    }
}

impl LightChannels {
    /// The flag for a single channel index. Out of range indexes give an empty set.
    pub fn channel(index: u8) -> Self {
        if index < MAX_LIGHT_CHANNELS {
            Self::from_bits_retain(1 << index)
        } else {
            Self::empty()
        }
    }

    /// The first `count` channels.
    pub fn first(count: u8) -> Self {
        (0..count.min(MAX_LIGHT_CHANNELS)).fold(Self::empty(), |acc, i| acc | Self::channel(i))
    }
}

/// State of one light controller (one room).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightState {
    /// Number of channels wired in this room.
    pub channels: u8,
    pub on: LightChannels,
}

impl LightState {
    /// All channels off.
    pub fn new(channels: u8) -> Self {
        Self {
            channels,
            on: LightChannels::empty(),
        }
    }

    pub fn is_on(&self, channel: u8) -> bool {
        self.on.contains(LightChannels::channel(channel))
    }

    pub fn any_on(&self) -> bool {
        !self.on.is_empty()
    }
}

impl Serialize for LightState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let on: Vec<bool> = (0..self.channels).map(|i| self.is_on(i)).collect();
        let mut s = serializer.serialize_struct("LightState", 2)?;
        s.serialize_field("channels", &self.channels)?;
        s.serialize_field("on", &on)?;
        s.end()
    }
}

/// Read a light report. Any non-zero byte counts as on; channels beyond the
/// configured count are dropped.
pub fn decode(value: &[u8; VALUE_LEN], channels: u8) -> LightState {
    let mut on = LightChannels::empty();
    for (i, &b) in value.iter().enumerate().take(channels as usize) {
        if b != LIGHT_OFF {
            on |= LightChannels::channel(i as u8);
        }
    }
    LightState { channels, on }
}

/// Build the payload for `state`. Bytes of channels outside the configured
/// count are echoed from the last raw report.
pub fn encode(state: &LightState, raw: &[u8; VALUE_LEN]) -> [u8; VALUE_LEN] {
    let mut value = *raw;
    for (i, b) in value.iter_mut().enumerate().take(state.channels as usize) {
        *b = if state.is_on(i as u8) { LIGHT_ON } else { LIGHT_OFF };
    }
    value
}

/// Switch one channel.
pub fn set_channel(
    address: DeviceAddress,
    current: &LightState,
    channel: u8,
    on: bool,
) -> Result<LightState> {
    if channel >= current.channels {
        return Err(KocomError::invalid_transition(
            address,
            format!(
                "channel {} out of range (room has {} channels)",
                channel, current.channels
            ),
        ));
    }
    let mut next = *current;
    next.on.set(LightChannels::channel(channel), on);
    Ok(next)
}

/// Switch every configured channel.
pub fn set_all(current: &LightState, on: bool) -> LightState {
    let mut next = *current;
    next.on = if on {
        LightChannels::first(current.channels)
    } else {
        LightChannels::empty()
    };
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_any_nonzero_is_on() {
        let state = decode(&[0xFF, 0x00, 0x01, 0xFF, 0, 0, 0, 0], 3);
        assert!(state.is_on(0));
        assert!(!state.is_on(1));
        assert!(state.is_on(2));
        // channel 3 is not wired in this room
        assert!(!state.is_on(3));
        assert_eq!(state.on, LightChannels::CH0 | LightChannels::CH2);
    }

    #[test]
    fn test_encode_echoes_unwired_channels() {
        let raw = [0x00, 0x00, 0x00, 0xFF, 0, 0, 0, 0];
        let state = LightState {
            channels: 2,
            on: LightChannels::CH1,
        };
        assert_eq!(encode(&state, &raw), [0x00, 0xFF, 0x00, 0xFF, 0, 0, 0, 0]);
    }

    #[test]
    fn test_set_channel() {
        let address = DeviceAddress::light(1);
        let state = LightState::new(3);
        let next = set_channel(address, &state, 2, true).unwrap();
        assert!(next.is_on(2));
        assert_eq!(next.on ^ state.on, LightChannels::CH2);

        let err = set_channel(address, &state, 3, true).unwrap_err();
        assert!(matches!(err, KocomError::InvalidTransition { .. }));
    }

    #[test]
    fn test_set_all() {
        let state = set_all(&LightState::new(4), true);
        assert_eq!(state.on.bits(), 0b1111);
        assert!(!set_all(&state, false).any_on());
    }

    #[test]
    fn test_serialize() {
        let state = LightState {
            channels: 3,
            on: LightChannels::CH0,
        };
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json, serde_json::json!({"channels": 3, "on": [true, false, false]}));
    }
}
