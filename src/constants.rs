// MIT License - Copyright (c) 2026 Peter Wright
// Kocom wire constants

/// Frame start marker.
pub const HEADER: [u8; 2] = [0xAA, 0x55];
/// Frame trailer.
pub const FOOTER: [u8; 2] = [0x0D, 0x0D];

/// Every Kocom frame is exactly this long, markers included.
pub const FRAME_LEN: usize = 21;
/// Number of payload bytes carried by every frame.
pub const VALUE_LEN: usize = 8;

/// Byte 2 of every frame emitted by the wallpad.
pub const PREFIX: u8 = 0x30;
/// Byte 4, always zero on the buses seen so far.
pub const MONITOR: u8 = 0x00;

/// Packet type byte of a first transmission request.
pub const TYPE_REQUEST: u8 = 0xBC;
/// Packet type byte of a first transmission acknowledgement.
pub const TYPE_ACK: u8 = 0xDC;
/// Requests and acks are retransmitted at most three times (`BC`, `BD`, `BE`).
pub const MAX_TRANSMISSIONS: u8 = 3;

/// Offsets inside a frame.
pub const OFFSET_PREFIX: usize = 2;
pub const OFFSET_TYPE: usize = 3;
pub const OFFSET_MONITOR: usize = 4;
pub const OFFSET_DST: usize = 5;
pub const OFFSET_SRC: usize = 7;
pub const OFFSET_COMMAND: usize = 9;
pub const OFFSET_VALUE: usize = 10;
pub const OFFSET_CHECKSUM: usize = 18;
pub const OFFSET_FOOTER: usize = 19;

/// Device class bytes.
pub const CLASS_WALLPAD: u8 = 0x01;
pub const CLASS_LIGHT: u8 = 0x0E;
pub const CLASS_THERMOSTAT: u8 = 0x36;
pub const CLASS_GAS_VALVE: u8 = 0x2C;
pub const CLASS_VENTILATOR: u8 = 0x48;

/// Command bytes.
pub const CMD_STATE: u8 = 0x00;
pub const CMD_UNLOCK: u8 = 0x01;
pub const CMD_LOCK: u8 = 0x02;
pub const CMD_QUERY: u8 = 0x3A;

/// Default TCP port of an EW11 bridge.
pub const DEFAULT_EW11_PORT: u16 = 8899;

/// Number of light channels one light controller can carry.
pub const MAX_LIGHT_CHANNELS: u8 = 8;

/// Thermostat byte values.
pub const THERMO_HEATING_ON: u8 = 0x11;
pub const THERMO_HEATING_OFF: u8 = 0x01;
pub const THERMO_AWAY: u8 = 0x01;
pub const THERMO_PRESENT: u8 = 0x00;

/// Accepted target temperature range in whole degrees Celsius.
pub const THERMO_TARGET_MIN: u8 = 5;
pub const THERMO_TARGET_MAX: u8 = 40;

/// Ventilator byte values.
pub const FAN_ON: u8 = 0x11;
pub const FAN_OFF: u8 = 0x00;
pub const FAN_DEFAULT_MODE: u8 = 0x01;
pub const FAN_SPEED_STEP: u8 = 0x40;

/// Light channel byte values.
pub const LIGHT_ON: u8 = 0xFF;
pub const LIGHT_OFF: u8 = 0x00;
