// MIT License - Copyright (c) 2026 Peter Wright
// Kocom packet model

use std::fmt;

use serde::Serialize;

use crate::constants::{
    CLASS_GAS_VALVE, CLASS_LIGHT, CLASS_THERMOSTAT, CLASS_VENTILATOR, CLASS_WALLPAD, CMD_LOCK,
    CMD_QUERY, CMD_STATE, CMD_UNLOCK, MONITOR, PREFIX, TYPE_ACK, TYPE_REQUEST, VALUE_LEN,
};

/// Category of a device on the wallpad bus.
///
/// Classes outside the supported set still decode, as [`DeviceClass::Other`],
/// so a frame from an unsupported device is well-formed but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceClass {
    /// The wallpad itself (and this bridge, which impersonates it).
    Wallpad,
    Light,
    Thermostat,
    GasValve,
    /// Heat-exchange ventilation fan.
    Ventilator,
    Other(u8),
}

impl DeviceClass {
    pub fn from_code(code: u8) -> Self {
        match code {
            CLASS_WALLPAD => Self::Wallpad,
            CLASS_LIGHT => Self::Light,
            CLASS_THERMOSTAT => Self::Thermostat,
            CLASS_GAS_VALVE => Self::GasValve,
            CLASS_VENTILATOR => Self::Ventilator,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Wallpad => CLASS_WALLPAD,
            Self::Light => CLASS_LIGHT,
            Self::Thermostat => CLASS_THERMOSTAT,
            Self::GasValve => CLASS_GAS_VALVE,
            Self::Ventilator => CLASS_VENTILATOR,
            Self::Other(code) => *code,
        }
    }

    /// Short lowercase name, used in logs and MQTT topics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wallpad => "wallpad",
            Self::Light => "light",
            Self::Thermostat => "thermostat",
            Self::GasValve => "gas_valve",
            Self::Ventilator => "ventilator",
            Self::Other(_) => "other",
        }
    }

    /// Parse the name returned by [`DeviceClass::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "wallpad" => Some(Self::Wallpad),
            "light" => Some(Self::Light),
            "thermostat" => Some(Self::Thermostat),
            "gas_valve" | "gas" => Some(Self::GasValve),
            "ventilator" | "fan" => Some(Self::Ventilator),
            _ => None,
        }
    }
}

impl Serialize for DeviceClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// One physical unit on the bus: a device class plus its room index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceAddress {
    pub class: DeviceClass,
    pub id: u8,
}

impl DeviceAddress {
    pub const fn new(class: DeviceClass, id: u8) -> Self {
        Self { class, id }
    }

    /// The address this bridge sends from.
    pub const fn wallpad() -> Self {
        Self::new(DeviceClass::Wallpad, 0)
    }

    pub const fn light(room: u8) -> Self {
        Self::new(DeviceClass::Light, room)
    }

    pub const fn thermostat(room: u8) -> Self {
        Self::new(DeviceClass::Thermostat, room)
    }

    /// There is one gas valve per household, always at id 0.
    pub const fn gas_valve() -> Self {
        Self::new(DeviceClass::GasValve, 0)
    }

    /// There is one ventilator per household, always at id 0.
    pub const fn ventilator() -> Self {
        Self::new(DeviceClass::Ventilator, 0)
    }

    pub(crate) fn from_bytes(bytes: [u8; 2]) -> Self {
        Self::new(DeviceClass::from_code(bytes[0]), bytes[1])
    }

    pub(crate) fn to_bytes(self) -> [u8; 2] {
        [self.class.code(), self.id]
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            DeviceClass::Other(code) => write!(f, "other[{:02X}]/{}", code, self.id),
            class => write!(f, "{}/{}", class.name(), self.id),
        }
    }
}

/// Command byte of a frame.
///
/// `State` is both the "set" command sent by the wallpad and the state report
/// sent back by a device; the payload carries the full device state either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    State,
    Query,
    /// Gas valve reported open.
    Unlock,
    /// Gas valve close request, or closed report.
    Lock,
    Other(u8),
}

impl Command {
    pub fn from_code(code: u8) -> Self {
        match code {
            CMD_STATE => Self::State,
            CMD_QUERY => Self::Query,
            CMD_UNLOCK => Self::Unlock,
            CMD_LOCK => Self::Lock,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::State => CMD_STATE,
            Self::Query => CMD_QUERY,
            Self::Unlock => CMD_UNLOCK,
            Self::Lock => CMD_LOCK,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State => f.write_str("STATE"),
            Self::Query => f.write_str("QUERY"),
            Self::Unlock => f.write_str("UNLOCK"),
            Self::Lock => f.write_str("LOCK"),
            Self::Other(code) => write!(f, "CMD[{:02X}]", code),
        }
    }
}

/// Whether a frame is a request or the acknowledgement of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Request,
    Ack,
}

impl PacketKind {
    fn base(&self) -> u8 {
        match self {
            Self::Request => TYPE_REQUEST,
            Self::Ack => TYPE_ACK,
        }
    }
}

/// A decoded Kocom frame.
///
/// The checksum and the markers are not stored: they are validated on decode
/// and always recomputed on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Byte 2, `0x30` on frames the wallpad sends.
    pub prefix: u8,
    pub kind: PacketKind,
    /// Transmission index, 0 for the first send and up to 2 for the last retry.
    pub attempt: u8,
    /// Byte 4.
    pub monitor: u8,
    pub dst: DeviceAddress,
    pub src: DeviceAddress,
    pub command: Command,
    pub value: [u8; VALUE_LEN],
}

impl Packet {
    /// A first-transmission request from the wallpad to `dst`.
    pub fn request(dst: DeviceAddress, command: Command, value: [u8; VALUE_LEN]) -> Self {
        Self {
            prefix: PREFIX,
            kind: PacketKind::Request,
            attempt: 0,
            monitor: MONITOR,
            dst,
            src: DeviceAddress::wallpad(),
            command,
            value,
        }
    }

    /// A status query to `dst`.
    pub fn query(dst: DeviceAddress) -> Self {
        Self::request(dst, Command::Query, [0; VALUE_LEN])
    }

    /// The acknowledgement a device sends back for `request`, carrying `value`.
    pub fn ack_for(request: &Packet, value: [u8; VALUE_LEN]) -> Self {
        Self {
            prefix: request.prefix,
            kind: PacketKind::Ack,
            attempt: request.attempt,
            monitor: request.monitor,
            dst: request.src,
            src: request.dst,
            command: request.command,
            value,
        }
    }

    /// The same packet marked as transmission number `attempt` (0-based).
    pub fn with_attempt(mut self, attempt: u8) -> Self {
        self.attempt = attempt;
        self
    }

    /// Packet type byte (`BC`..`BE`, `DC`..`DE`).
    pub fn type_byte(&self) -> u8 {
        self.kind.base() + self.attempt
    }

    /// Split a packet type byte into its kind and transmission index.
    pub fn parse_type(byte: u8) -> Option<(PacketKind, u8)> {
        match byte {
            0xBC..=0xBE => Some((PacketKind::Request, byte - TYPE_REQUEST)),
            0xDC..=0xDE => Some((PacketKind::Ack, byte - TYPE_ACK)),
            _ => None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }

    /// Whether the frame was sent by the wallpad (or by this bridge).
    pub fn from_wallpad(&self) -> bool {
        self.src.class == DeviceClass::Wallpad
    }
}

impl fmt::Display for Packet {
    /// Spaced upper-case hex of the encoded frame, the way bus sniffers print it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_bytes(&crate::codec::encode(self)))
    }
}

/// Format bytes as `AA 55 30 BC ...`.
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
