// MIT License - Copyright (c) 2026 Peter Wright
// Error types

use crate::packet::{Command, DeviceAddress};

/// Reasons a buffered frame is rejected by the codec.
///
/// These never reach a caller: the reader logs them and resynchronizes one byte
/// past the rejected start marker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad trailer {0:02X?}")]
    BadFooter([u8; 2]),

    #[error("unknown packet type {0:#04X}")]
    UnknownPacketType(u8),

    #[error("checksum mismatch: expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// All errors that can occur in the kocom-wallpad library.
#[derive(Debug, thiserror::Error)]
pub enum KocomError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Bridge disconnected")]
    Disconnected,

    #[error("No acknowledgement from {address} for {command} after {attempts} attempts")]
    CommandTimeout {
        address: DeviceAddress,
        command: Command,
        attempts: u8,
    },

    #[error("Protocol violation from {address} ({command}): {details}")]
    ProtocolViolation {
        address: DeviceAddress,
        command: Command,
        details: String,
    },

    #[error("Invalid transition for {address}: {reason}")]
    InvalidTransition {
        address: DeviceAddress,
        reason: String,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceAddress),

    /// The device has not reported its state since the last (re)connection.
    #[error("State of {0} is not known yet")]
    NotSynchronized(DeviceAddress),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session shut down")]
    Cancelled,

    #[error("Channel closed")]
    ChannelClosed,
}

impl KocomError {
    /// Whether this error is transient and the command may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KocomError::Io(_)
                | KocomError::ConnectionTimeout
                | KocomError::Disconnected
                | KocomError::CommandTimeout { .. }
                | KocomError::ChannelClosed
                | KocomError::NotSynchronized(_)
        )
    }

    pub(crate) fn invalid_transition(address: DeviceAddress, reason: impl Into<String>) -> Self {
        KocomError::InvalidTransition {
            address,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KocomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KocomError::Disconnected.is_retryable());
        assert!(
            KocomError::CommandTimeout {
                address: DeviceAddress::light(0),
                command: Command::State,
                attempts: 3,
            }
            .is_retryable()
        );
        assert!(!KocomError::Cancelled.is_retryable());
        assert!(KocomError::NotSynchronized(DeviceAddress::light(1)).is_retryable());
        assert!(!KocomError::invalid_transition(DeviceAddress::gas_valve(), "no").is_retryable());
        assert!(!KocomError::Frame(FrameError::UnknownPacketType(0x11)).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = KocomError::CommandTimeout {
            address: DeviceAddress::thermostat(2),
            command: Command::State,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "No acknowledgement from thermostat/2 for STATE after 3 attempts"
        );
        let err: KocomError = FrameError::ChecksumMismatch {
            expected: 0x35,
            actual: 0x36,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Frame error: checksum mismatch: expected 0x35, got 0x36"
        );
    }
}
