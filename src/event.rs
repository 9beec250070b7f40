// MIT License - Copyright (c) 2026 Peter Wright
// Session events

use crate::devices::DeviceState;
use crate::packet::DeviceAddress;

/// All events that can be emitted by a session.
///
/// Users subscribe via `session.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<SessionEvent>`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Link to the EW11 bridge established
    Connected,
    /// Link lost; a reconnection is already scheduled
    Disconnected,
    /// A device reported a state different from the last known one
    StateChanged {
        address: DeviceAddress,
        state: DeviceState,
    },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
