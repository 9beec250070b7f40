// MIT License - Copyright (c) 2026 Peter Wright
// Gas valve rules

use serde::Serialize;

use crate::error::{KocomError, Result};
use crate::packet::{Command, DeviceAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValvePosition {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasValveState {
    pub position: ValvePosition,
}

impl GasValveState {
    pub fn is_closed(&self) -> bool {
        self.position == ValvePosition::Closed
    }
}

/// The valve carries its state in the command code, not the payload.
/// Returns `None` for commands that say nothing about the position.
pub fn decode(command: Command) -> Option<GasValveState> {
    let position = match command {
        Command::Lock => ValvePosition::Closed,
        Command::Unlock => ValvePosition::Open,
        _ => return None,
    };
    Some(GasValveState { position })
}

/// Closing is always allowed; opening is only possible by hand at the valve.
pub fn set_open(address: DeviceAddress, open: bool) -> Result<GasValveState> {
    if open {
        return Err(KocomError::invalid_transition(
            address,
            "the gas valve can only be opened manually",
        ));
    }
    Ok(GasValveState {
        position: ValvePosition::Closed,
    })
}
