// MIT License - Copyright (c) 2026 Peter Wright
// Kocom wallpad protocol engine
//
//! # kocom-wallpad
//!
//! Talks to the RS-485 bus of a Kocom residential wallpad through one or two
//! EW11 serial-to-TCP bridges. Lights, thermostats, the gas valve and the
//! heat-exchange ventilator are exposed as typed state with async commands
//! that resolve once the device has acknowledged them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use kocom_wallpad::{DeviceAddress, DeviceMap, FanSpeed, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let devices = DeviceMap::new()
//!         .with_light(0, 3)
//!         .with_thermostat(0)
//!         .with_ventilator()
//!         .with_gas_valve();
//!     let config = SessionConfig::builder()
//!         .host("192.168.0.200")
//!         .devices(devices)
//!         .poll_interval_ms(Some(300_000))
//!         .build();
//!
//!     let session = Session::start(config)?;
//!
//!     let mut events = session.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     session.wait_connected(Duration::from_secs(10)).await?;
//!     session.set_fan_speed(DeviceAddress::ventilator(), FanSpeed::Low).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use codec::Decoded;
pub use config::{DeviceMap, SessionConfig, SessionConfigBuilder};
pub use devices::{
    DeviceRequest, DeviceState, FanSpeed, GasValveState, LightChannels, LightState,
    ThermostatMode, ThermostatState, ValvePosition, VentilatorState,
};
pub use error::{FrameError, KocomError, Result};
pub use event::{EventReceiver, SessionEvent};
pub use packet::{Command, DeviceAddress, DeviceClass, Packet, PacketKind};
pub use registry::ListenerId;
pub use session::Session;
pub use transport::{BoxStream, Connector, Endpoint, TcpConnector};
