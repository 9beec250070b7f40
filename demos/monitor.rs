//! Example: Connect to an EW11 bridge and print every device state change.

use std::time::Duration;

use kocom_wallpad::{DeviceMap, Session, SessionConfig, SessionEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let devices = DeviceMap::new()
        .with_light(0, 3)
        .with_light(1, 2)
        .with_thermostat(0)
        .with_thermostat(1)
        .with_ventilator()
        .with_gas_valve();

    let config = SessionConfig::builder()
        .host("192.168.0.200")
        .port(8899)
        .devices(devices)
        .poll_interval_ms(Some(60_000))
        .build();

    let session = Session::start(config)?;
    let mut events = session.subscribe();

    println!("Connecting to EW11...");
    session.wait_connected(Duration::from_secs(15)).await?;
    println!("Listening for state changes (Ctrl+C to stop)...\n");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::StateChanged { address, state }) => {
                        println!("{:16} {:?}", address.to_string(), state);
                    }
                    Ok(event) => {
                        println!("Event: {:?}", event);
                    }
                    Err(e) => {
                        println!("Event channel error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    println!("\n--- Last known state ---");
    for (address, state) in session.devices().await {
        match state {
            Some(state) => println!("  {:16} on={} {:?}", address.to_string(), state.is_on(), state),
            None => println!("  {:16} (no report)", address.to_string()),
        }
    }

    session.shutdown().await;
    Ok(())
}
