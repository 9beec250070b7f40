// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Duration, interval};
use tracing::{debug, error, info, warn};

use kocom_wallpad::{
    DeviceAddress, DeviceClass, DeviceMap, DeviceState, FanSpeed, KocomError, Session,
    SessionConfig, SessionEvent, ThermostatMode,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "kocom2mqtt")]
#[command(about = "Bridge between a Kocom wallpad (via EW11) and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    ew11: Ew11Toml,
    devices: DevicesToml,
    mqtt: MqttToml,
}

#[derive(Debug, Deserialize)]
struct Ew11Toml {
    host: String,
    #[serde(default = "default_ew11_port")]
    port: u16,
    /// Second bridge used only for sending, for split-bus installations
    #[serde(default)]
    write_host: Option<String>,
    #[serde(default = "default_ew11_port")]
    write_port: u16,
    /// Thermostat polling interval; omit to disable polling
    #[serde(default)]
    poll_interval_secs: Option<u64>,
    #[serde(default = "default_poll_spacing")]
    poll_spacing_ms: u64,
    #[serde(default = "default_ack_timeout")]
    ack_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u8,
    #[serde(default = "default_send_gap")]
    send_gap_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay")]
    max_reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    refresh_on_connect: bool,
}

fn default_ew11_port() -> u16 {
    8899
}
fn default_poll_spacing() -> u64 {
    500
}
fn default_ack_timeout() -> u64 {
    1000
}
fn default_max_attempts() -> u8 {
    3
}
fn default_send_gap() -> u64 {
    250
}
fn default_reconnect_delay() -> u64 {
    1000
}
fn default_max_reconnect_delay() -> u64 {
    60000
}
fn default_connect_timeout() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DevicesToml {
    /// Rooms with lights and their channel counts, e.g. "0:3,1:2"
    #[serde(default)]
    lights: String,
    /// Rooms with a thermostat, e.g. "0,1,2"
    #[serde(default)]
    thermostats: String,
    #[serde(default)]
    ventilator: bool,
    #[serde(default)]
    gas_valve: bool,
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_snapshot_interval")]
    snapshot_interval_secs: u64,
}

fn default_client_id() -> String {
    "kocom-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "kocom/cmd".to_string()
}
fn default_publish_topic() -> String {
    "kocom".to_string()
}
fn default_snapshot_interval() -> u64 {
    300
}

fn build_device_map(toml: &DevicesToml) -> Result<DeviceMap> {
    Ok(DeviceMap {
        lights: DeviceMap::parse_lights(&toml.lights).context("Invalid [devices] lights")?,
        thermostats: DeviceMap::parse_thermostats(&toml.thermostats)
            .context("Invalid [devices] thermostats")?,
        ventilator: toml.ventilator,
        gas_valve: toml.gas_valve,
    })
}

fn build_session_config(config: &Config) -> Result<SessionConfig> {
    let ew11 = &config.ew11;
    let mut builder = SessionConfig::builder()
        .host(&ew11.host)
        .port(ew11.port)
        .devices(build_device_map(&config.devices)?)
        .poll_interval_ms(ew11.poll_interval_secs.map(|s| s * 1000))
        .poll_spacing_ms(ew11.poll_spacing_ms)
        .ack_timeout_ms(ew11.ack_timeout_ms)
        .max_attempts(ew11.max_attempts)
        .send_gap_ms(ew11.send_gap_ms)
        .reconnect_delay_ms(ew11.reconnect_delay_ms)
        .max_reconnect_delay_ms(ew11.max_reconnect_delay_ms)
        .connect_timeout_ms(ew11.connect_timeout_ms)
        .refresh_on_connect(ew11.refresh_on_connect);
    if let Some(write_host) = &ew11.write_host {
        builder = builder.write_endpoint(write_host, ew11.write_port);
    }
    let session_config = builder.build();
    session_config.validate()?;
    Ok(session_config)
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share a {now, op, ...} flat structure

#[derive(Serialize)]
struct MqttSnapshot {
    now: u64,
    op: String,
    connected: bool,
    devices: Vec<MqttDevice>,
}

#[derive(Serialize)]
struct MqttDevice {
    device: &'static str,
    room: u8,
    /// null until the device has reported since the last reconnection
    state: Option<DeviceState>,
}

// Retained per-device message: {now, op, device, room, state}
#[derive(Serialize)]
struct MqttDeviceState {
    now: u64,
    op: String,
    #[serde(flatten)]
    device: MqttDevice,
}

#[derive(Serialize)]
struct MqttStatus {
    now: u64,
    op: String,
    connected: bool,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    room: Option<u8>,
    #[serde(default)]
    channel: Option<u8>,
    /// Target temperature for SET_TEMPERATURE
    #[serde(default)]
    value: Option<u8>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    speed: Option<u8>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn device_entry(address: DeviceAddress, state: Option<DeviceState>) -> MqttDevice {
    MqttDevice {
        device: address.class.name(),
        room: address.id,
        state,
    }
}

fn state_topic(base: &str, address: DeviceAddress) -> String {
    format!("{base}/{}/{}/state", address.class.name(), address.id)
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    result: std::result::Result<Option<serde_json::Value>, String>,
    src: Option<serde_json::Value>,
) {
    let (success, data, error) = match result {
        Ok(data) => (true, data, None),
        Err(e) => (false, None, Some(e)),
    };
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
        error,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_device_state(
    client: &AsyncClient,
    base: &str,
    address: DeviceAddress,
    state: Option<DeviceState>,
) {
    let msg = MqttDeviceState {
        now: now_epoch_ms(),
        op: "STATE".to_string(),
        device: device_entry(address, state),
    };
    publish_json(client, &state_topic(base, address), &msg, true).await;
}

async fn publish_status(client: &AsyncClient, base: &str, connected: bool) {
    let msg = MqttStatus {
        now: now_epoch_ms(),
        op: "STATUS".to_string(),
        connected,
    };
    publish_json(client, &format!("{base}/status"), &msg, true).await;
}

async fn build_snapshot(session: &Session) -> MqttSnapshot {
    let devices = session
        .devices()
        .await
        .into_iter()
        .map(|(address, state)| device_entry(address, state))
        .collect();
    MqttSnapshot {
        now: now_epoch_ms(),
        op: "SNAPSHOT".to_string(),
        connected: session.is_connected(),
        devices,
    }
}

async fn publish_snapshot(client: &AsyncClient, topic: &str, session: &Session) {
    let snapshot = build_snapshot(session).await;
    publish_json(client, topic, &snapshot, true).await;
}

// ---------------------------------------------------------------------------
// Session event → MQTT
// ---------------------------------------------------------------------------

async fn handle_session_event(event: SessionEvent, client: &AsyncClient, topic: &str) {
    match event {
        SessionEvent::Connected => {
            info!("Wallpad bus connected");
            publish_status(client, topic, true).await;
        }
        SessionEvent::Disconnected => {
            warn!("Wallpad bus disconnected");
            publish_status(client, topic, false).await;
        }
        SessionEvent::StateChanged { address, state } => {
            debug!("{address} -> {state:?}");
            publish_device_state(client, topic, address, Some(state)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

fn command_address(cmd: &MqttCommand) -> std::result::Result<DeviceAddress, String> {
    let name = cmd.device.as_deref().ok_or("missing device")?;
    let class = DeviceClass::from_name(name).ok_or_else(|| format!("unknown device '{name}'"))?;
    Ok(DeviceAddress::new(class, cmd.room.unwrap_or(0)))
}

/// Run one command against the session. Returns the resulting device state
/// as JSON on success.
async fn run_command(
    session: &Session,
    cmd: &MqttCommand,
) -> std::result::Result<Option<serde_json::Value>, String> {
    let to_json = |r: kocom_wallpad::Result<DeviceState>| -> std::result::Result<Option<serde_json::Value>, String> {
        r.map(|s| serde_json::to_value(s).ok())
            .map_err(|e: KocomError| e.to_string())
    };

    match cmd.op.as_str() {
        "TURN_ON" | "TURN_OFF" => {
            let address = command_address(cmd)?;
            let on = cmd.op == "TURN_ON";
            let result = match (cmd.channel, on) {
                (Some(ch), true) => session.turn_on_channel(address, ch).await,
                (Some(ch), false) => session.turn_off_channel(address, ch).await,
                (None, true) => session.turn_on(address).await,
                (None, false) => session.turn_off(address).await,
            };
            to_json(result)
        }
        "SET_TEMPERATURE" => {
            let address = command_address(cmd)?;
            let celsius = cmd.value.ok_or("missing value")?;
            to_json(session.set_target_temperature(address, celsius).await)
        }
        "SET_MODE" => {
            let address = command_address(cmd)?;
            let name = cmd.mode.as_deref().ok_or("missing mode")?;
            let mode = ThermostatMode::from_name(name).ok_or_else(|| format!("unknown mode '{name}'"))?;
            to_json(session.set_mode(address, mode).await)
        }
        "SET_FAN_SPEED" => {
            let level = cmd.speed.ok_or("missing speed")?;
            let speed = FanSpeed::try_from(level).map_err(|l| format!("invalid speed {l} (must be 1-3)"))?;
            to_json(session.set_fan_speed(DeviceAddress::ventilator(), speed).await)
        }
        "CLOSE_VALVE" => to_json(session.close_valve().await),
        "REFRESH" => {
            let address = command_address(cmd)?;
            session
                .refresh(address)
                .await
                .map(|s| s.and_then(|s| serde_json::to_value(s).ok()))
                .map_err(|e| e.to_string())
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

async fn handle_command(payload_str: &str, cmd: MqttCommand, client: &AsyncClient, topic: &str, session: &Session) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    match cmd.op.as_str() {
        "SNAPSHOT" => {
            debug!("Command: SNAPSHOT");
            let snapshot = build_snapshot(session).await;
            let snapshot_value = serde_json::to_value(&snapshot).ok();
            publish_json(client, topic, &snapshot, true).await;
            publish_cmd_ack(client, topic, Ok(snapshot_value), src_json).await;
        }
        "PING" => {
            info!("Command: PING");
            publish_cmd_ack(client, topic, Ok(None), src_json).await;
        }
        op => {
            let result = run_command(session, &cmd).await;
            match &result {
                Ok(_) => info!("{op}: success"),
                Err(e) => warn!("{op} failed: {e}"),
            }
            publish_cmd_ack(client, topic, result, src_json).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=kocom_wallpad=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    // Load config
    let config_text =
        std::fs::read_to_string(&cli.config).context("Failed to read config file")?;
    let config: Config = toml::from_str(&config_text).context("Failed to parse config file")?;

    let mut session_config = build_session_config(&config)?;
    let mut mqtt_client_id = config.mqtt.client_id;
    let mut publish_topic = config.mqtt.publish_topic;
    let mut subscribe_topic = config.mqtt.subscribe_topic;
    let mut snapshot_interval_secs = config.mqtt.snapshot_interval_secs;

    let (mut mqtt_host, mut mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        info!("Starting wallpad session via EW11 at {}", session_config.endpoint);
        let session = Arc::new(Session::start(session_config.clone())?);
        let event_rx = session.subscribe();

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&mqtt_client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {subscribe_topic}");

        // Task 1: session event listener
        let client_events = client.clone();
        let topic_events = publish_topic.clone();
        let event_handle = tokio::spawn(async move {
            let mut rx = event_rx;
            loop {
                match rx.recv().await {
                    Ok(event) => handle_session_event(event, &client_events, &topic_events).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed");
                        break;
                    }
                }
            }
        });

        // Task 2: MQTT event loop (receives messages, dispatches commands)
        let session_cmds = Arc::clone(&session);
        let client_cmds = client.clone();
        let topic_cmds = publish_topic.clone();
        let sub_topic = subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic != sub_topic {
                            continue;
                        }
                        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                        match serde_json::from_str::<MqttCommand>(&payload) {
                            Ok(cmd) => {
                                if cmd.op == "SNAPSHOT" {
                                    debug!("MQTT command received: {payload}");
                                } else {
                                    info!("MQTT command received: {payload}");
                                }
                                // commands wait for device acks; keep polling the broker meanwhile
                                let session = Arc::clone(&session_cmds);
                                let client = client_cmds.clone();
                                let topic = topic_cmds.clone();
                                tokio::spawn(async move {
                                    handle_command(&payload, cmd, &client, &topic, &session).await;
                                });
                            }
                            Err(e) => {
                                warn!("Failed to parse MQTT command: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: snapshot timer, republishes every device's retained state
        let session_snap = Arc::clone(&session);
        let client_snap = client.clone();
        let topic_snap = publish_topic.clone();
        let snap_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(snapshot_interval_secs.max(1)));
            loop {
                ticker.tick().await;
                for (address, state) in session_snap.devices().await {
                    publish_device_state(&client_snap, &topic_snap, address, state).await;
                }
                publish_snapshot(&client_snap, &topic_snap, &session_snap).await;
            }
        });

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        // Abort tasks
        event_handle.abort();
        mqtt_handle.abort();
        snap_handle.abort();
        publish_status(&client, &publish_topic, false).await;

        // commands still awaiting an ack resolve with Cancelled
        session.shutdown().await;

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match std::fs::read_to_string(&cli.config)
            .context("Failed to read config file")
            .and_then(|text| toml::from_str::<Config>(&text).context("Failed to parse config file"))
        {
            Ok(new_config) => match build_session_config(&new_config) {
                Ok(new_session_config) => match parse_mqtt_url(&new_config.mqtt.url) {
                    Ok((new_host, new_port)) => {
                        session_config = new_session_config;
                        mqtt_host = new_host;
                        mqtt_port = new_port;
                        mqtt_client_id = new_config.mqtt.client_id;
                        publish_topic = new_config.mqtt.publish_topic;
                        subscribe_topic = new_config.mqtt.subscribe_topic;
                        snapshot_interval_secs = new_config.mqtt.snapshot_interval_secs;
                        info!("Config reloaded successfully");
                    }
                    Err(e) => warn!("Invalid MQTT URL in new config, keeping previous: {e}"),
                },
                Err(e) => warn!("Invalid session config in new config, keeping previous: {e}"),
            },
            Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
        }

        info!("Restarting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
