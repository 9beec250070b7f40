// End-to-end session tests against a fake EW11 bridge on 127.0.0.1.
//
// The fake decodes what the session writes, records it, and answers through a
// per-test responder closure. It can also inject device reports and drop the
// connection to exercise reconnection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use kocom_wallpad::codec::{self, Decoded};
use kocom_wallpad::{
    Command, DeviceAddress, DeviceClass, DeviceMap, DeviceState, EventReceiver, KocomError, Packet,
    Session, SessionConfig, SessionEvent, ThermostatMode, ValvePosition,
};

const WAIT: Duration = Duration::from_secs(3);

type Responder = Arc<dyn Fn(&Packet) -> Option<Packet> + Send + Sync>;

struct FakeEw11 {
    port: u16,
    received: Arc<StdMutex<Vec<Packet>>>,
    log: Arc<StdMutex<Vec<&'static str>>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    reader: Arc<StdMutex<Option<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl FakeEw11 {
    async fn start(reply_delay: Duration, responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::new(StdMutex::new(Vec::new()));
        let writer: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));
        let reader: Arc<StdMutex<Option<JoinHandle<()>>>> = Arc::new(StdMutex::new(None));

        let accept = {
            let (received, log, writer, reader) =
                (received.clone(), log.clone(), writer.clone(), reader.clone());
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let (mut rd, wr) = socket.into_split();
                    *writer.lock().await = Some(wr);

                    let (received, log, writer, responder) =
                        (received.clone(), log.clone(), writer.clone(), responder.clone());
                    let handle = tokio::spawn(async move {
                        let mut pending = Vec::new();
                        let mut chunk = [0u8; 256];
                        loop {
                            let n = match rd.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            };
                            pending.extend_from_slice(&chunk[..n]);
                            for decoded in codec::drain(&mut pending) {
                                let Decoded::Packet(packet) = decoded else {
                                    continue;
                                };
                                received.lock().unwrap().push(packet.clone());
                                log.lock().unwrap().push("rx");
                                if let Some(reply) = responder(&packet) {
                                    let (writer, log) = (writer.clone(), log.clone());
                                    tokio::spawn(async move {
                                        sleep(reply_delay).await;
                                        log.lock().unwrap().push("ack");
                                        if let Some(w) = writer.lock().await.as_mut() {
                                            let _ = w.write_all(&codec::encode(&reply)).await;
                                        }
                                    });
                                }
                            }
                        }
                    });
                    if let Some(old) = reader.lock().unwrap().replace(handle) {
                        old.abort();
                    }
                }
            })
        };

        Self {
            port,
            received,
            log,
            writer,
            reader,
            accept,
        }
    }

    /// Write raw bytes to the session, waiting for it to be accepted first.
    async fn inject_raw(&self, bytes: &[u8]) {
        timeout(WAIT, async {
            loop {
                if let Some(w) = self.writer.lock().await.as_mut() {
                    w.write_all(bytes).await.unwrap();
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no client connected");
    }

    async fn inject(&self, packet: &Packet) {
        self.inject_raw(&codec::encode(packet)).await;
    }

    async fn drop_connection(&self) {
        self.writer.lock().await.take();
        if let Some(h) = self.reader.lock().unwrap().take() {
            h.abort();
        }
    }

    fn received(&self) -> Vec<Packet> {
        self.received.lock().unwrap().clone()
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for FakeEw11 {
    fn drop(&mut self) {
        self.accept.abort();
        if let Some(h) = self.reader.lock().unwrap().take() {
            h.abort();
        }
    }
}

/// Acknowledge every request from the wallpad, echoing its payload.
fn echo() -> Responder {
    Arc::new(|p: &Packet| (!p.is_ack()).then(|| Packet::ack_for(p, p.value)))
}

fn silent() -> Responder {
    Arc::new(|_: &Packet| None)
}

/// A frame a device sends on its own.
fn report(src: DeviceAddress, command: Command, value: [u8; 8]) -> Packet {
    let mut p = Packet::request(DeviceAddress::wallpad(), command, value);
    p.src = src;
    p
}

fn config(port: u16, devices: DeviceMap) -> SessionConfig {
    SessionConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .devices(devices)
        .ack_timeout_ms(200)
        .retry_jitter_ms(0, 10)
        .send_gap_ms(5)
        .reconnect_delay_ms(50)
        .max_reconnect_delay_ms(200)
        .connect_timeout_ms(1000)
        .refresh_on_connect(false)
        .build()
}

async fn wait_state(
    session: &Session,
    address: DeviceAddress,
    pred: impl Fn(&DeviceState) -> bool,
) -> DeviceState {
    timeout(WAIT, async {
        loop {
            if let Ok(Some(state)) = session.current_state(address).await
                && pred(&state)
            {
                return state;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state never reached")
}

async fn wait_event(rx: &mut EventReceiver, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test]
async fn test_light_on_acknowledged_notifies_once() {
    let fake = FakeEw11::start(Duration::ZERO, echo()).await;
    let light = DeviceAddress::light(0);
    let session = Session::start(config(fake.port, DeviceMap::new().with_light(0, 2))).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    session
        .on_change(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    let mut events = session.subscribe();

    let state = session.turn_on(light).await.unwrap();
    let DeviceState::Light(s) = state else {
        panic!("expected light state, got {:?}", state);
    };
    assert!(s.is_on(0) && s.is_on(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    match wait_event(&mut events, |e| matches!(e, SessionEvent::StateChanged { .. })).await {
        SessionEvent::StateChanged { address, .. } => assert_eq!(address, light),
        other => panic!("unexpected {:?}", other),
    }

    let sent = fake.received();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dst, light);
    assert_eq!(sent[0].command, Command::State);
    assert_eq!(sent[0].value[..2], [0xFF, 0xFF]);
}

#[tokio::test]
async fn test_repeated_reports_are_idempotent() {
    let fake = FakeEw11::start(Duration::ZERO, echo()).await;
    let fan = DeviceAddress::ventilator();
    let session = Session::start(config(fake.port, DeviceMap::new().with_ventilator())).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    session
        .on_change(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    let running = report(fan, Command::State, [0x11, 0x01, 0x80, 0, 0, 0, 0, 0]);
    fake.inject(&running).await;
    fake.inject(&running).await;
    fake.inject(&running).await;
    let state = wait_state(&session, fan, |s| s.is_on()).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(session.current_state(fan).await.unwrap(), Some(state));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_thermostat_target_and_current_are_independent() {
    let fake = FakeEw11::start(Duration::ZERO, echo()).await;
    let thermo = DeviceAddress::thermostat(0);
    let session = Session::start(config(fake.port, DeviceMap::new().with_thermostat(0))).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    fake.inject(&report(thermo, Command::State, [0x11, 0x00, 20, 0x00, 19, 0x00, 0, 0]))
        .await;
    wait_state(&session, thermo, |_| true).await;

    let DeviceState::Thermostat(t) = session.set_target_temperature(thermo, 22).await.unwrap() else {
        panic!("expected thermostat");
    };
    assert_eq!((t.mode, t.target, t.current), (ThermostatMode::Heat, 22, 19));

    // only a device report moves the current temperature
    fake.inject(&report(thermo, Command::State, [0x11, 0x00, 22, 0x00, 21, 0x00, 0, 0]))
        .await;
    let DeviceState::Thermostat(t) = wait_state(&session, thermo, |s| {
        matches!(s, DeviceState::Thermostat(t) if t.current == 21)
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(t.target, 22);

    let err = session.set_target_temperature(thermo, 60).await.unwrap_err();
    assert!(matches!(err, KocomError::InvalidTransition { .. }));
    assert_eq!(fake.received().len(), 1);
}

#[tokio::test]
async fn test_gas_valve_close_and_reopen() {
    let fake = FakeEw11::start(Duration::ZERO, echo()).await;
    let gas = DeviceAddress::gas_valve();
    let session = Session::start(config(fake.port, DeviceMap::new().with_gas_valve())).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let DeviceState::GasValve(v) = session.close_valve().await.unwrap() else {
        panic!("expected gas valve");
    };
    assert_eq!(v.position, ValvePosition::Closed);
    let sent = fake.received();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, Command::Lock);
    assert_eq!(sent[0].value, [0; 8]);

    // already closed: succeeds without touching the bus
    let again = session.close_valve().await.unwrap();
    assert!(!again.is_on());
    assert!(matches!(
        session.turn_on(gas).await,
        Err(KocomError::InvalidTransition { .. })
    ));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.received().len(), 1);
}

#[tokio::test]
async fn test_commands_to_one_device_are_serialized() {
    let fake = FakeEw11::start(Duration::from_millis(80), echo()).await;
    let light = DeviceAddress::light(0);
    let session = Session::start(config(fake.port, DeviceMap::new().with_light(0, 2))).unwrap();
    session.wait_connected(WAIT).await.unwrap();
    fake.inject(&report(light, Command::State, [0; 8])).await;
    wait_state(&session, light, |_| true).await;

    let (first, second) = tokio::join!(
        session.turn_on_channel(light, 0),
        session.turn_on_channel(light, 1)
    );
    first.unwrap();
    second.unwrap();
    let Some(DeviceState::Light(s)) = session.current_state(light).await.unwrap() else {
        panic!("expected light");
    };
    assert!(s.is_on(0) && s.is_on(1));
    assert_eq!(fake.log(), vec!["rx", "ack", "rx", "ack"]);
}

#[tokio::test]
async fn test_unsynchronized_device_is_queried_before_command() {
    // queries answer "heating on, 20°C" and "channel 0 on"; state changes are echoed
    let responder: Responder = Arc::new(|p: &Packet| {
        if p.is_ack() {
            return None;
        }
        let value = match (p.command, p.dst.class) {
            (Command::Query, DeviceClass::Thermostat) => {
                [0x11, 0x00, 20, 0x00, 19, 0x00, 0, 0]
            }
            (Command::Query, _) => [0xFF, 0, 0, 0, 0, 0, 0, 0],
            _ => p.value,
        };
        Some(Packet::ack_for(p, value))
    });
    let fake = FakeEw11::start(Duration::ZERO, responder).await;
    let thermo = DeviceAddress::thermostat(0);
    let light = DeviceAddress::light(0);
    let devices = DeviceMap::new().with_thermostat(0).with_light(0, 2);
    let session = Session::start(config(fake.port, devices)).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let DeviceState::Thermostat(t) = session.set_target_temperature(thermo, 22).await.unwrap() else {
        panic!("expected thermostat");
    };
    assert_eq!((t.mode, t.target, t.current), (ThermostatMode::Heat, 22, 19));

    let DeviceState::Light(l) = session.turn_on_channel(light, 1).await.unwrap() else {
        panic!("expected light");
    };
    assert!(l.is_on(0) && l.is_on(1));

    let sent = fake.received();
    let commands: Vec<(DeviceAddress, Command)> = sent.iter().map(|p| (p.dst, p.command)).collect();
    assert_eq!(
        commands,
        vec![
            (thermo, Command::Query),
            (thermo, Command::State),
            (light, Command::Query),
            (light, Command::State),
        ]
    );
    // heating stays enabled while the setpoint changes
    assert_eq!(sent[1].value[..3], [0x11, 0x00, 22]);
    assert_eq!(sent[3].value[..2], [0xFF, 0xFF]);

    // once synchronized no further query is needed
    session.set_target_temperature(thermo, 23).await.unwrap();
    assert_eq!(fake.received().len(), 5);
}

#[tokio::test]
async fn test_unsynchronized_device_without_answer_is_left_alone() {
    let fake = FakeEw11::start(Duration::ZERO, silent()).await;
    let thermo = DeviceAddress::thermostat(0);
    let session = Session::start(config(fake.port, DeviceMap::new().with_thermostat(0))).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let err = session.set_target_temperature(thermo, 22).await.unwrap_err();
    assert!(matches!(err, KocomError::CommandTimeout { .. }), "got {:?}", err);
    assert!(fake.received().iter().all(|p| p.command == Command::Query));
}

#[tokio::test]
async fn test_unacknowledged_command_times_out_after_three_sends() {
    let fake = FakeEw11::start(Duration::ZERO, silent()).await;
    let fan = DeviceAddress::ventilator();
    let session = Session::start(config(fake.port, DeviceMap::new().with_ventilator())).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let err = session.turn_on(fan).await.unwrap_err();
    assert!(matches!(err, KocomError::CommandTimeout { attempts: 3, .. }));
    assert!(err.is_retryable());

    let types: Vec<u8> = fake.received().iter().map(|p| p.type_byte()).collect();
    assert_eq!(types, vec![0xBC, 0xBD, 0xBE]);
    assert_eq!(session.current_state(fan).await.unwrap(), None);
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let fake = FakeEw11::start(Duration::ZERO, echo()).await;
    let light = DeviceAddress::light(1);
    let session = Session::start(config(fake.port, DeviceMap::new().with_light(1, 1))).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    let good = codec::encode(&report(light, Command::State, [0xFF, 0, 0, 0, 0, 0, 0, 0]));
    let mut corrupt = good;
    corrupt[18] = corrupt[18].wrapping_add(1);
    let mut bytes = vec![0x13, 0x37, 0xAA];
    bytes.extend_from_slice(&corrupt);
    bytes.extend_from_slice(&good);
    fake.inject_raw(&bytes).await;

    let state = wait_state(&session, light, |s| s.is_on()).await;
    assert!(matches!(state, DeviceState::Light(_)));
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_drop_fails_command_and_refresh_repopulates() {
    // queries are answered with "both channels on", state changes are never acked
    let responder: Responder = Arc::new(|p: &Packet| match p.command {
        Command::Query if !p.is_ack() => Some(Packet::ack_for(p, [0xFF, 0xFF, 0, 0, 0, 0, 0, 0])),
        _ => None,
    });
    let fake = FakeEw11::start(Duration::ZERO, responder).await;
    let light = DeviceAddress::light(0);
    let mut cfg = config(fake.port, DeviceMap::new().with_light(0, 2));
    cfg.refresh_on_connect = true;
    cfg.ack_timeout_ms = 1000;
    let session = Arc::new(Session::start(cfg).unwrap());
    let mut events = session.subscribe();

    wait_state(&session, light, |s| s.is_on()).await;

    let s = session.clone();
    let command = tokio::spawn(async move { s.turn_off(light).await });
    timeout(WAIT, async {
        while !fake.received().iter().any(|p| p.command == Command::State) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    fake.drop_connection().await;

    let err = command.await.unwrap().unwrap_err();
    assert!(matches!(err, KocomError::Disconnected), "got {:?}", err);

    wait_event(&mut events, |e| *e == SessionEvent::Disconnected).await;
    wait_event(&mut events, |e| *e == SessionEvent::Connected).await;
    wait_event(&mut events, |e| matches!(e, SessionEvent::StateChanged { .. })).await;
    assert!(session.current_state(light).await.unwrap().unwrap().is_on());
}

#[tokio::test]
async fn test_unknown_device_and_shutdown() {
    let fake = FakeEw11::start(Duration::ZERO, echo()).await;
    let session = Session::start(config(fake.port, DeviceMap::new().with_light(0, 1))).unwrap();
    session.wait_connected(WAIT).await.unwrap();

    assert!(matches!(
        session.turn_on(DeviceAddress::light(5)).await,
        Err(KocomError::UnknownDevice(_))
    ));
    assert!(matches!(
        session.set_mode(DeviceAddress::thermostat(0), ThermostatMode::Away).await,
        Err(KocomError::UnknownDevice(_))
    ));
    assert!(matches!(
        session.refresh(DeviceAddress::ventilator()).await,
        Err(KocomError::UnknownDevice(_))
    ));
    let devices = session.devices().await;
    assert_eq!(devices, vec![(DeviceAddress::light(0), None)]);

    session.shutdown().await;
    assert!(matches!(
        session.turn_on(DeviceAddress::light(0)).await,
        Err(KocomError::Cancelled)
    ));
}

#[tokio::test]
async fn test_shared_session_shutdown_cancels_in_flight_command() {
    let fake = FakeEw11::start(Duration::ZERO, silent()).await;
    let fan = DeviceAddress::ventilator();
    let mut cfg = config(fake.port, DeviceMap::new().with_ventilator());
    cfg.ack_timeout_ms = 5000;
    let session = Arc::new(Session::start(cfg).unwrap());
    session.wait_connected(WAIT).await.unwrap();

    let s = session.clone();
    let command = tokio::spawn(async move { s.turn_on(fan).await });
    timeout(WAIT, async {
        while fake.received().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // the command task still holds a reference
    assert_eq!(Arc::strong_count(&session), 2);
    session.shutdown().await;

    let err = timeout(WAIT, command).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, KocomError::Cancelled), "got {:?}", err);

    assert!(matches!(session.turn_off(fan).await, Err(KocomError::Cancelled)));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.received().len(), 1);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let empty = SessionConfig::builder().host("127.0.0.1").build();
    assert!(matches!(
        Session::start(empty),
        Err(KocomError::InvalidConfig(_))
    ));
}
