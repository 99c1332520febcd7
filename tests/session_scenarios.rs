//! End-to-end lifecycle scenarios against the simulated transport.

use std::sync::Arc;
use std::time::Duration;
use futures::channel::mpsc::Receiver;
use futures::StreamExt;
use tokio::time::timeout;

use inhaler_link::device::constants::{make_inhaler_string_uuid, COMMAND_START, DEVICE_NAME};
use inhaler_link::device::control::SessionControl;
use inhaler_link::device::events::EventBus;
use inhaler_link::device::session::SessionSettings;
use inhaler_link::device::simulated::SimulatedTransport;
use inhaler_link::device::types::{ControlCommand, DeviceEvent, SessionState};
use inhaler_link::error::{ControlError, SessionError};

const ADDRESS: &str = "F0:0D:F0:0D:F0:0D";

fn control(transport: &SimulatedTransport) -> (SessionControl<SimulatedTransport>, Receiver<DeviceEvent>) {
    let events = EventBus::new(64);
    let receiver = events.subscribe();
    let control = SessionControl::new(Arc::new(transport.clone()), SessionSettings::default(), events);
    (control, receiver)
}

fn drain(receiver: &mut Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = receiver.try_next() {
        events.push(event);
    }
    events
}

// reads events until one matches, returning everything read
async fn read_until(receiver: &mut Receiver<DeviceEvent>, done: impl Fn(&DeviceEvent) -> bool) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.next().await {
        let stop = done(&event);
        events.push(event);
        if stop {
            break;
        }
    }
    events
}

fn states(events: &[DeviceEvent]) -> Vec<SessionState> {
    events.iter().filter_map(|event| match event {
        DeviceEvent::StateChanged(snapshot) => Some(snapshot.state),
        _ => None,
    }).collect()
}

fn is_data(event: &DeviceEvent) -> bool {
    matches!(event, DeviceEvent::DataReceived { .. })
}

async fn wait_for(control: &SessionControl<SimulatedTransport>, state: SessionState) {
    let mut handle = control.handle().expect("no session was started");
    handle.wait_for(state).await.expect("session ended before reaching the state");
}

#[tokio::test(start_paused = true)]
async fn device_not_found_fails_without_events() {
    let transport = SimulatedTransport::new();
    transport.advertise("SomethingElse", ADDRESS, Duration::from_secs(1));
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    assert_eq!(control.join().await, Some(SessionState::Failed));

    let events = drain(&mut receiver);
    assert_eq!(states(&events), vec![SessionState::Scanning, SessionState::Failed]);
    assert!(!events.iter().any(|event| *event == DeviceEvent::Connected || is_data(event)));
    assert_eq!(events.last(), Some(&DeviceEvent::Failed(SessionError::DiscoveryTimeout)));
    assert_eq!(SessionError::DiscoveryTimeout.to_string(), "device not found");
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn connected_fires_once_before_any_data() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::from_millis(300));
    // pushed before the subscription exists, delivered right after it
    transport.notify(b"11.0");
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    transport.notify(b"11.5");

    let mut events = read_until(&mut receiver, is_data).await;
    events.extend(read_until(&mut receiver, is_data).await);

    let connected: Vec<usize> = events.iter().enumerate()
        .filter(|(_, event)| **event == DeviceEvent::Connected)
        .map(|(i, _)| i)
        .collect();
    let first_data = events.iter().position(is_data).unwrap();

    assert_eq!(connected.len(), 1);
    assert!(connected[0] < first_data);

    control.stop().unwrap();
    assert_eq!(control.join().await, Some(SessionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn notifications_keep_order_and_bad_bytes_become_decode_errors() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO);
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;

    transport.notify(b"12.5");
    transport.notify(b"13.0");
    transport.notify(b"INVALID\xFF");

    let events = read_until(&mut receiver, |event| matches!(event, DeviceEvent::DecodeError { .. })).await;
    let payloads: Vec<&DeviceEvent> = events.iter()
        .filter(|event| matches!(event, DeviceEvent::DataReceived { .. } | DeviceEvent::DecodeError { .. }))
        .collect();

    assert_eq!(payloads, vec![
        &DeviceEvent::DataReceived { raw: b"12.5".to_vec(), text: "12.5".to_string() },
        &DeviceEvent::DataReceived { raw: b"13.0".to_vec(), text: "13.0".to_string() },
        &DeviceEvent::DecodeError { raw: b"INVALID\xFF".to_vec() },
    ]);

    // the session shrugs it off
    transport.notify(b"13.5");
    let events = read_until(&mut receiver, is_data).await;
    assert_eq!(events.last(), Some(&DeviceEvent::DataReceived { raw: b"13.5".to_vec(), text: "13.5".to_string() }));
    assert_eq!(control.state(), SessionState::Running);

    control.stop().unwrap();
    control.join().await;
}

#[tokio::test(start_paused = true)]
async fn stop_while_scanning_cancels_the_scan() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::from_secs(4));
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Scanning).await;
    control.stop().unwrap();

    assert_eq!(control.join().await, Some(SessionState::Idle));
    assert_eq!(transport.cancelled_scan_count(), 1);
    assert_eq!(transport.connect_count(), 0);

    let events = drain(&mut receiver);
    assert_eq!(states(&events), vec![SessionState::Scanning, SessionState::Stopping, SessionState::Idle]);
}

#[tokio::test(start_paused = true)]
async fn stop_while_running_tears_down_within_a_poll_interval() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO);
    let (mut control, _receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    control.apply(ControlCommand::Stop).await.unwrap();

    let end = timeout(SessionSettings::default().poll_interval, control.join()).await;

    assert_eq!(end, Ok(Some(SessionState::Idle)));
    assert_eq!(transport.unsubscribe_count(), 1);
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!transport.is_subscribed());
}

#[tokio::test(start_paused = true)]
async fn control_write_is_rejected_unless_running() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::from_secs(2));
    let (mut control, _receiver) = control(&transport);

    assert_eq!(control.send_start().await, Err(ControlError::NotReady));

    control.start().unwrap();
    wait_for(&control, SessionState::Scanning).await;
    assert_eq!(control.send_control_write(b"START").await, Err(ControlError::NotReady));

    wait_for(&control, SessionState::Running).await;
    control.send_start().await.unwrap();

    control.stop().unwrap();
    control.join().await;
    assert_eq!(control.send_start().await, Err(ControlError::NotReady));

    assert_eq!(transport.writes(), vec![(make_inhaler_string_uuid(), b"START".to_vec())]);
}

#[tokio::test(start_paused = true)]
async fn failed_write_keeps_the_session_running() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO).fail_write("not writable");
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;

    let result = control.apply(ControlCommand::SendControlWrite(b"START".to_vec())).await;

    assert!(matches!(result, Err(ControlError::Write { .. })));
    assert_eq!(control.state(), SessionState::Running);
    let events = read_until(&mut receiver, |event| matches!(event, DeviceEvent::WriteFailed(_))).await;
    assert!(!events.iter().any(|event| matches!(event, DeviceEvent::Failed(_))));

    control.stop().unwrap();
    assert_eq!(control.join().await, Some(SessionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn device_is_only_known_while_connected() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::from_millis(50));
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    control.stop().unwrap();
    control.join().await;

    // and once more for a session that fails after connecting
    transport.fail_subscribe("characteristic missing");
    control.start().unwrap();
    assert_eq!(control.join().await, Some(SessionState::Failed));

    let snapshots: Vec<_> = drain(&mut receiver).into_iter().filter_map(|event| match event {
        DeviceEvent::StateChanged(snapshot) => Some(snapshot),
        _ => None,
    }).collect();

    assert!(!snapshots.is_empty());
    for snapshot in snapshots {
        if snapshot.device.is_some() {
            assert!(snapshot.state.may_hold_device(), "{:?} holds a device", snapshot.state);
        }
        if matches!(snapshot.state, SessionState::Idle | SessionState::Scanning | SessionState::Failed) {
            assert_eq!(snapshot.device, None);
        }
        if snapshot.state == SessionState::Running {
            assert_eq!(snapshot.device.map(|device| device.address), Some(ADDRESS.to_string()));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn start_is_only_accepted_when_no_session_is_active() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO);
    let (mut control, _receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    assert_eq!(control.start(), Err(ControlError::InvalidState { state: SessionState::Running }));

    control.stop().unwrap();
    control.join().await;

    // a fresh session goes through discovery again
    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    assert_eq!(transport.scan_count(), 2);

    control.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_session_rejects_stop_but_allows_a_new_start() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO).fail_connect("device unreachable");
    let (mut control, _receiver) = control(&transport);

    control.start().unwrap();
    assert_eq!(control.join().await, Some(SessionState::Failed));

    assert_eq!(control.stop(), Err(ControlError::InvalidState { state: SessionState::Failed }));
    assert_eq!(control.start(), Ok(()));
    assert_eq!(control.join().await, Some(SessionState::Failed));
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn lost_link_moves_the_session_to_failed() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO);
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    transport.drop_link();

    assert_eq!(control.join().await, Some(SessionState::Failed));
    let events = drain(&mut receiver);
    assert!(matches!(events.last(), Some(DeviceEvent::Failed(SessionError::TransportFault { .. }))));
    assert_eq!(control.send_start().await, Err(ControlError::NotReady));
}

#[tokio::test(start_paused = true)]
async fn stop_does_not_wait_for_a_slow_connection_check() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO).set_status_delay(Duration::from_millis(1900));
    let (mut control, _receiver) = control(&transport);
    let poll_interval = SessionSettings::default().poll_interval;

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    // the first keep-alive check is now in flight
    tokio::time::sleep(poll_interval + poll_interval / 2).await;
    control.stop().unwrap();

    let end = timeout(poll_interval, control.join()).await;

    assert_eq!(end, Ok(Some(SessionState::Idle)));
    assert_eq!(transport.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_right_after_stop_waits_for_the_old_session() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO);
    let (mut control, mut receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    control.stop().unwrap();

    // the old task has not wound down yet
    assert_eq!(control.start(), Err(ControlError::InvalidState { state: SessionState::Running }));

    control.apply(ControlCommand::Start).await.unwrap();
    wait_for(&control, SessionState::Running).await;

    let events = drain(&mut receiver);
    assert_eq!(states(&events), vec![
        SessionState::Scanning,
        SessionState::Connecting,
        SessionState::Subscribed,
        SessionState::Running,
        SessionState::Stopping,
        SessionState::Idle,
        SessionState::Scanning,
        SessionState::Connecting,
        SessionState::Subscribed,
        SessionState::Running,
    ]);

    control.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn new_session_command_writes_start() {
    let transport = SimulatedTransport::new();
    transport.advertise(DEVICE_NAME, ADDRESS, Duration::ZERO);
    let (mut control, _receiver) = control(&transport);

    control.start().unwrap();
    wait_for(&control, SessionState::Running).await;
    control.send_start().await.unwrap();
    control.shutdown().await;

    assert_eq!(transport.writes(), vec![(make_inhaler_string_uuid(), COMMAND_START.to_vec())]);
}
