use std::sync::Arc;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::events::EventBus;
use crate::device::transport::{NotificationStream, Transport};
use crate::device::types::{DeviceEvent, DeviceHandle, SessionSnapshot, SessionState};
use crate::error::{ControlError, SessionError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub device_name: String,
    pub scan_timeout: Duration,
    pub poll_interval: Duration,
    pub data_characteristic: Uuid,
    pub control_characteristic: Uuid,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        SessionSettings {
            device_name: config.device_name.clone(),
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            data_characteristic: config.data_characteristic,
            control_characteristic: config.control_characteristic,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings::from(&Config::default())
    }
}

/// Permission to write to the peripheral, handed out while a session is Running.
pub struct ControlWriter<T: Transport> {
    transport: Arc<T>,
    connection: T::Connection,
    characteristic: Uuid,
    revoked: CancellationToken,
    events: EventBus,
}

impl<T: Transport> Clone for ControlWriter<T> {
    fn clone(&self) -> Self {
        ControlWriter {
            transport: self.transport.clone(),
            connection: self.connection.clone(),
            characteristic: self.characteristic,
            revoked: self.revoked.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T: Transport> ControlWriter<T> {
    pub fn is_valid(&self) -> bool {
        !self.revoked.is_cancelled()
    }

    /// A failed write is reported and returned, the session keeps running.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ControlError> {
        if !self.is_valid() {
            return Err(ControlError::NotReady);
        }

        match self.transport.write(&self.connection, self.characteristic, bytes).await {
            Ok(()) => {
                info!("Sent: {}", String::from_utf8_lossy(bytes));
                Ok(())
            },
            Err(err) => {
                warn!("Failed to send {:?}: {}", String::from_utf8_lossy(bytes), err);
                self.events.publish(DeviceEvent::WriteFailed(err.clone()));
                Err(err.into())
            },
        }
    }
}

/// The side of a session that other tasks get to see.
pub struct SessionHandle<T: Transport> {
    cancel: CancellationToken,
    snapshot: watch::Receiver<SessionSnapshot>,
    writer: watch::Receiver<Option<ControlWriter<T>>>,
}

impl<T: Transport> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        SessionHandle {
            cancel: self.cancel.clone(),
            snapshot: self.snapshot.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<T: Transport> SessionHandle<T> {
    /// Cooperative: the session notices at its next suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn writer(&self) -> Option<ControlWriter<T>> {
        let writer = self.writer.borrow();
        (*writer).clone().filter(|writer| writer.is_valid())
    }

    /// Resolves once the session reaches `state`; `None` if the session ended without doing so.
    pub async fn wait_for(&mut self, state: SessionState) -> Option<SessionSnapshot> {
        match self.snapshot.wait_for(|snapshot| snapshot.state == state).await {
            Ok(snapshot) => Some(snapshot.clone()),
            Err(_) => None,
        }
    }
}

enum Step<C> {
    Scan,
    Connect { handle: DeviceHandle },
    Subscribe { connection: C },
    Run { connection: C, notifications: NotificationStream },
    Stop { connection: Option<C>, subscribed: bool },
    Fail { connection: Option<C>, subscribed: bool, reason: SessionError },
    Finished,
}

/// One attempt at the Idle -> Scanning -> Connecting -> Subscribed -> Running -> Stopping -> Idle
/// lifecycle. Consumed by [`DeviceSession::run`], a new attempt needs a new session.
pub struct DeviceSession<T: Transport> {
    state: SessionState,
    device: Option<DeviceHandle>,
    // cooperative stop flag, goes from true to false once
    running: bool,
    transport: Arc<T>,
    settings: SessionSettings,
    events: EventBus,
    cancel: CancellationToken,
    snapshot: watch::Sender<SessionSnapshot>,
    writer: watch::Sender<Option<ControlWriter<T>>>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: Arc<T>, settings: SessionSettings, events: EventBus) -> (Self, SessionHandle<T>) {
        let cancel = CancellationToken::new();
        let (snapshot_sender, snapshot_receiver) = watch::channel(SessionSnapshot::default());
        let (writer_sender, writer_receiver) = watch::channel(None);

        let session = DeviceSession {
            state: SessionState::Idle,
            device: None,
            running: true,
            transport,
            settings,
            events,
            cancel: cancel.clone(),
            snapshot: snapshot_sender,
            writer: writer_sender,
        };

        let handle = SessionHandle {
            cancel,
            snapshot: snapshot_receiver,
            writer: writer_receiver,
        };

        (session, handle)
    }

    /// Drives the session until it is stopped (Idle) or gives up (Failed).
    pub async fn run(mut self) -> SessionState {
        let mut step = Step::Scan;

        loop {
            step = match step {
                Step::Finished => break,
                step => self.advance(step).await,
            };
        }

        self.state
    }

    fn stop_requested(&mut self) -> bool {
        if self.running && self.cancel.is_cancelled() {
            info!("Stop requested");
            self.running = false;
        }

        !self.running
    }

    fn transition(&mut self, state: SessionState) {
        if !state.may_hold_device() {
            self.device = None;
        }
        self.state = state;

        info!("Session {}", state);
        let snapshot = SessionSnapshot { state, device: self.device.clone() };
        self.snapshot.send_replace(snapshot.clone());
        self.events.publish(DeviceEvent::StateChanged(snapshot));
    }

    fn grant_writer(&self, connection: &T::Connection) {
        let writer = ControlWriter {
            transport: self.transport.clone(),
            connection: connection.clone(),
            characteristic: self.settings.control_characteristic,
            revoked: CancellationToken::new(),
            events: self.events.clone(),
        };
        self.writer.send_replace(Some(writer));
    }

    fn revoke_writer(&self) {
        if let Some(writer) = self.writer.send_replace(None) {
            writer.revoked.cancel();
        }
    }

    fn dispatch_notification(&self, raw: Vec<u8>) {
        let event = DeviceEvent::from_notification(raw);

        match &event {
            DeviceEvent::DecodeError { raw } => warn!("Dropping notification that is not utf-8: {:?}", raw),
            _ => debug!("Notification: {:?}", event),
        }

        self.events.publish(event);
    }

    async fn teardown(&mut self, connection: Option<T::Connection>, subscribed: bool) {
        self.revoke_writer();

        if let Some(connection) = connection {
            if subscribed {
                match self.transport.unsubscribe(&connection, self.settings.data_characteristic).await {
                    Ok(()) => info!("Stopped notifications."),
                    Err(err) => warn!("Failed to stop notifications: {}", err),
                }
            }

            self.transport.disconnect(&connection).await;
            info!("Disconnected");
        }
    }

    async fn advance(&mut self, step: Step<T::Connection>) -> Step<T::Connection> {
        match step {
            Step::Scan => {
                if self.stop_requested() {
                    return Step::Stop { connection: None, subscribed: false };
                }
                self.transition(SessionState::Scanning);

                let device_name = self.settings.device_name.clone();
                let filter = move |name: &str| name == device_name;
                let result = self.transport
                    .scan(&filter, self.settings.scan_timeout, self.cancel.clone())
                    .await;

                if self.stop_requested() {
                    return Step::Stop { connection: None, subscribed: false };
                }

                match result {
                    Ok(Some(handle)) => {
                        info!("Found device: {} ({})", handle.name, handle.address);
                        Step::Connect { handle }
                    },
                    Ok(None) => {
                        warn!("Device not found.");
                        Step::Fail { connection: None, subscribed: false, reason: SessionError::DiscoveryTimeout }
                    },
                    Err(err) => Step::Fail { connection: None, subscribed: false, reason: err.into() },
                }
            },
            Step::Connect { handle } => {
                self.device = Some(handle.clone());
                self.transition(SessionState::Connecting);

                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = self.transport.connect(&handle) => Some(result),
                };

                match result {
                    None => {
                        self.stop_requested();
                        self.transport.abort_connect(&handle).await;
                        Step::Stop { connection: None, subscribed: false }
                    },
                    Some(Err(err)) => Step::Fail { connection: None, subscribed: false, reason: err.into() },
                    Some(Ok(connection)) => {
                        info!("Connected!");
                        self.transition(SessionState::Subscribed);
                        self.events.publish(DeviceEvent::Connected);
                        Step::Subscribe { connection }
                    },
                }
            },
            Step::Subscribe { connection } => {
                if self.stop_requested() {
                    return Step::Stop { connection: Some(connection), subscribed: false };
                }

                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = self.transport.subscribe(&connection, self.settings.data_characteristic) => Some(result),
                };

                let result = match result {
                    Some(result) => result,
                    None => {
                        self.stop_requested();
                        return Step::Stop { connection: Some(connection), subscribed: false };
                    },
                };

                match result {
                    Ok(notifications) => {
                        info!("Started notifications.");
                        self.transition(SessionState::Running);
                        self.grant_writer(&connection);
                        Step::Run { connection, notifications }
                    },
                    Err(err) => Step::Fail { connection: Some(connection), subscribed: false, reason: err.into() },
                }
            },
            Step::Run { connection, mut notifications } => {
                let cancel = self.cancel.clone();
                let reason = 'keepalive: loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'keepalive None,
                        notification = notifications.next() => match notification {
                            Some(raw) => self.dispatch_notification(raw),
                            None => break 'keepalive Some("notification stream closed"),
                        },
                        _ = sleep(self.settings.poll_interval) => {
                            // a stop wins over a slow status check, the next iteration picks it up
                            let connected = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => true,
                                connected = self.transport.is_connected(&connection) => connected,
                            };
                            if !connected {
                                break 'keepalive Some("connection lost");
                            }
                        },
                    }
                };

                match reason {
                    None => {
                        self.stop_requested();
                        Step::Stop { connection: Some(connection), subscribed: true }
                    },
                    Some(reason) => Step::Fail {
                        connection: Some(connection),
                        subscribed: true,
                        reason: TransportError::TransportFault { reason: reason.to_string() }.into(),
                    },
                }
            },
            Step::Stop { connection, subscribed } => {
                self.transition(SessionState::Stopping);
                self.teardown(connection, subscribed).await;
                self.transition(SessionState::Idle);
                Step::Finished
            },
            Step::Fail { connection, subscribed, reason } => {
                warn!("Session failed: {}", reason);
                self.teardown(connection, subscribed).await;
                self.transition(SessionState::Failed);
                self.events.publish(DeviceEvent::Failed(reason));
                Step::Finished
            },
            Step::Finished => Step::Finished,
        }
    }
}
