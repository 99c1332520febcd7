use std::sync::Arc;
use log::{error, info};
use tokio::spawn;
use tokio::task::JoinHandle;

use crate::device::constants::COMMAND_START;
use crate::device::events::EventBus;
use crate::device::session::{DeviceSession, SessionHandle, SessionSettings};
use crate::device::transport::Transport;
use crate::device::types::{ControlCommand, SessionSnapshot, SessionState};
use crate::error::{readable_thread_panic_error, ControlError};

struct ActiveSession<T: Transport> {
    handle: SessionHandle<T>,
    // taken by `join`
    task: Option<JoinHandle<SessionState>>,
}

impl<T: Transport> ActiveSession<T> {
    // only a finished task is done, a stopping session still publishes its last events
    fn is_done(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    fn is_winding_down(&self) -> bool {
        self.handle.is_stop_requested() || self.handle.state().is_terminal()
    }
}

/// Entry point for the presentation layer: validates commands against the state of the current
/// session and applies them. Every `start` runs a brand new [`DeviceSession`].
pub struct SessionControl<T: Transport> {
    transport: Arc<T>,
    settings: SessionSettings,
    events: EventBus,
    active: Option<ActiveSession<T>>,
}

impl<T: Transport> SessionControl<T> {
    pub fn new(transport: Arc<T>, settings: SessionSettings, events: EventBus) -> Self {
        SessionControl {
            transport,
            settings,
            events,
            active: None,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        match &self.active {
            Some(active) => active.handle.snapshot(),
            None => SessionSnapshot::default(),
        }
    }

    pub fn handle(&self) -> Option<SessionHandle<T>> {
        self.active.as_ref().map(|active| active.handle.clone())
    }

    pub fn start(&mut self) -> Result<(), ControlError> {
        if let Some(active) = &self.active {
            if !active.is_done() {
                return Err(ControlError::InvalidState { state: active.handle.state() });
            }
        }

        let (session, handle) = DeviceSession::new(self.transport.clone(), self.settings.clone(), self.events.clone());
        info!("Starting a new session");
        let task = spawn(session.run());

        self.active = Some(ActiveSession { handle, task: Some(task) });
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ControlError> {
        let active = match &self.active {
            // nothing is running, which is the same as idle
            None => return Ok(()),
            Some(active) => active,
        };

        let state = active.handle.state();
        if state.is_terminal() {
            return Err(ControlError::InvalidState { state });
        }

        active.handle.stop();
        Ok(())
    }

    pub async fn send_control_write(&self, bytes: &[u8]) -> Result<(), ControlError> {
        let writer = self.active
            .as_ref()
            .filter(|active| active.handle.state() == SessionState::Running)
            .and_then(|active| active.handle.writer())
            .ok_or(ControlError::NotReady)?;

        writer.write(bytes).await
    }

    /// Ask the peripheral to begin a new measurement.
    pub async fn send_start(&self) -> Result<(), ControlError> {
        self.send_control_write(COMMAND_START).await
    }

    pub async fn apply(&mut self, command: ControlCommand) -> Result<(), ControlError> {
        match command {
            ControlCommand::Start => {
                self.settle().await;
                self.start()
            },
            ControlCommand::Stop => self.stop(),
            ControlCommand::SendControlWrite(bytes) => self.send_control_write(&bytes).await,
        }
    }

    // lets a session that is already on its way out finish, so a new one can start cleanly
    async fn settle(&mut self) {
        let winding_down = self.active.as_ref().map_or(false, |active| active.is_winding_down());
        if winding_down {
            self.join().await;
        }
    }

    /// Wait for the current session to end, returning the state it ended in.
    pub async fn join(&mut self) -> Option<SessionState> {
        let active = self.active.as_mut()?;
        let task = match active.task.take() {
            Some(task) => task,
            None => return Some(active.handle.state()),
        };

        match task.await {
            Ok(state) => Some(state),
            Err(err) => {
                if err.is_panic() {
                    error!("{}", readable_thread_panic_error(&err.into_panic()));
                } else {
                    error!("Session task was cancelled");
                }
                Some(SessionState::Failed)
            },
        }
    }

    pub async fn shutdown(&mut self) -> Option<SessionState> {
        if let Some(active) = &self.active {
            active.handle.stop();
        }
        self.join().await
    }
}
