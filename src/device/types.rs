use std::fmt;

use crate::error::{SessionError, TransportError};

/// A discovered peripheral. `address` is whatever the transport needs to find it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Subscribed,
    Running,
    Stopping,
    Failed,
}

impl SessionState {
    /// States in which a session is allowed to know its device.
    pub fn may_hold_device(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Subscribed | SessionState::Running | SessionState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == SessionState::Failed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub device: Option<DeviceHandle>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionSnapshot { state: SessionState::Idle, device: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StateChanged(SessionSnapshot),
    Connected,
    DataReceived { raw: Vec<u8>, text: String },
    DecodeError { raw: Vec<u8> },
    WriteFailed(TransportError),
    Failed(SessionError),
}

impl DeviceEvent {
    /// One notification is one message; anything that is not utf-8 is reported, not repaired.
    pub fn from_notification(raw: Vec<u8>) -> DeviceEvent {
        match String::from_utf8(raw) {
            Ok(text) => {
                let raw = text.as_bytes().to_vec();
                DeviceEvent::DataReceived { raw, text }
            },
            Err(err) => DeviceEvent::DecodeError { raw: err.into_bytes() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    SendControlWrite(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_decodes_text() {
        let event = DeviceEvent::from_notification(b"12.5".to_vec());
        assert_eq!(event, DeviceEvent::DataReceived { raw: b"12.5".to_vec(), text: "12.5".to_string() });
    }

    #[test]
    fn notification_keeps_raw_bytes_on_decode_error() {
        let event = DeviceEvent::from_notification(b"INVALID\xFF".to_vec());
        assert_eq!(event, DeviceEvent::DecodeError { raw: b"INVALID\xFF".to_vec() });
    }

    #[test]
    fn only_connected_states_hold_a_device() {
        let holding: Vec<SessionState> = [
            SessionState::Idle,
            SessionState::Scanning,
            SessionState::Connecting,
            SessionState::Subscribed,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Failed,
        ].into_iter().filter(|s| s.may_hold_device()).collect();

        assert_eq!(holding, vec![
            SessionState::Connecting,
            SessionState::Subscribed,
            SessionState::Running,
            SessionState::Stopping,
        ]);
    }
}
