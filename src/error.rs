use std::any::Any;
use std::io;
use thiserror::Error;
use std::str::Utf8Error;

use crate::device::types::SessionState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (io): {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },
}

/// Errors raised by the host bluetooth stack. These never leave the transport adapter, they are
/// normalized into a [`TransportError`] first.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Operation took longer than {0} ms")]
    Deadline(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Scanning failed: {reason}")]
    Scan { reason: String },

    #[error("Connecting failed: {reason}")]
    ConnectError { reason: String },

    #[error("Subscribing failed: {reason}")]
    SubscribeError { reason: String },

    #[error("Writing failed: {reason}")]
    WriteError { reason: String },

    #[error("Link lost: {reason}")]
    TransportFault { reason: String },
}

/// Why a session ended up in [`SessionState::Failed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("device not found")]
    DiscoveryTimeout,

    #[error("{reason}")]
    Scan { reason: String },

    #[error("connect failed: {reason}")]
    Connect { reason: String },

    #[error("subscribe failed: {reason}")]
    Subscribe { reason: String },

    #[error("transport fault: {reason}")]
    TransportFault { reason: String },
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Scan { reason } => SessionError::Scan { reason },
            TransportError::ConnectError { reason } => SessionError::Connect { reason },
            TransportError::SubscribeError { reason } => SessionError::Subscribe { reason },
            TransportError::WriteError { reason } |
            TransportError::TransportFault { reason } => SessionError::TransportFault { reason },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("The session is not running")]
    NotReady,

    #[error("Command is not allowed while the session is {state}")]
    InvalidState { state: SessionState },

    #[error("Control write failed: {source}")]
    Write { #[from] source: TransportError },
}

pub fn readable_thread_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }

    format!("panic from session task: [{}]", stringified)
}
