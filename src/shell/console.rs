//! A line based stand-in for the training screens: commands come in on stdin, status lines and
//! readings go out on stdout.

use log::{info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::device::control::SessionControl;
use crate::device::events::EventHandlers;
use crate::device::transport::Transport;
use crate::device::types::{ControlCommand, SessionSnapshot, SessionState};
use crate::error::AppRunError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Control(ControlCommand),
    NewSession,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
start    connect to the inhaler and show live data
new      ask the inhaler to begin a new session (only while connected)
send X   write the text X to the inhaler
stop     disconnect and go back
status   show what the connection is doing
quit     stop and exit";

pub fn parse_command(line: &str) -> Option<ShellCommand> {
    let line = line.trim();
    let (word, rest) = match line.split_once(' ') {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_lowercase().as_str() {
        "start" => ShellCommand::Control(ControlCommand::Start),
        "stop" | "back" => ShellCommand::Control(ControlCommand::Stop),
        "new" | "restart" => ShellCommand::NewSession,
        "send" if !rest.is_empty() => ShellCommand::Control(ControlCommand::SendControlWrite(rest.as_bytes().to_vec())),
        "status" => ShellCommand::Status,
        "help" | "?" => ShellCommand::Help,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        _ => return None,
    };

    Some(command)
}

pub fn status_line(snapshot: &SessionSnapshot) -> String {
    let name = snapshot.device.as_ref().map(|device| device.name.as_str()).unwrap_or("inhaler");

    match snapshot.state {
        SessionState::Idle => "Type `start` to begin your training session.".to_string(),
        SessionState::Scanning => "Looking for the inhaler...".to_string(),
        SessionState::Connecting => format!("Connecting to {}...", name),
        SessionState::Subscribed => format!("Connected to {}, waiting for data...", name),
        SessionState::Running => format!("Live data from {}", name),
        SessionState::Stopping => "Disconnecting...".to_string(),
        SessionState::Failed => "Could not reach the inhaler. Type `start` to try again.".to_string(),
    }
}

pub async fn run_console<T: Transport>(mut control: SessionControl<T>, cancel: CancellationToken) -> Result<(), AppRunError> {
    let handlers = EventHandlers::new()
        .on_state_changed(|snapshot| println!("{}", status_line(snapshot)))
        .on_connected(|| println!("Connected to Inhaler! Begin shaking inhaler"))
        .on_data_received(|text| println!("{}", text))
        .on_decode_error(|raw| println!("Received {} bytes that are not text, ignoring them", raw.len()))
        .on_failed(|reason| println!("Session failed: {}", reason))
        .on_write_failed(|reason| println!("Could not send to the inhaler: {}", reason))
        .spawn(control.events(), cancel.child_token());

    println!("{}", status_line(&control.snapshot()));
    let mut lines = BufReader::new(stdin()).lines();

    'mainloop: loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break 'mainloop,
            line = lines.next_line() => line?,
        };

        let line = match line {
            Some(line) => line,
            // stdin closed
            None => break 'mainloop,
        };

        match parse_command(&line) {
            None => {
                if !line.trim().is_empty() {
                    println!("Unknown command {:?}, type `help` for a list", line.trim());
                }
            },
            Some(ShellCommand::Quit) => break 'mainloop,
            Some(ShellCommand::Help) => println!("{}", HELP),
            Some(ShellCommand::Status) => println!("{}", status_line(&control.snapshot())),
            Some(ShellCommand::NewSession) => {
                info!("Command: new session");
                if let Err(err) = control.send_start().await {
                    warn!("Command rejected: {}", err);
                    println!("{}", err);
                }
            },
            Some(ShellCommand::Control(command)) => {
                info!("Command: {:?}", command);
                if let Err(err) = control.apply(command).await {
                    warn!("Command rejected: {}", err);
                    println!("{}", err);
                }
            },
        }
    }

    if let Some(state) = control.shutdown().await {
        info!("Session ended {}", state);
    }
    cancel.cancel();

    if let Err(err) = handlers.await {
        warn!("Event handler task failed: {}", err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::DeviceHandle;

    #[test]
    fn parses_lifecycle_commands() {
        assert_eq!(parse_command("start"), Some(ShellCommand::Control(ControlCommand::Start)));
        assert_eq!(parse_command("  STOP \n"), Some(ShellCommand::Control(ControlCommand::Stop)));
        assert_eq!(parse_command("new"), Some(ShellCommand::NewSession));
        assert_eq!(parse_command("Restart"), Some(ShellCommand::NewSession));
        assert_eq!(parse_command("quit"), Some(ShellCommand::Quit));
    }

    #[test]
    fn send_needs_a_payload() {
        assert_eq!(parse_command("send  L1 "), Some(ShellCommand::Control(ControlCommand::SendControlWrite(b"L1".to_vec()))));
        assert_eq!(parse_command("send"), None);
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn status_mentions_the_device() {
        let snapshot = SessionSnapshot {
            state: SessionState::Connecting,
            device: Some(DeviceHandle { address: "AA".to_string(), name: "Nano33IoT".to_string() }),
        };

        assert_eq!(status_line(&snapshot), "Connecting to Nano33IoT...");
    }
}
