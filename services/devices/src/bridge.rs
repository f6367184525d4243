//! Sidecar process connector
//!
//! Each device link is a child process that speaks the messaging protocol and
//! exchanges JSON lines with us over stdio: commands go to its stdin, events
//! come back on its stdout.

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::DeviceConfig;
use crate::protocol::{
    Credentials, DisconnectReason, ProtocolConnector, ProtocolError, ProtocolEvent,
    ProtocolHandle, ProtocolLink,
};

const EVENT_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Commands written to the sidecar's stdin
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand {
    Init {
        device_id: String,
        phone_number: String,
        credentials: Option<Credentials>,
    },
    SendText {
        chat_id: String,
        text: String,
    },
    Logout,
    Shutdown,
}

/// Spawns one sidecar per device
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    command: String,
    args: Vec<String>,
}

impl BridgeConnector {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

#[async_trait]
impl ProtocolConnector for BridgeConnector {
    async fn open(
        &self,
        device: &DeviceConfig,
        credentials: Option<Credentials>,
    ) -> Result<ProtocolLink, ProtocolError> {
        info!(
            device_id = %device.id,
            command = %self.command,
            resuming = credentials.is_some(),
            "Spawning protocol bridge"
        );

        let mut child = self.spawn_child()?;
        let stdin = child.stdin.take().ok_or(ProtocolError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(ProtocolError::ChannelClosed)?;

        let (evt_tx, evt_rx) = mpsc::channel(EVENT_BUFFER);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        cmd_tx
            .send(BridgeCommand::Init {
                device_id: device.id.clone(),
                phone_number: device.phone_number.clone(),
                credentials,
            })
            .await
            .map_err(|_| ProtocolError::ChannelClosed)?;

        tokio::spawn(run_bridge(
            device.id.clone(),
            child,
            stdin,
            stdout,
            evt_tx,
            cmd_rx,
        ));

        Ok(ProtocolLink {
            handle: Arc::new(BridgeHandle { commands: cmd_tx }),
            events: evt_rx,
        })
    }
}

/// Command side of a running sidecar
struct BridgeHandle {
    commands: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    async fn send(&self, command: BridgeCommand) -> Result<(), ProtocolError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)
    }
}

#[async_trait]
impl ProtocolHandle for BridgeHandle {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ProtocolError> {
        self.send(BridgeCommand::SendText {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        })
        .await
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.send(BridgeCommand::Logout).await
    }

    async fn shutdown(&self) {
        if self.send(BridgeCommand::Shutdown).await.is_err() {
            debug!("Protocol bridge already stopped");
        }
    }
}

/// Bridge stdio to channels until either side goes away
async fn run_bridge(
    device_id: String,
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    evt_tx: mpsc::Sender<ProtocolEvent>,
    mut cmd_rx: mpsc::Receiver<BridgeCommand>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut closed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match serde_json::from_str::<ProtocolEvent>(&line) {
                        Ok(event) => {
                            closed |= matches!(event, ProtocolEvent::Close { .. });
                            if evt_tx.send(event).await.is_err() {
                                debug!(device_id = %device_id, "Event channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(device_id = %device_id, line = %line, error = %e, "Failed to parse bridge event");
                        }
                    },
                    Ok(None) => {
                        debug!(device_id = %device_id, "Bridge stdout closed");
                        break;
                    }
                    Err(e) => {
                        error!(device_id = %device_id, error = %e, "Error reading bridge stdout");
                        break;
                    }
                }
            }

            command = cmd_rx.recv() => {
                let Some(command) = command else {
                    debug!(device_id = %device_id, "Command channel closed");
                    break;
                };
                let is_shutdown = matches!(command, BridgeCommand::Shutdown);
                if let Err(e) = write_command(&mut stdin, &command).await {
                    error!(device_id = %device_id, error = %e, "Failed to write to bridge stdin");
                    break;
                }
                if is_shutdown {
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                    closed = true;
                    break;
                }
            }

            status = child.wait() => {
                match status {
                    Ok(status) => info!(device_id = %device_id, status = %status, "Protocol bridge exited"),
                    Err(e) => error!(device_id = %device_id, error = %e, "Error waiting for protocol bridge"),
                }
                break;
            }
        }
    }

    // Drain whatever the bridge printed before exiting
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(event) = serde_json::from_str::<ProtocolEvent>(&line) {
            closed |= matches!(event, ProtocolEvent::Close { .. });
            if evt_tx.send(event).await.is_err() {
                break;
            }
        }
    }

    let _ = child.kill().await;

    if !closed {
        let _ = evt_tx
            .send(ProtocolEvent::Close {
                reason: DisconnectReason::ConnectionLost,
            })
            .await;
    }
}

async fn write_command(stdin: &mut ChildStdin, command: &BridgeCommand) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(command)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceConfig {
        DeviceConfig {
            id: "device-5511987654321".to_string(),
            name: "Pousada Mar".to_string(),
            owner_user_id: "owner-1".to_string(),
            phone_number: "5511987654321".to_string(),
            auth_path: None,
        }
    }

    fn script(body: &str) -> BridgeConnector {
        BridgeConnector::new("sh", vec!["-c".to_string(), body.to_string()])
    }

    #[test]
    fn test_commands_serialize_as_tagged_lines() {
        let json = serde_json::to_value(BridgeCommand::SendText {
            chat_id: "5511987654321@s.whatsapp.net".to_string(),
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "send_text");
        assert_eq!(json["chat_id"], "5511987654321@s.whatsapp.net");
    }

    #[tokio::test]
    async fn test_events_are_forwarded_and_exit_reports_lost_connection() {
        let connector = script(r#"read init; echo '{"type":"qr","code":"2@abc"}'"#);
        let mut link = connector.open(&device(), None).await.unwrap();

        assert_eq!(
            link.events.recv().await,
            Some(ProtocolEvent::Qr {
                code: "2@abc".to_string()
            })
        );
        assert_eq!(
            link.events.recv().await,
            Some(ProtocolEvent::Close {
                reason: DisconnectReason::ConnectionLost
            })
        );
    }

    #[tokio::test]
    async fn test_explicit_close_is_not_duplicated() {
        let connector = script(r#"read init; echo '{"type":"close","reason":"logged_out"}'"#);
        let mut link = connector.open(&device(), None).await.unwrap();

        assert_eq!(
            link.events.recv().await,
            Some(ProtocolEvent::Close {
                reason: DisconnectReason::LoggedOut
            })
        );
        assert_eq!(link.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let connector = BridgeConnector::new("/nonexistent/protocol-bridge", Vec::new());
        assert!(matches!(
            connector.open(&device(), None).await,
            Err(ProtocolError::Spawn(_))
        ));
    }
}
