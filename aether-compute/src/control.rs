//! Clients for QEMU's two control channels: the QMP monitor and the guest
//! agent. Both speak newline-delimited JSON over a Unix socket.
//!
//! Every read and write is bounded by the timeout given at connect time.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aether_core::VmId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::HostConfig;

/// Errors from a control channel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ControlError {
    /// Nobody is listening on the socket, or the peer never answered.
    #[error("control socket {} unavailable: {reason}", .path.display())]
    Unavailable { path: PathBuf, reason: String },

    /// A read or write did not finish in time.
    #[error("no answer on {} within {}ms", .path.display(), .after.as_millis())]
    Timeout { path: PathBuf, after: Duration },

    /// The peer rejected a command.
    #[error("{class}: {desc}")]
    Command { class: String, desc: String },

    /// The peer sent something that is not the expected protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ControlError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn map_connect_error(path: &Path, err: io::Error) -> ControlError {
    match err.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied => ControlError::Unavailable {
            path: path.to_owned(),
            reason: err.to_string(),
        },
        _ => ControlError::Io(err),
    }
}

/// A JSON-lines connection with a per-operation deadline.
struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    path: PathBuf,
    timeout: Duration,
}

impl Channel {
    async fn connect(path: &Path, timeout: Duration) -> Result<Self, ControlError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ControlError::Timeout {
                path: path.to_owned(),
                after: timeout,
            })?
            .map_err(|e| map_connect_error(path, e))?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            path: path.to_owned(),
            timeout,
        })
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ControlError> {
        let timeout = self.timeout;
        let path = self.path.clone();
        let writer = &mut self.writer;
        tokio::time::timeout(timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ControlError::Timeout { path, after: timeout })?
        .map_err(ControlError::Io)
    }

    async fn send(&mut self, message: &Value) -> Result<(), ControlError> {
        let mut line = message.to_string();
        line.push('\n');
        tracing::trace!(socket = %self.path.display(), message = %line.trim_end(), "control send");
        self.write_raw(line.as_bytes()).await
    }

    /// Read the next non-empty line. Invalid UTF-8 is replaced, not rejected.
    async fn read_line(&mut self) -> Result<String, ControlError> {
        let timeout = self.timeout;
        let path = self.path.clone();
        let reader = &mut self.reader;
        tokio::time::timeout(timeout, async {
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let n = reader.read_until(b'\n', &mut buf).await?;
                if n == 0 {
                    return Err(ControlError::Protocol("connection closed".to_owned()));
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_matches(|c: char| c.is_whitespace() || c == '\u{fffd}');
                if !line.is_empty() {
                    return Ok(line.to_owned());
                }
            }
        })
        .await
        .map_err(|_| ControlError::Timeout { path, after: timeout })?
    }

    async fn recv(&mut self) -> Result<Value, ControlError> {
        let line = self.read_line().await?;
        tracing::trace!(socket = %self.path.display(), message = %line, "control recv");
        serde_json::from_str(&line).map_err(|e| ControlError::Protocol(format!("invalid JSON: {e}")))
    }

    /// Send one command and wait for its result, skipping asynchronous events.
    async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, ControlError> {
        let mut message = json!({ "execute": command });
        if let Some(arguments) = arguments {
            message["arguments"] = arguments;
        }
        self.send(&message).await?;
        loop {
            let mut reply = self.recv().await?;
            if let Some(ret) = reply.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(error) = reply.get("error") {
                let field = |key: &str| {
                    error
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned()
                };
                return Err(ControlError::Command {
                    class: field("class"),
                    desc: field("desc"),
                });
            }
            if reply.get("event").is_none() {
                return Err(ControlError::Protocol(format!("unexpected message: {reply}")));
            }
        }
    }
}

/// A negotiated QMP session.
pub struct MonitorClient {
    channel: Channel,
}

impl MonitorClient {
    /// Connect, check the greeting and leave capabilities negotiation mode.
    ///
    /// # Errors
    /// Returns [`ControlError::Unavailable`] if nothing listens on `path` and
    /// [`ControlError::Protocol`] if the greeting is not a QMP greeting.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, ControlError> {
        let mut channel = Channel::connect(path, timeout).await?;
        let greeting = channel.recv().await?;
        if greeting.get("QMP").is_none() {
            return Err(ControlError::Protocol(format!(
                "unexpected QMP greeting from {}",
                path.display()
            )));
        }
        channel.execute("qmp_capabilities", None).await?;
        Ok(Self { channel })
    }

    /// Run a QMP command and return its `return` member.
    ///
    /// # Errors
    /// Returns [`ControlError::Command`] if QEMU answers with an error.
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, ControlError> {
        self.channel.execute(command, arguments).await
    }
}

/// One address of a guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestIpAddress {
    pub ip_address: String,
    #[serde(default)]
    pub ip_address_type: Option<String>,
    #[serde(default)]
    pub prefix: Option<u8>,
}

/// A guest network interface as reported by `guest-network-get-interfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestInterface {
    pub name: String,
    #[serde(default)]
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

/// A synchronised guest agent session.
pub struct GuestAgentClient {
    channel: Channel,
}

impl GuestAgentClient {
    /// Connect and resynchronise with the agent.
    ///
    /// The agent keeps no per-connection state, so a `0xFF` byte is sent
    /// first to discard partial input from an earlier client, followed by
    /// `guest-sync` with a fresh id. Lines are dropped until the matching
    /// reply arrives.
    ///
    /// # Errors
    /// Returns [`ControlError::Unavailable`] if nothing listens on `path` or
    /// the agent inside the guest does not answer.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, ControlError> {
        let mut channel = Channel::connect(path, timeout).await?;
        let id = sync_id();

        let synced = async {
            channel.write_raw(&[0xFF]).await?;
            channel
                .send(&json!({ "execute": "guest-sync", "arguments": { "id": id } }))
                .await?;
            loop {
                let line = channel.read_line().await?;
                let Ok(reply) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if reply.get("return").and_then(Value::as_u64) == Some(u64::from(id)) {
                    return Ok::<(), ControlError>(());
                }
            }
        };

        match synced.await {
            Ok(()) => Ok(Self { channel }),
            Err(ControlError::Timeout { path, .. }) => Err(ControlError::Unavailable {
                path,
                reason: "guest agent did not respond".to_owned(),
            }),
            Err(e) => Err(e),
        }
    }

    /// # Errors
    /// Returns [`ControlError::Protocol`] if the reply does not have the
    /// documented shape.
    pub async fn network_interfaces(&mut self) -> Result<Vec<GuestInterface>, ControlError> {
        let value = self.channel.execute("guest-network-get-interfaces", None).await?;
        serde_json::from_value(value)
            .map_err(|e| ControlError::Protocol(format!("interface list: {e}")))
    }

    /// All addresses of all guest interfaces, loopback included.
    ///
    /// # Errors
    /// See [`GuestAgentClient::network_interfaces`].
    pub async fn ip_addresses(&mut self) -> Result<Vec<String>, ControlError> {
        Ok(self
            .network_interfaces()
            .await?
            .into_iter()
            .flat_map(|iface| iface.ip_addresses)
            .map(|addr| addr.ip_address)
            .collect())
    }
}

fn sync_id() -> u32 {
    let b = uuid::Uuid::new_v4().into_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Operations on a running guest.
#[async_trait]
pub trait GuestControl: Send + Sync {
    /// Ask the guest OS to power off (ACPI power button).
    async fn powerdown(&self, vm_id: &VmId) -> Result<(), ControlError>;

    /// Addresses currently configured inside the guest.
    async fn guest_ip_addresses(&self, vm_id: &VmId) -> Result<Vec<String>, ControlError>;
}

/// [`GuestControl`] over the per-VM QMP and guest agent sockets.
pub struct QemuControl {
    config: Arc<HostConfig>,
}

impl QemuControl {
    #[must_use]
    pub fn new(config: Arc<HostConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GuestControl for QemuControl {
    async fn powerdown(&self, vm_id: &VmId) -> Result<(), ControlError> {
        let path = self.config.monitor_socket(vm_id);
        let mut monitor = MonitorClient::connect(&path, self.config.monitor_timeout).await?;
        monitor.execute("system_powerdown", None).await?;
        tracing::debug!(vm_id = %vm_id, "sent system_powerdown");
        Ok(())
    }

    async fn guest_ip_addresses(&self, vm_id: &VmId) -> Result<Vec<String>, ControlError> {
        let path = self.config.agent_socket(vm_id);
        let mut agent = GuestAgentClient::connect(&path, self.config.agent_timeout).await?;
        agent.ip_addresses().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_list_parses_documented_shape() {
        let value = json!([
            {
                "name": "lo",
                "hardware-address": "00:00:00:00:00:00",
                "ip-addresses": [
                    { "ip-address-type": "ipv4", "ip-address": "127.0.0.1", "prefix": 8 }
                ]
            },
            { "name": "eth0", "ip-addresses": [
                { "ip-address-type": "ipv4", "ip-address": "10.0.0.5", "prefix": 24 },
                { "ip-address-type": "ipv6", "ip-address": "fe80::1", "prefix": 64 }
            ]},
            { "name": "eth1" }
        ]);
        let interfaces: Vec<GuestInterface> = match serde_json::from_value(value) {
            Ok(i) => i,
            Err(e) => panic!("parse failed: {e}"),
        };
        assert_eq!(interfaces.len(), 3);
        assert_eq!(interfaces[1].ip_addresses[1].ip_address, "fe80::1");
        assert!(interfaces[2].ip_addresses.is_empty(), "missing list must default to empty");
    }

    #[test]
    fn connect_errors_map_to_unavailable() {
        let err = map_connect_error(
            Path::new("/tmp/x.sock"),
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert!(matches!(err, ControlError::Unavailable { .. }), "got {err:?}");
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let path = dir.path().join("absent.sock");
        let result = MonitorClient::connect(&path, Duration::from_millis(200)).await;
        assert!(
            matches!(result, Err(ControlError::Unavailable { .. })),
            "connecting to a missing socket must be Unavailable"
        );
    }
}
