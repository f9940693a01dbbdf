//! Shared data types: device identities, connection parameters, command
//! results and session events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Through a local tunnel over the USB multiplexer
    #[default]
    Usb,
    /// Directly over the network (historically stored as `wifi`)
    #[serde(alias = "wifi")]
    Network,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Usb => "usb",
            ConnectionType::Network => "network",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device we may open a shell on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Opaque identifier (UDID for USB devices, `host:port` for network ones)
    pub id: String,
    pub connection_type: ConnectionType,
    /// Host to connect to. Ignored for USB devices, which always go through
    /// a loopback tunnel.
    pub host: String,
    pub port: u16,
}

impl DeviceIdentity {
    pub fn usb(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection_type: ConnectionType::Usb,
            host: "127.0.0.1".to_string(),
            port: 22,
        }
    }

    pub fn network(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}", host, port),
            connection_type: ConnectionType::Network,
            host,
            port,
        }
    }
}

/// Everything needed to authenticate a session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub device_id: Option<String>,
    pub connection_type: ConnectionType,
}

// Keep the password out of logs.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("device_id", &self.device_id)
            .field("connection_type", &self.connection_type)
            .finish()
    }
}

/// Raw result of one remote invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Remote exit status, -1 when the server did not report one
    pub exit_status: i32,
    /// Whether collection stopped at the timeout (output may be partial)
    pub timed_out: bool,
}

/// Lifecycle notifications published by a
/// [`ConnectionSession`](super::connection::ConnectionSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected,
    Disconnected,
    ConnectionError {
        message: String,
    },
    CommandOutput {
        command: String,
        stdout: String,
        stderr: String,
    },
}

impl SessionEvent {
    /// Event name collaborators key off.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Disconnected => "disconnected",
            SessionEvent::ConnectionError { .. } => "connection_error",
            SessionEvent::CommandOutput { .. } => "command_output",
        }
    }
}
