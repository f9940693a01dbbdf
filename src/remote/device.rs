//! Opening a shell on a device.
//!
//! USB devices are reached through a loopback tunnel from the
//! [`PortForwardManager`]; network devices are dialed directly. Bringing the
//! tunnel up is a precondition checked once before the session's own attempt
//! budget starts, so a slow tunnel never eats connect retries.

use std::sync::Arc;

use tracing::{info, warn};

use super::config::SessionConfig;
use super::connection::ConnectionSession;
use super::error::{SessionError, TunnelError};
use super::proxy::PortForwardManager;
use super::shell::ShellStateEmulator;
use super::transport::ExecConnector;
use super::types::{ConnectionInfo, ConnectionType, DeviceIdentity};
use super::vault::Credential;

/// Why a device connection could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceConnectError {
    #[error("Failed to start USB tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Builds connected [`DeviceSession`]s.
pub struct DeviceConnector {
    proxies: Arc<PortForwardManager>,
    connector: Arc<dyn ExecConnector>,
    config: SessionConfig,
}

impl DeviceConnector {
    pub fn new(
        proxies: Arc<PortForwardManager>,
        connector: Arc<dyn ExecConnector>,
        config: SessionConfig,
    ) -> Self {
        Self {
            proxies,
            connector,
            config,
        }
    }

    pub fn proxies(&self) -> &Arc<PortForwardManager> {
        &self.proxies
    }

    /// Connect to `device` and attach a shell.
    ///
    /// A tunnel started for this call is stopped again when the login fails.
    pub async fn connect(
        &self,
        device: &DeviceIdentity,
        username: &str,
        password: &str,
    ) -> Result<DeviceSession, DeviceConnectError> {
        let (host, port) = match device.connection_type {
            ConnectionType::Usb => {
                let port = self.proxies.try_start_proxy(&device.id).await?;
                ("127.0.0.1".to_string(), port)
            }
            ConnectionType::Network => (device.host.clone(), device.port),
        };

        let info = ConnectionInfo {
            host,
            port,
            username: username.to_string(),
            password: password.to_string(),
            device_id: Some(device.id.clone()),
            connection_type: device.connection_type,
        };

        let session = Arc::new(ConnectionSession::new(
            self.connector.clone(),
            self.config.clone(),
        ));
        if let Err(e) = session.try_connect(info).await {
            if device.connection_type == ConnectionType::Usb {
                warn!("Login to {} failed, stopping its tunnel", device.id);
                self.proxies.stop_proxy(&device.id).await;
            }
            return Err(e.into());
        }

        info!("Shell session open on {} ({})", device.id, device.connection_type);
        let shell = ShellStateEmulator::attach(session.clone()).await;
        Ok(DeviceSession {
            device: device.clone(),
            session,
            shell,
            proxies: self.proxies.clone(),
        })
    }
}

/// A connected device with its shell.
pub struct DeviceSession {
    device: DeviceIdentity,
    session: Arc<ConnectionSession>,
    shell: ShellStateEmulator,
    proxies: Arc<PortForwardManager>,
}

impl DeviceSession {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    pub fn shell(&mut self) -> &mut ShellStateEmulator {
        &mut self.shell
    }

    /// Login of the live connection, addressed the way it was dialed: the
    /// tunnel's loopback port for USB devices.
    pub async fn credential(&self, device_name: &str) -> Option<Credential> {
        let info = self.session.connection_info().await?;
        Some(Credential {
            username: info.username,
            password: info.password,
            host: info.host,
            port: info.port,
            connection_type: self.device.connection_type,
            device_name: device_name.to_string(),
        })
    }

    /// Close the session and, for USB devices, the tunnel.
    pub async fn disconnect(self) {
        self.session.disconnect().await;
        if self.device.connection_type == ConnectionType::Usb {
            self.proxies.stop_proxy(&self.device.id).await;
        }
        info!("Disconnected from {}", self.device.id);
    }
}
