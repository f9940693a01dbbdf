//! SSH exec transport built on russh.
//!
//! [`RusshConnector`] performs one connection attempt (TCP connect, handshake,
//! password authentication) and hands back a [`RusshChannel`]. Every command
//! runs on a fresh session channel of that connection, so no shell state
//! survives between two commands; that is what the shell emulator papers over.
//!
//! Retries live one level up in
//! [`ConnectionSession`](super::connection::ConnectionSession).
//!
//! Jailbroken devices regenerate host keys whenever the SSH daemon is
//! reinstalled and are usually reached through a loopback tunnel, so host keys
//! are accepted without verification (OpenSSH `StrictHostKeyChecking=no`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::SessionError;
use super::transport::{ExecChannel, ExecConnector};
use super::types::{ConnectionInfo, ExecOutput};

/// russh handler that accepts every host key.
pub struct DeviceClientHandler;

impl client::Handler for DeviceClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Accepting device host key ({})", server_public_key.algorithm());
        Ok(true)
    }
}

/// Build russh client configuration.
///
/// - Inactivity timeout disabled: an interactive shell may idle for hours
/// - Keepalive every 30 seconds, giving up after 3 missed replies
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Parse `host[:port]` into host and port, defaulting to port 22.
///
/// Bracketed IPv6 literals (`[::1]:22`) lose their brackets.
pub fn parse_address(address: &str) -> Result<(String, u16), String> {
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() && (!host.contains(':') || host.ends_with(']')) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|e| format!("Invalid port number: {}", e))?;
            (host, port)
        }
        _ => (address, 22),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host.to_string(), port))
}

/// Opens password-authenticated SSH connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecConnector for RusshConnector {
    async fn open(
        &self,
        info: &ConnectionInfo,
        timeout: Duration,
    ) -> Result<Box<dyn ExecChannel>, SessionError> {
        let config = build_client_config();
        let connect_future = client::connect(
            config,
            (info.host.as_str(), info.port),
            DeviceClientHandler,
        );

        let mut handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| {
                SessionError::from_message(
                    &info.host,
                    info.port,
                    format!("Connection timed out after {:?}", timeout),
                )
            })?
            .map_err(|e| SessionError::from_message(&info.host, info.port, e.to_string()))?;

        debug!("Authenticating {} with password", info.username);
        let auth = handle.authenticate_password(info.username.as_str(), info.password.as_str());
        let accepted = tokio::time::timeout(timeout, auth)
            .await
            .map_err(|_| {
                SessionError::Protocol(format!("Authentication timed out after {:?}", timeout))
            })?
            .map_err(|e| {
                SessionError::from_message(
                    &info.host,
                    info.port,
                    format!("Password exchange failed: {}", e),
                )
            })?;

        if !accepted.success() {
            return Err(SessionError::AuthenticationFailed);
        }

        Ok(Box::new(RusshChannel {
            handle: Mutex::new(Some(Arc::new(handle))),
        }))
    }
}

/// An authenticated SSH connection used as a discrete exec channel.
pub struct RusshChannel {
    handle: Mutex<Option<Arc<client::Handle<DeviceClientHandler>>>>,
}

#[async_trait]
impl ExecChannel for RusshChannel {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, String> {
        let handle = self
            .handle
            .lock()
            .await
            .clone()
            .ok_or_else(|| "Connection closed".to_string())?;

        run_on_channel(&handle, command, timeout).await
    }

    async fn close(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "Session closed by user", "en")
            .await
        {
            warn!("Error during disconnect: {}", e);
        }
    }
}

/// SSH extended-data stream carrying stderr
const STDERR_STREAM: u32 = 1;

/// Output gathered from one exec channel.
#[derive(Default)]
struct Collected {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

impl Collected {
    /// Fold one channel message in. Returns `true` once the command is over.
    fn absorb(&mut self, msg: Option<ChannelMsg>) -> bool {
        match msg {
            Some(ChannelMsg::Data { data }) => self.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == STDERR_STREAM => {
                self.stderr.extend_from_slice(&data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => self.exit_status = Some(exit_status),
            Some(ChannelMsg::Eof) => return self.exit_status.is_some(),
            Some(ChannelMsg::Close) | None => return true,
            Some(_) => {}
        }
        false
    }

    fn into_output(self, timed_out: bool) -> ExecOutput {
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_status: self.exit_status.map_or(-1, |code| code as i32),
            timed_out,
        }
    }
}

/// Run `command` on a new session channel of `handle`.
///
/// Past `timeout` whatever arrived so far comes back flagged `timed_out`; the
/// remote process is not signalled.
async fn run_on_channel(
    handle: &client::Handle<DeviceClientHandler>,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, String> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| format!("Cannot open exec channel: {}", e))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| format!("Exec request rejected: {}", e))?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut collected = Collected::default();
    let timed_out = loop {
        tokio::select! {
            msg = channel.wait() => {
                if collected.absorb(msg) {
                    break false;
                }
            }
            _ = &mut deadline => break true,
        }
    };

    if timed_out {
        debug!(
            "'{}' still running after {:?}, keeping {} bytes of output",
            command,
            timeout,
            collected.stdout.len() + collected.stderr.len()
        );
    }
    if let Err(e) = channel.close().await {
        debug!("Exec channel close: {}", e);
    }

    Ok(collected.into_output(timed_out))
}
