//! Narrow transport contract the shell layer is built on.
//!
//! Two seams:
//!
//! - **Tunnels**: [`TunnelFactory`] creates a per-device [`Tunnel`] that
//!   exposes the device's service port on a local loopback port.
//! - **Exec channels**: [`ExecConnector`] authenticates against `host:port`
//!   and returns an [`ExecChannel`] that runs one command at a time to
//!   completion. No shell process survives between two `exec` calls.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::error::SessionError;
use super::types::{ConnectionInfo, ExecOutput};

/// Check whether something accepts TCP connections at `host:port`.
pub async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Authenticated, stateless command channel.
#[async_trait]
pub trait ExecChannel: Send + Sync {
    /// Run `command` in a fresh remote shell and collect its output.
    ///
    /// Returns `Err` only when the command could not be run at all. A
    /// timeout is reported through [`ExecOutput::timed_out`].
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, String>;

    /// Close the underlying connection. Must be safe to call repeatedly.
    async fn close(&self);
}

/// Opens [`ExecChannel`]s.
#[async_trait]
pub trait ExecConnector: Send + Sync {
    /// Cheap reachability check run before every connection attempt.
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool {
        tcp_probe(host, port, timeout).await
    }

    /// Connect and authenticate once. No retries here.
    async fn open(
        &self,
        info: &ConnectionInfo,
        timeout: Duration,
    ) -> Result<Box<dyn ExecChannel>, SessionError>;
}

/// A single device tunnel.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Start listening on `bind_addr`. Returns once the listener has been
    /// launched; readiness is checked separately by connecting to it.
    async fn start(&mut self, bind_addr: SocketAddr) -> Result<(), String>;

    /// Tear the tunnel down. Idempotent.
    async fn stop(&mut self);

    /// Whether the background listener is still running.
    fn is_alive(&self) -> bool;
}

/// Creates per-device tunnels.
pub trait TunnelFactory: Send + Sync {
    fn create_tunnel(
        &self,
        device_id: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, String>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_probe("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!tcp_probe("127.0.0.1", port, Duration::from_millis(500)).await);
    }
}
