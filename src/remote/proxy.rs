//! Process-wide manager of device tunnels.
//!
//! [`PortForwardManager`] owns every local tunnel to a device's SSH port. It is
//! constructed once and shared by handle (`Arc`) with every consumer; there is
//! no hidden global.
//!
//! # Invariants
//!
//! - At most one live tunnel per device id. A second `start_proxy` for a
//!   device with a live tunnel returns the same port.
//! - Ports come from a bounded range and are never handed to two live tunnels.
//! - No bookkeeping survives a failed start: the tunnel is stopped and nothing
//!   is recorded.
//!
//! # Locking
//!
//! All mutating operations serialize on one async mutex, held across the
//! readiness poll. The tunnel's listener runs on its own task outside it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::TunnelConfig;
use super::error::TunnelError;
use super::transport::{Tunnel, TunnelFactory, tcp_probe};

/// Timeout of the connect-probe used to decide whether a port is free.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// A tunnel the manager currently owns.
struct ActiveTunnel {
    local_port: u16,
    tunnel: Box<dyn Tunnel>,
}

/// Snapshot of one live tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub device_id: String,
    pub local_port: u16,
}

/// Owns local tunnels to device service ports, one per device.
pub struct PortForwardManager {
    factory: Arc<dyn TunnelFactory>,
    config: TunnelConfig,
    tunnels: Mutex<HashMap<String, ActiveTunnel>>,
}

impl PortForwardManager {
    pub fn new(factory: Arc<dyn TunnelFactory>, config: TunnelConfig) -> Self {
        info!(
            "Tunnel manager using {} on ports {}..{}",
            factory.name(),
            config.port_range.start,
            config.port_range.end
        );
        Self {
            factory,
            config,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Expose `device_id`'s service port on a loopback port.
    ///
    /// Returns the port of an existing live tunnel, or starts a new one and
    /// waits for it to accept connections. Returns `None` when no port is free,
    /// the tunnel cannot be started, or it does not become ready in time.
    /// Never retries.
    pub async fn start_proxy(&self, device_id: &str) -> Option<u16> {
        match self.try_start_proxy(device_id).await {
            Ok(port) => Some(port),
            Err(e) => {
                error!("Failed to start tunnel for {}: {}", device_id, e);
                None
            }
        }
    }

    /// Like [`start_proxy`](Self::start_proxy) but reports why it failed.
    pub async fn try_start_proxy(&self, device_id: &str) -> Result<u16, TunnelError> {
        let mut tunnels = self.tunnels.lock().await;

        if let Some(active) = tunnels.get(device_id) {
            if active.tunnel.is_alive() {
                info!(
                    "Reusing existing tunnel for {} on port {}",
                    device_id, active.local_port
                );
                return Ok(active.local_port);
            }
            warn!("Tunnel for {} died, replacing it", device_id);
            if let Some(mut dead) = tunnels.remove(device_id) {
                dead.tunnel.stop().await;
            }
        }

        let port = self.find_available_port(&tunnels).await.ok_or(TunnelError::NoFreePort {
            start: self.config.port_range.start,
            end: self.config.port_range.end,
        })?;

        let mut tunnel = self
            .factory
            .create_tunnel(device_id, port, self.config.remote_port)
            .map_err(TunnelError::Start)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        if let Err(e) = tunnel.start(bind_addr).await {
            tunnel.stop().await;
            return Err(TunnelError::Start(e));
        }

        if !self.wait_for_port(tunnel.as_ref(), port).await {
            tunnel.stop().await;
            return Err(TunnelError::NotReady(port));
        }

        info!("Tunnel for {} ready on port {}", device_id, port);
        tunnels.insert(
            device_id.to_string(),
            ActiveTunnel {
                local_port: port,
                tunnel,
            },
        );
        Ok(port)
    }

    /// Stop the tunnel for `device_id`. Idempotent.
    pub async fn stop_proxy(&self, device_id: &str) {
        let removed = self.tunnels.lock().await.remove(device_id);
        if let Some(mut active) = removed {
            active.tunnel.stop().await;
            info!(
                "Stopped tunnel for {} on port {}",
                device_id, active.local_port
            );
        }
    }

    /// Stop every tunnel (process teardown).
    pub async fn cleanup_all(&self) {
        let drained: Vec<(String, ActiveTunnel)> = self.tunnels.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        join_all(drained.into_iter().map(|(device_id, mut active)| async move {
            active.tunnel.stop().await;
            debug!("Stopped tunnel for {}", device_id);
        }))
        .await;
        info!("Stopped {} tunnel(s)", count);
    }

    /// Port of the live tunnel for `device_id`, if any.
    pub async fn get_device_port(&self, device_id: &str) -> Option<u16> {
        let mut tunnels = self.tunnels.lock().await;
        Self::sweep_dead(&mut tunnels).await;
        tunnels.get(device_id).map(|active| active.local_port)
    }

    /// Live tunnels, after evicting the ones whose listener died.
    pub async fn active_tunnels(&self) -> Vec<TunnelInfo> {
        let mut tunnels = self.tunnels.lock().await;
        Self::sweep_dead(&mut tunnels).await;

        let mut active: Vec<TunnelInfo> = tunnels
            .iter()
            .map(|(device_id, active)| TunnelInfo {
                device_id: device_id.clone(),
                local_port: active.local_port,
            })
            .collect();
        active.sort_by_key(|info| info.local_port);
        active
    }

    /// Evict tunnels whose background listener is gone.
    async fn sweep_dead(tunnels: &mut HashMap<String, ActiveTunnel>) {
        let dead: Vec<String> = tunnels
            .iter()
            .filter(|(_, active)| !active.tunnel.is_alive())
            .map(|(device_id, _)| device_id.clone())
            .collect();

        for device_id in dead {
            if let Some(mut active) = tunnels.remove(&device_id) {
                warn!(
                    "Evicting dead tunnel for {} on port {}",
                    device_id, active.local_port
                );
                active.tunnel.stop().await;
            }
        }
    }

    /// First port in range that is neither assigned nor answering a connect.
    async fn find_available_port(&self, tunnels: &HashMap<String, ActiveTunnel>) -> Option<u16> {
        for port in self.config.port_range.clone() {
            if tunnels.values().any(|active| active.local_port == port) {
                continue;
            }
            if !tcp_probe("127.0.0.1", port, PORT_PROBE_TIMEOUT).await {
                return Some(port);
            }
            debug!("Port {} is in use", port);
        }
        None
    }

    /// Poll until `port` accepts connections, the tunnel dies, or the
    /// readiness budget runs out.
    async fn wait_for_port(&self, tunnel: &dyn Tunnel, port: u16) -> bool {
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            if !tunnel.is_alive() {
                error!("Tunnel process died for port {}", port);
                return false;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let probe_timeout = remaining.min(self.config.poll_interval.max(PORT_PROBE_TIMEOUT));
            if tcp_probe("127.0.0.1", port, probe_timeout).await {
                debug!("Port {} is reachable", port);
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }

        error!("Timeout waiting for port {}", port);
        false
    }
}
