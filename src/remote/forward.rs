//! Device tunnel implementations.
//!
//! Two [`TunnelFactory`] implementations expose a device's service port on a
//! loopback port:
//!
//! - [`IproxyFactory`]: spawns libimobiledevice's `iproxy` helper, which
//!   relays through usbmuxd. Liveness is the helper process still running.
//! - [`ForwardingFactory`] (feature `port_forward`): an in-process relay. A
//!   loopback `TcpListener` runs an accept loop on its own task; each accepted
//!   client is relayed to the device through a [`DeviceDialer`] with
//!   `tokio::io::copy_bidirectional` until either side closes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::transport::{Tunnel, TunnelFactory};

#[cfg(feature = "port_forward")]
pub use relay::{DeviceDialer, DeviceStream, ForwardingFactory, ForwardingTunnel, TcpDialer};

/// How long a stopped helper gets to exit before it is abandoned.
const HELPER_EXIT_GRACE: Duration = Duration::from_secs(3);

/// Creates tunnels backed by the `iproxy` helper binary.
#[derive(Debug, Clone)]
pub struct IproxyFactory {
    binary: PathBuf,
    pin_device: bool,
}

impl IproxyFactory {
    /// Use `binary` to launch tunnels.
    ///
    /// `iproxy` picks the first attached device on its own. Pinning to the
    /// device id is opt-in via [`with_device_pinning`](Self::with_device_pinning)
    /// because older helpers hang forever when the id is unknown.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            pin_device: false,
        }
    }

    pub fn with_device_pinning(mut self, pin: bool) -> Self {
        self.pin_device = pin;
        self
    }
}

impl TunnelFactory for IproxyFactory {
    fn create_tunnel(
        &self,
        device_id: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, String> {
        let udid = (self.pin_device && !device_id.is_empty() && device_id != "any")
            .then(|| device_id.to_string());

        Ok(Box::new(IproxyTunnel {
            binary: self.binary.clone(),
            udid,
            local_port,
            remote_port,
            child: StdMutex::new(None),
        }))
    }

    fn name(&self) -> &'static str {
        "iproxy"
    }
}

/// One running `iproxy` helper process.
pub struct IproxyTunnel {
    binary: PathBuf,
    udid: Option<String>,
    local_port: u16,
    remote_port: u16,
    child: StdMutex<Option<Child>>,
}

impl IproxyTunnel {
    fn command_args(&self, bind_addr: SocketAddr) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            bind_addr.ip().to_string(),
            format!("{}:{}", self.local_port, self.remote_port),
        ];
        if let Some(ref udid) = self.udid {
            args.push("-u".to_string());
            args.push(udid.clone());
        }
        args
    }
}

#[async_trait]
impl Tunnel for IproxyTunnel {
    async fn start(&mut self, bind_addr: SocketAddr) -> Result<(), String> {
        let args = self.command_args(bind_addr);
        info!("Starting {} {}", self.binary.display(), args.join(" "));

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn {}: {}", self.binary.display(), e))?;

        if let Ok(mut slot) = self.child.lock() {
            *slot = Some(child);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        let child = self.child.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut child) = child else {
            return;
        };

        if let Err(e) = child.start_kill() {
            debug!("iproxy already gone: {}", e);
        }
        if tokio::time::timeout(HELPER_EXIT_GRACE, child.wait())
            .await
            .is_err()
        {
            warn!(
                "iproxy on port {} did not exit within {:?}",
                self.local_port, HELPER_EXIT_GRACE
            );
        }
    }

    fn is_alive(&self) -> bool {
        let Ok(mut slot) = self.child.lock() else {
            return false;
        };
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(feature = "port_forward")]
mod relay {
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, error};

    use crate::remote::transport::{Tunnel, TunnelFactory};

    /// Byte stream to a device service.
    pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

    impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

    /// Opens raw connections to a port on a device.
    #[async_trait]
    pub trait DeviceDialer: Send + Sync {
        async fn dial(&self, device_id: &str, remote_port: u16) -> io::Result<Box<dyn DeviceStream>>;
    }

    /// Dials devices that are reachable over plain TCP at a fixed host.
    #[derive(Debug, Clone)]
    pub struct TcpDialer {
        host: String,
    }

    impl TcpDialer {
        pub fn new(host: impl Into<String>) -> Self {
            Self { host: host.into() }
        }
    }

    #[async_trait]
    impl DeviceDialer for TcpDialer {
        async fn dial(&self, _device_id: &str, remote_port: u16) -> io::Result<Box<dyn DeviceStream>> {
            let stream = TcpStream::connect((self.host.as_str(), remote_port)).await?;
            Ok(Box::new(stream))
        }
    }

    /// Creates in-process relay tunnels over a shared dialer.
    #[derive(Clone)]
    pub struct ForwardingFactory {
        dialer: Arc<dyn DeviceDialer>,
    }

    impl ForwardingFactory {
        pub fn new(dialer: Arc<dyn DeviceDialer>) -> Self {
            Self { dialer }
        }
    }

    impl TunnelFactory for ForwardingFactory {
        fn create_tunnel(
            &self,
            device_id: &str,
            _local_port: u16,
            remote_port: u16,
        ) -> Result<Box<dyn Tunnel>, String> {
            Ok(Box::new(ForwardingTunnel {
                device_id: device_id.to_string(),
                remote_port,
                dialer: self.dialer.clone(),
                cancel: CancellationToken::new(),
                accept_task: None,
            }))
        }

        fn name(&self) -> &'static str {
            "relay"
        }
    }

    /// In-process loopback relay to one device port.
    pub struct ForwardingTunnel {
        device_id: String,
        remote_port: u16,
        dialer: Arc<dyn DeviceDialer>,
        cancel: CancellationToken,
        accept_task: Option<JoinHandle<()>>,
    }

    #[async_trait]
    impl Tunnel for ForwardingTunnel {
        async fn start(&mut self, bind_addr: SocketAddr) -> Result<(), String> {
            let listener = TcpListener::bind(bind_addr)
                .await
                .map_err(|e| format!("Failed to bind to {}: {}", bind_addr, e))?;

            let local_addr = listener
                .local_addr()
                .map_err(|e| format!("Failed to get local address: {}", e))?;

            let device_id = self.device_id.clone();
            let remote_port = self.remote_port;
            let dialer = self.dialer.clone();
            let cancel = self.cancel.clone();

            self.accept_task = Some(tokio::spawn(async move {
                debug!("Tunnel for {} active on {}", device_id, local_addr);

                loop {
                    let accepted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };

                    match accepted {
                        Ok((local_stream, client_addr)) => {
                            debug!("New connection from {} to tunnel {}", client_addr, local_addr);
                            let dialer = dialer.clone();
                            let device_id = device_id.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    result = relay_connection(dialer, local_stream, &device_id, remote_port) => {
                                        if let Err(e) = result {
                                            debug!("Tunnel connection error: {}", e);
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting connection on {}: {}", local_addr, e);
                            break;
                        }
                    }
                }

                debug!("Tunnel listener on {} stopped", local_addr);
            }));

            Ok(())
        }

        async fn stop(&mut self) {
            self.cancel.cancel();
            if let Some(task) = self.accept_task.take() {
                task.abort();
                let _ = task.await;
            }
        }

        fn is_alive(&self) -> bool {
            self.accept_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
        }
    }

    /// Relay one accepted client to the device until either side closes.
    async fn relay_connection(
        dialer: Arc<dyn DeviceDialer>,
        mut local_stream: TcpStream,
        device_id: &str,
        remote_port: u16,
    ) -> Result<(), String> {
        let mut device_stream = dialer
            .dial(device_id, remote_port)
            .await
            .map_err(|e| format!("Failed to reach {} port {}: {}", device_id, remote_port, e))?;

        match tokio::io::copy_bidirectional(&mut local_stream, &mut device_stream).await {
            Ok((up, down)) => debug!("Tunnel connection closed ({} bytes up, {} bytes down)", up, down),
            Err(e) => debug!("Tunnel copy ended: {}", e),
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iproxy_args_without_pinning() {
        let factory = IproxyFactory::new("iproxy");
        let tunnel = IproxyTunnel {
            binary: factory.binary.clone(),
            udid: None,
            local_port: 2222,
            remote_port: 22,
            child: StdMutex::new(None),
        };
        let bind: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        assert_eq!(tunnel.command_args(bind), vec!["-s", "127.0.0.1", "2222:22"]);
    }

    #[test]
    fn test_iproxy_pinning_ignores_any() {
        let factory = IproxyFactory::new("iproxy").with_device_pinning(true);
        assert!(factory.create_tunnel("any", 2222, 22).is_ok());
        assert_eq!(factory.name(), "iproxy");
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let factory = IproxyFactory::new("/nonexistent/iproxy-binary");
        let mut tunnel = factory.create_tunnel("udid", 2230, 22).unwrap();
        let bind: SocketAddr = "127.0.0.1:2230".parse().unwrap();
        let result = tunnel.start(bind).await;
        assert!(result.unwrap_err().contains("Failed to spawn"));
        assert!(!tunnel.is_alive());
        tunnel.stop().await;
    }
}
