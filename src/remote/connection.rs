//! Authenticated command session to one device.
//!
//! [`ConnectionSession`] wraps an [`ExecConnector`] with the connect retry
//! discipline and lifecycle events. Once connected it runs discrete commands
//! over the held [`ExecChannel`].
//!
//! # Retry Strategy
//!
//! Connection attempts use linear backoff via the `backon` crate:
//!
//! - Attempt `n` (1-based retry index) waits `n * retry_delay` before running
//! - Every attempt TCP-probes the endpoint first; an unreachable port is
//!   retried rather than failing immediately
//! - Authentication failures are terminal and never retried
//! - Protocol and other errors are retried until the attempt budget runs out
//!
//! # Events
//!
//! Lifecycle changes are published on a broadcast channel using the names
//! `connected`, `disconnected`, `connection_error` and `command_output`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, Retryable};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::error::SessionError;
use super::transport::{ExecChannel, ExecConnector};
use super::types::{ConnectionInfo, SessionEvent};

/// Capacity of the lifecycle event channel. Slow subscribers lag, they do
/// not block the session.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Command and timeout used by [`ConnectionSession::test_connection`].
const CANARY_COMMAND: &str = "echo 'connection test'";
const CANARY_TIMEOUT: Duration = Duration::from_secs(5);

/// Linear backoff: `base`, `2 * base`, `3 * base`, ... for at most
/// `max_retries` retries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinearBuilder {
    base: Duration,
    max_retries: u32,
}

impl LinearBuilder {
    pub(crate) fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }
}

impl BackoffBuilder for LinearBuilder {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff {
            base: self.base,
            max_retries: self.max_retries,
            retry: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LinearBackoff {
    base: Duration,
    max_retries: u32,
    retry: u32,
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retry >= self.max_retries {
            return None;
        }
        self.retry += 1;
        Some(self.base.saturating_mul(self.retry))
    }
}

/// Channel plus the parameters it was opened with.
struct ActiveChannel {
    channel: Arc<dyn ExecChannel>,
    info: ConnectionInfo,
}

/// One authenticated command session.
///
/// Connect and disconnect are mutually exclusive. Commands are not serialized
/// against each other; callers issue one command at a time per session.
pub struct ConnectionSession {
    connector: Arc<dyn ExecConnector>,
    config: SessionConfig,
    lifecycle: Mutex<()>,
    active: Mutex<Option<ActiveChannel>>,
    connected: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl ConnectionSession {
    pub fn new(connector: Arc<dyn ExecConnector>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            config,
            lifecycle: Mutex::new(()),
            active: Mutex::new(None),
            connected: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Receive lifecycle events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Parameters of the current connection.
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.active.lock().await.as_ref().map(|a| a.info.clone())
    }

    /// Login password of the current connection (used for `sudo -S`).
    pub async fn password(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.info.password.clone())
            .filter(|p| !p.is_empty())
    }

    /// Connect, returning whether the session is now connected.
    ///
    /// Failures are published as `connection_error` events; use
    /// [`try_connect`](Self::try_connect) to tell them apart.
    pub async fn connect(&self, info: ConnectionInfo) -> bool {
        self.try_connect(info).await.is_ok()
    }

    /// Connect with retries, returning the number of retries it took.
    ///
    /// An existing connection is closed first.
    pub async fn try_connect(&self, info: ConnectionInfo) -> Result<u32, SessionError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.active.lock().await.is_some() {
            self.close_active().await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let backoff = LinearBuilder::new(self.config.retry_delay, max_attempts - 1);
        let attempt_counter = AtomicU32::new(0);

        let info_ref = &info;
        let counter_ref = &attempt_counter;
        let result = (move || async move {
            let attempt = counter_ref.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "Connecting to {}:{} (attempt {}/{})",
                info_ref.host, info_ref.port, attempt, max_attempts
            );
            self.attempt_connect(info_ref).await
        })
        .retry(backoff)
        .when(|e: &SessionError| {
            let retryable = e.is_retryable();
            if !retryable {
                warn!(
                    "Connection to {}@{}:{} failed with non-retryable error: {}",
                    info.username, info.host, info.port, e
                );
            }
            retryable
        })
        .notify(|err: &SessionError, dur: Duration| {
            warn!("Connection attempt failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        let retry_count = total_attempts.saturating_sub(1);

        match result {
            Ok(channel) => {
                info!(
                    "Connected to {}@{}:{} after {} attempt(s)",
                    info.username, info.host, info.port, total_attempts
                );
                *self.active.lock().await = Some(ActiveChannel {
                    channel: Arc::from(channel),
                    info,
                });
                self.connected.store(true, Ordering::SeqCst);
                self.publish(SessionEvent::Connected);
                Ok(retry_count)
            }
            Err(e) => {
                error!(
                    "Connection to {}@{}:{} failed after {} attempt(s): {}",
                    info.username, info.host, info.port, total_attempts, e
                );
                self.publish(SessionEvent::ConnectionError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// One probe-then-open attempt.
    async fn attempt_connect(
        &self,
        info: &ConnectionInfo,
    ) -> Result<Box<dyn ExecChannel>, SessionError> {
        if !self
            .connector
            .probe(&info.host, info.port, self.config.probe_timeout)
            .await
        {
            warn!("Port {} on {} not reachable", info.port, info.host);
            return Err(SessionError::TransportUnreachable {
                host: info.host.clone(),
                port: info.port,
            });
        }

        self.connector.open(info, self.config.connect_timeout).await
    }

    /// Close the channel and publish `disconnected`. Safe when already
    /// disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.close_active().await;
    }

    async fn close_active(&self) {
        let previous = self.active.lock().await.take();
        if let Some(active) = previous {
            active.channel.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.publish(SessionEvent::Disconnected);
        info!("Connection closed");
    }

    /// Run one discrete remote command.
    ///
    /// Never fails: returns `("", "Not connected")` without a connection and
    /// `("", "Command execution failed: ...")` when the command could not run.
    /// A timeout keeps the partial stdout and reports the timeout on stderr.
    /// `None` uses the configured command timeout.
    pub async fn execute_command(&self, command: &str, timeout: Option<Duration>) -> (String, String) {
        let channel = match self.active.lock().await.as_ref() {
            Some(active) if self.is_connected() => active.channel.clone(),
            _ => {
                error!("Not connected");
                return (String::new(), "Not connected".to_string());
            }
        };

        let timeout = timeout.unwrap_or(self.config.command_timeout);
        match channel.exec(command, timeout).await {
            Ok(output) => {
                debug!(
                    "Command exit status: {} ({} bytes stdout, {} bytes stderr)",
                    output.exit_status,
                    output.stdout.len(),
                    output.stderr.len()
                );
                let mut stderr = output.stderr;
                if output.timed_out {
                    if !stderr.is_empty() && !stderr.ends_with('\n') {
                        stderr.push('\n');
                    }
                    stderr.push_str(&format!("Command timed out after {:?}", timeout));
                }
                (output.stdout, stderr)
            }
            Err(e) => {
                let message = format!("Command execution failed: {}", e);
                error!("{}", message);
                (String::new(), message)
            }
        }
    }

    /// Run [`execute_command`](Self::execute_command) on a spawned task and
    /// hand the result to `callback`. Returns immediately.
    pub fn execute_command_async<F>(
        self: &Arc<Self>,
        command: impl Into<String>,
        timeout: Option<Duration>,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(String, String) + Send + 'static,
    {
        let session = Arc::clone(self);
        let command = command.into();
        tokio::spawn(async move {
            let (stdout, stderr) = session.execute_command(&command, timeout).await;
            callback(stdout, stderr);
        })
    }

    /// Send a canary command and check its echo.
    pub async fn test_connection(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let (stdout, _) = self
            .execute_command(CANARY_COMMAND, Some(CANARY_TIMEOUT))
            .await;
        stdout.contains("connection test")
    }

    /// Publish a `command_output` event for a user-facing command.
    pub fn notify_command_output(&self, command: &str, stdout: &str, stderr: &str) {
        self.publish(SessionEvent::CommandOutput {
            command: command.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    fn publish(&self, event: SessionEvent) {
        debug!("Session event: {}", event.name());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
