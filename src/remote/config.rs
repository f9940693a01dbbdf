//! Configuration resolution for device shell access.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 15s | Handshake and authentication timeout in seconds |
//! | `SSH_PROBE_TIMEOUT_MS` | 3000ms | TCP reachability probe timeout in milliseconds |
//! | `SSH_COMMAND_TIMEOUT` | 30s | Command execution timeout in seconds |
//! | `SSH_MAX_ATTEMPTS` | 3 | Connection attempt budget |
//! | `SSH_RETRY_DELAY_MS` | 2000ms | Linear backoff base delay in milliseconds |
//! | `TUNNEL_PORT_BASE` | 2222 | First local port handed out to tunnels |
//! | `TUNNEL_PORT_MAX` | 2250 | End (exclusive) of the tunnel port range |
//! | `TUNNEL_READY_TIMEOUT_MS` | 5000ms | Tunnel readiness poll budget |
//! | `TUNNEL_POLL_INTERVAL_MS` | 200ms | Tunnel readiness poll interval |
//! | `IPROXY_PATH` | `iproxy` | USB tunnel helper binary |
//! | `DEVICE_SHELL_CONFIG_DIR` | `<config>/device-shell` | Credential vault directory |
//! | `DEVICE_SHELL_USE_KEYRING` | true | Store passwords in the OS secret store |

use std::env;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH handshake/authentication timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default TCP reachability probe timeout in milliseconds
pub(crate) const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Default command execution timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default connection attempt budget
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default linear backoff base in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Default first tunnel port
pub(crate) const DEFAULT_TUNNEL_PORT_BASE: u16 = 2222;

/// Default end (exclusive) of the tunnel port range
pub(crate) const DEFAULT_TUNNEL_PORT_MAX: u16 = 2250;

/// Default tunnel readiness budget in milliseconds
pub(crate) const DEFAULT_TUNNEL_READY_TIMEOUT_MS: u64 = 5000;

/// Default tunnel readiness poll interval in milliseconds
pub(crate) const DEFAULT_TUNNEL_POLL_INTERVAL_MS: u64 = 200;

/// Remote service port the tunnels forward to
pub(crate) const DEVICE_SSH_PORT: u16 = 22;

/// Application directory name under the platform config directory
pub(crate) const APP_DIR_NAME: &str = "device-shell";

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const PROBE_TIMEOUT_ENV_VAR: &str = "SSH_PROBE_TIMEOUT_MS";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";
pub(crate) const MAX_ATTEMPTS_ENV_VAR: &str = "SSH_MAX_ATTEMPTS";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub(crate) const TUNNEL_PORT_BASE_ENV_VAR: &str = "TUNNEL_PORT_BASE";
pub(crate) const TUNNEL_PORT_MAX_ENV_VAR: &str = "TUNNEL_PORT_MAX";
pub(crate) const TUNNEL_READY_TIMEOUT_ENV_VAR: &str = "TUNNEL_READY_TIMEOUT_MS";
pub(crate) const TUNNEL_POLL_INTERVAL_ENV_VAR: &str = "TUNNEL_POLL_INTERVAL_MS";
pub(crate) const IPROXY_PATH_ENV_VAR: &str = "IPROXY_PATH";
pub(crate) const CONFIG_DIR_ENV_VAR: &str = "DEVICE_SHELL_CONFIG_DIR";
pub(crate) const USE_KEYRING_ENV_VAR: &str = "DEVICE_SHELL_USE_KEYRING";

/// Parse an environment variable, ignoring unset or malformed values.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse::<T>().ok())
}

/// Resolve the handshake timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the TCP probe timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_probe_timeout(timeout_ms_param: Option<u64>) -> Duration {
    let ms = timeout_ms_param
        .or_else(|| env_parse(PROBE_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(COMMAND_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the attempt budget with priority: parameter -> env var -> default.
///
/// A budget of zero is promoted to one: connect always tries at least once.
pub(crate) fn resolve_max_attempts(attempts_param: Option<u32>) -> u32 {
    attempts_param
        .or_else(|| env_parse(MAX_ATTEMPTS_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_ATTEMPTS)
        .max(1)
}

/// Resolve the linear backoff base with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay(delay_ms_param: Option<u64>) -> Duration {
    let ms = delay_ms_param
        .or_else(|| env_parse(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Resolve the tunnel port range. An empty or inverted range from the
/// environment falls back to the default range.
pub(crate) fn resolve_port_range(range_param: Option<Range<u16>>) -> Range<u16> {
    if let Some(range) = range_param {
        return range;
    }

    let base = env_parse(TUNNEL_PORT_BASE_ENV_VAR).unwrap_or(DEFAULT_TUNNEL_PORT_BASE);
    let max = env_parse(TUNNEL_PORT_MAX_ENV_VAR).unwrap_or(DEFAULT_TUNNEL_PORT_MAX);
    if base < max {
        base..max
    } else {
        DEFAULT_TUNNEL_PORT_BASE..DEFAULT_TUNNEL_PORT_MAX
    }
}

/// Resolve the tunnel readiness budget with priority: parameter -> env var -> default
pub(crate) fn resolve_ready_timeout(timeout_ms_param: Option<u64>) -> Duration {
    let ms = timeout_ms_param
        .or_else(|| env_parse(TUNNEL_READY_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_TUNNEL_READY_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Resolve the tunnel poll interval with priority: parameter -> env var -> default
pub(crate) fn resolve_poll_interval(interval_ms_param: Option<u64>) -> Duration {
    let ms = interval_ms_param
        .or_else(|| env_parse(TUNNEL_POLL_INTERVAL_ENV_VAR))
        .unwrap_or(DEFAULT_TUNNEL_POLL_INTERVAL_MS);
    Duration::from_millis(ms)
}

/// Resolve the `iproxy` binary location: parameter -> env var -> `iproxy` on PATH
pub fn resolve_iproxy_path(path_param: Option<PathBuf>) -> PathBuf {
    path_param
        .or_else(|| env::var(IPROXY_PATH_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("iproxy"))
}

/// Resolve the credential vault directory: parameter -> env var -> platform default.
///
/// The platform default is `<config_dir>/device-shell`, falling back to
/// `~/.device-shell` and finally the current directory when no home is known.
pub fn resolve_config_dir(dir_param: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = dir_param {
        return dir;
    }

    if let Ok(dir) = env::var(CONFIG_DIR_ENV_VAR)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .or_else(|| dirs::home_dir().map(|home| home.join(format!(".{}", APP_DIR_NAME))))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR_NAME)))
}

/// Resolve whether the OS secret store is used: parameter -> env var -> default (true)
pub(crate) fn resolve_use_keyring(use_keyring_param: Option<bool>) -> bool {
    if let Some(use_keyring) = use_keyring_param {
        return use_keyring;
    }

    if let Ok(value) = env::var(USE_KEYRING_ENV_VAR) {
        return value.eq_ignore_ascii_case("true") || value == "1";
    }

    true
}

/// Settings for [`ConnectionSession`](super::connection::ConnectionSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Timeout for the SSH handshake and authentication of one attempt
    pub connect_timeout: Duration,
    /// Timeout of the TCP reachability probe that precedes every attempt
    pub probe_timeout: Duration,
    /// Default timeout for discrete commands
    pub command_timeout: Duration,
    /// Total number of connection attempts
    pub max_attempts: u32,
    /// Linear backoff base: attempt `n` waits `n * retry_delay`
    pub retry_delay: Duration,
}

impl SessionConfig {
    /// Build the configuration from environment variables and defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            probe_timeout: resolve_probe_timeout(None),
            command_timeout: resolve_command_timeout(None),
            max_attempts: resolve_max_attempts(None),
            retry_delay: resolve_retry_delay(None),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Settings for [`PortForwardManager`](super::proxy::PortForwardManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Half-open range of local ports handed out to tunnels
    pub port_range: Range<u16>,
    /// Remote service port on the device
    pub remote_port: u16,
    /// How long to wait for a new tunnel to accept connections
    pub ready_timeout: Duration,
    /// Interval between readiness probes
    pub poll_interval: Duration,
}

impl TunnelConfig {
    /// Build the configuration from environment variables and defaults.
    pub fn from_env() -> Self {
        Self {
            port_range: resolve_port_range(None),
            remote_port: DEVICE_SSH_PORT,
            ready_timeout: resolve_ready_timeout(None),
            poll_interval: resolve_poll_interval(None),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_TUNNEL_PORT_BASE..DEFAULT_TUNNEL_PORT_MAX,
            remote_port: DEVICE_SSH_PORT,
            ready_timeout: Duration::from_millis(DEFAULT_TUNNEL_READY_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_TUNNEL_POLL_INTERVAL_MS),
        }
    }
}
