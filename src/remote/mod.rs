//! Remote shell access to iOS devices.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Device identities, connection parameters and session events
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and transport error classification
//! - `transport`: Narrow tunnel and exec-channel contracts
//! - `client`: SSH exec transport built on russh
//! - `forward`: Tunnel implementations (`iproxy` helper, in-process relay)
//! - `proxy`: Process-wide tunnel manager
//! - `connection`: Authenticated session with retry and lifecycle events
//! - `shell`: Client-side shell state emulation
//! - `vault`: Credential persistence with optional OS keyring
//! - `device`: USB/network connection orchestration

pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod shell;
pub mod transport;
pub mod types;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use client::RusshConnector;
pub use config::{SessionConfig, TunnelConfig};
pub use connection::ConnectionSession;
pub use device::{DeviceConnectError, DeviceConnector, DeviceSession};
pub use error::{ErrorKind, SessionError, TunnelError, VaultError};
pub use proxy::{PortForwardManager, TunnelInfo};
pub use shell::{ShellOutput, ShellStateEmulator};
pub use types::{ConnectionInfo, ConnectionType, DeviceIdentity, ExecOutput, SessionEvent};
pub use vault::{Credential, CredentialRecord, CredentialSummary, CredentialVault, KeyringStatus};
