//! OS secret store seam.
//!
//! The vault depends on [`SecretStore`], not on the concrete backend, so tests
//! run against an in-memory store and platforms without a keyring simply run
//! with the store disabled.

use crate::remote::error::VaultError;

/// Keyring service name passwords are filed under.
pub const KEYRING_SERVICE: &str = "device-shell";

/// Prefix of per-device keyring account names.
pub const KEYRING_ACCOUNT_PREFIX: &str = "ssh_cred_";

/// Keyring account name for a device.
pub fn account_for(device_id: &str) -> String {
    format!("{}{}", KEYRING_ACCOUNT_PREFIX, device_id)
}

pub trait SecretStore: Send + Sync {
    fn set_password(&self, account: &str, password: &str) -> Result<(), VaultError>;

    /// `Ok(None)` when nothing is stored for `account`.
    fn get_password(&self, account: &str) -> Result<Option<String>, VaultError>;

    /// Deleting a missing entry succeeds.
    fn delete_password(&self, account: &str) -> Result<(), VaultError>;

    /// Human-readable backend name.
    fn backend_name(&self) -> &'static str;
}

/// Platform keyring (Keychain, Credential Manager, Secret Service).
///
/// On Linux keyutils only caches entries; the Secret Service collection is
/// what survives a reboot.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(&self.service, account).map_err(|e| VaultError::Backend(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl SecretStore for KeyringStore {
    fn set_password(&self, account: &str, password: &str) -> Result<(), VaultError> {
        self.entry(account)?
            .set_password(password)
            .map_err(|e| VaultError::Backend(e.to_string()))
    }

    fn get_password(&self, account: &str) -> Result<Option<String>, VaultError> {
        match self.entry(account)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(VaultError::Backend(e.to_string())),
        }
    }

    fn delete_password(&self, account: &str) -> Result<(), VaultError> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(VaultError::Backend(e.to_string())),
        }
    }

    fn backend_name(&self) -> &'static str {
        if cfg!(target_os = "macos") || cfg!(target_os = "ios") {
            "macOS Keychain"
        } else if cfg!(target_os = "windows") {
            "Windows Credential Manager"
        } else if cfg!(target_os = "linux") {
            "Linux Secret Service (keyutils cached)"
        } else {
            "Unknown"
        }
    }
}
