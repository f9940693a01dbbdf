//! Per-device credential persistence.
//!
//! Layout under the vault directory (mode 0700):
//!
//! - `ssh_credentials.json`: device id -> record (mode 0600)
//! - `.ssh_key`: raw AES-256 key for inline passwords (mode 0600)
//!
//! A record's password lives in exactly one place: the OS secret store
//! (`password` empty, `password_in_keyring: true`) or sealed inline in the
//! JSON file. Plaintext only exists in memory.
//!
//! Operations report failures through `bool`/`Option`/counts after logging
//! them. A password that cannot be decrypted reads as empty without affecting
//! the other records; its sealed blob is written back untouched so it opens
//! again once the right key is in place.

mod crypto;
mod secret_store;

pub use secret_store::{KEYRING_ACCOUNT_PREFIX, KEYRING_SERVICE, KeyringStore, SecretStore};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use self::crypto::PasswordCipher;
use self::secret_store::account_for;
use super::config::{resolve_config_dir, resolve_use_keyring};
use super::error::VaultError;
use super::types::ConnectionType;

pub const CREDENTIALS_FILE: &str = "ssh_credentials.json";
pub const KEY_FILE: &str = ".ssh_key";

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Best-effort chmod 0600.
pub(crate) fn restrict_file(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!("Failed to restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Best-effort chmod 0700.
fn restrict_dir(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("Failed to restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Write `contents` to `path` atomically (temp file then rename), owner-only.
fn write_private_atomic(path: &Path, contents: &[u8]) -> Result<(), VaultError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    restrict_file(path);
    Ok(())
}

/// Credential fields supplied by the caller when saving.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub device_name: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connection_type", &self.connection_type)
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// A stored credential with its bookkeeping.
///
/// `password` is plaintext. For keyring-backed records it is empty in the
/// vault's own state and filled in by [`CredentialVault::get_credential`].
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub credential: Credential,
    pub created_at: String,
    pub last_used: String,
    pub password_in_keyring: bool,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("credential", &self.credential)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("password_in_keyring", &self.password_in_keyring)
            .finish()
    }
}

/// Record metadata without the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSummary {
    pub device_id: String,
    pub username: String,
    pub host: String,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub device_name: String,
    pub created_at: String,
    pub last_used: String,
    pub password_in_keyring: bool,
    pub has_password: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyringStatus {
    /// A secret store backend is configured
    pub available: bool,
    /// New passwords go to the secret store
    pub enabled: bool,
    pub backend: Option<&'static str>,
}

/// On-disk and export form of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    host: String,
    port: u16,
    #[serde(default)]
    connection_type: ConnectionType,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    last_used: String,
    #[serde(default)]
    password_in_keyring: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    password_encrypted: bool,
}

impl StoredRecord {
    fn from_record(record: &CredentialRecord, password: Option<String>) -> Self {
        let credential = &record.credential;
        Self {
            username: credential.username.clone(),
            password,
            host: credential.host.clone(),
            port: credential.port,
            connection_type: credential.connection_type,
            device_name: credential.device_name.clone(),
            created_at: record.created_at.clone(),
            last_used: record.last_used.clone(),
            password_in_keyring: record.password_in_keyring,
            password_encrypted: false,
        }
    }

    fn into_record(self, password: String) -> CredentialRecord {
        let now = timestamp();
        CredentialRecord {
            credential: Credential {
                username: self.username,
                password,
                host: self.host,
                port: self.port,
                connection_type: self.connection_type,
                device_name: self.device_name,
            },
            created_at: if self.created_at.is_empty() {
                now.clone()
            } else {
                self.created_at
            },
            last_used: if self.last_used.is_empty() {
                now
            } else {
                self.last_used
            },
            password_in_keyring: self.password_in_keyring,
        }
    }
}

/// Credential store for device logins.
pub struct CredentialVault {
    dir: PathBuf,
    credentials_path: PathBuf,
    cipher: PasswordCipher,
    secret_store: Option<Arc<dyn SecretStore>>,
    records: BTreeMap<String, CredentialRecord>,
    /// Sealed passwords the current key cannot open, by device id
    locked: BTreeMap<String, String>,
}

impl CredentialVault {
    /// Open the vault in `dir`, creating it as needed. `secret_store: None`
    /// keeps every password inline.
    ///
    /// Fails when the directory or key cannot be set up or the credential
    /// file is not valid JSON. Undecryptable passwords do not fail the open.
    pub fn open(
        dir: impl Into<PathBuf>,
        secret_store: Option<Arc<dyn SecretStore>>,
    ) -> Result<Self, VaultError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        restrict_dir(&dir);

        let key_path = dir.join(KEY_FILE);
        let credentials_path = dir.join(CREDENTIALS_FILE);
        if !key_path.exists() && credentials_path.exists() {
            warn!(
                "Key file {} is missing, stored passwords stay sealed until it is restored",
                key_path.display()
            );
        }
        let cipher = PasswordCipher::load_or_create(&key_path)?;

        let mut vault = Self {
            dir,
            credentials_path,
            cipher,
            secret_store,
            records: BTreeMap::new(),
            locked: BTreeMap::new(),
        };
        vault.load()?;
        info!(
            "Opened credential vault at {} ({} record(s))",
            vault.dir.display(),
            vault.records.len()
        );
        Ok(vault)
    }

    /// Open the vault in the configured directory, with the OS keyring unless
    /// disabled by configuration.
    pub fn open_default() -> Result<Self, VaultError> {
        let store: Option<Arc<dyn SecretStore>> = if resolve_use_keyring(None) {
            Some(Arc::new(KeyringStore::default()))
        } else {
            None
        };
        Self::open(resolve_config_dir(None), store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load(&mut self) -> Result<(), VaultError> {
        if !self.credentials_path.exists() {
            return Ok(());
        }
        restrict_file(&self.credentials_path);

        let content = fs::read_to_string(&self.credentials_path)?;
        let stored: BTreeMap<String, StoredRecord> = serde_json::from_str(&content)?;

        for (device_id, mut stored) in stored {
            let password = match stored.password.take().filter(|blob| !blob.is_empty()) {
                Some(blob) => match self.cipher.decrypt(&blob) {
                    Some(password) => password,
                    None => {
                        warn!("Cannot decrypt stored password for {}", device_id);
                        self.locked.insert(device_id.clone(), blob);
                        String::new()
                    }
                },
                None => String::new(),
            };
            self.records.insert(device_id, stored.into_record(password));
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), VaultError> {
        let stored: BTreeMap<&str, StoredRecord> = self
            .records
            .iter()
            .map(|(device_id, record)| {
                let password = &record.credential.password;
                let sealed = if password.is_empty() {
                    self.locked.get(device_id).cloned().unwrap_or_default()
                } else {
                    self.cipher.encrypt(password)
                };
                (device_id.as_str(), StoredRecord::from_record(record, Some(sealed)))
            })
            .collect();

        let content = serde_json::to_string_pretty(&stored)?;
        write_private_atomic(&self.credentials_path, content.as_bytes())?;
        restrict_dir(&self.dir);
        Ok(())
    }

    fn persist_logged(&self, action: &str) -> bool {
        match self.persist() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save credentials after {}: {}", action, e);
                false
            }
        }
    }

    fn store_in_keyring(&self, device_id: &str, password: &str) -> bool {
        let Some(store) = &self.secret_store else {
            return false;
        };
        match store.set_password(&account_for(device_id), password) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to store password for {} in keyring: {}", device_id, e);
                false
            }
        }
    }

    fn get_from_keyring(&self, device_id: &str) -> Option<String> {
        let store = self.secret_store.as_ref()?;
        match store.get_password(&account_for(device_id)) {
            Ok(password) => password,
            Err(e) => {
                warn!("Failed to read password for {} from keyring: {}", device_id, e);
                None
            }
        }
    }

    fn delete_from_keyring(&self, device_id: &str) {
        let Some(store) = &self.secret_store else {
            return;
        };
        if let Err(e) = store.delete_password(&account_for(device_id)) {
            warn!("Failed to delete password for {} from keyring: {}", device_id, e);
        }
    }

    /// Create or update the record for `device_id`.
    ///
    /// The password goes to the secret store when one is configured and
    /// accepts it, otherwise it is sealed inline. `created_at` survives
    /// updates.
    pub fn save_credential(&mut self, device_id: &str, credential: Credential) -> bool {
        let now = timestamp();
        let previous = self.records.get(device_id);
        let created_at = previous
            .map(|r| r.created_at.clone())
            .unwrap_or_else(|| now.clone());
        let was_in_keyring = previous.is_some_and(|r| r.password_in_keyring);

        let in_keyring =
            !credential.password.is_empty() && self.store_in_keyring(device_id, &credential.password);
        if was_in_keyring && !in_keyring {
            self.delete_from_keyring(device_id);
        }

        // A fresh password supersedes one we could not open.
        self.locked.remove(device_id);

        let mut credential = credential;
        if in_keyring {
            credential.password.clear();
        }
        let device_name = credential.device_name.clone();

        self.records.insert(
            device_id.to_string(),
            CredentialRecord {
                credential,
                created_at,
                last_used: now,
                password_in_keyring: in_keyring,
            },
        );

        let saved = self.persist_logged("save");
        if saved {
            info!(
                "Saved credential for {} ({}), password in {}",
                device_id,
                device_name,
                if in_keyring { "keyring" } else { "file" }
            );
        }
        saved
    }

    /// Record for `device_id` with its password rehydrated. Refreshes
    /// `last_used`.
    pub fn get_credential(&mut self, device_id: &str) -> Option<CredentialRecord> {
        let record = self.records.get_mut(device_id)?;
        record.last_used = timestamp();
        let mut found = record.clone();

        if found.password_in_keyring && found.credential.password.is_empty() {
            if let Some(password) = self.get_from_keyring(device_id) {
                found.credential.password = password;
            } else {
                warn!("Password for {} is missing from keyring", device_id);
            }
        }

        self.persist_logged("read");
        Some(found)
    }

    /// Remove the record and its keyring entry. `false` when unknown.
    pub fn delete_credential(&mut self, device_id: &str) -> bool {
        let Some(record) = self.records.remove(device_id) else {
            return false;
        };
        self.locked.remove(device_id);
        if record.password_in_keyring {
            self.delete_from_keyring(device_id);
        }

        let saved = self.persist_logged("delete");
        if saved {
            info!("Deleted credential for {}", device_id);
        }
        saved
    }

    /// Metadata of every record, most recently used first.
    pub fn get_all_credentials(&self) -> Vec<CredentialSummary> {
        let mut summaries: Vec<CredentialSummary> = self
            .records
            .iter()
            .map(|(device_id, record)| {
                let credential = &record.credential;
                CredentialSummary {
                    device_id: device_id.clone(),
                    username: credential.username.clone(),
                    host: credential.host.clone(),
                    port: credential.port,
                    connection_type: credential.connection_type,
                    device_name: credential.device_name.clone(),
                    created_at: record.created_at.clone(),
                    last_used: record.last_used.clone(),
                    password_in_keyring: record.password_in_keyring,
                    has_password: !credential.password.is_empty()
                        || record.password_in_keyring
                        || self.locked.contains_key(device_id),
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        summaries
    }

    pub fn get_recent_devices(&self, limit: usize) -> Vec<CredentialSummary> {
        let mut recent = self.get_all_credentials();
        recent.truncate(limit);
        recent
    }

    pub fn update_device_name(&mut self, device_id: &str, device_name: &str) -> bool {
        let Some(record) = self.records.get_mut(device_id) else {
            return false;
        };
        record.credential.device_name = device_name.to_string();
        self.persist_logged("rename")
    }

    /// Write a backup of every record to `path`.
    ///
    /// With `include_passwords` each password (keyring ones included) is
    /// sealed under this vault's key and tagged `password_encrypted`;
    /// otherwise passwords are omitted.
    pub fn export_credentials(&self, path: &Path, include_passwords: bool) -> bool {
        let exported: BTreeMap<&str, StoredRecord> = self
            .records
            .iter()
            .map(|(device_id, record)| {
                let mut stored = StoredRecord::from_record(record, None);
                stored.password_in_keyring = false;

                if include_passwords {
                    let password = if record.password_in_keyring {
                        self.get_from_keyring(device_id).unwrap_or_default()
                    } else {
                        record.credential.password.clone()
                    };
                    if !password.is_empty() {
                        stored.password = Some(self.cipher.encrypt(&password));
                        stored.password_encrypted = true;
                    } else if let Some(blob) = self.locked.get(device_id) {
                        stored.password = Some(blob.clone());
                        stored.password_encrypted = true;
                    }
                }
                (device_id.as_str(), stored)
            })
            .collect();

        let result = serde_json::to_string_pretty(&exported)
            .map_err(VaultError::from)
            .and_then(|content| write_private_atomic(path, content.as_bytes()));
        match result {
            Ok(()) => {
                info!(
                    "Exported {} credential(s) to {}",
                    exported.len(),
                    path.display()
                );
                true
            }
            Err(e) => {
                error!("Failed to export credentials: {}", e);
                false
            }
        }
    }

    /// Merge records from a backup, skipping device ids already present.
    ///
    /// Returns how many records were added. Tagged passwords that cannot be
    /// opened with this vault's key are imported as empty.
    pub fn import_credentials(&mut self, path: &Path) -> Option<usize> {
        let imported: BTreeMap<String, StoredRecord> = match fs::read_to_string(path)
            .map_err(VaultError::from)
            .and_then(|content| serde_json::from_str(&content).map_err(VaultError::from))
        {
            Ok(imported) => imported,
            Err(e) => {
                error!("Failed to import credentials from {}: {}", path.display(), e);
                return None;
            }
        };

        let mut added = 0;
        for (device_id, mut stored) in imported {
            if self.records.contains_key(&device_id) {
                continue;
            }

            let password = match stored.password.take() {
                Some(blob) if stored.password_encrypted && !blob.is_empty() => {
                    self.cipher.decrypt(&blob).unwrap_or_else(|| {
                        warn!(
                            "Cannot decrypt imported password for {}, it may use a different key",
                            device_id
                        );
                        String::new()
                    })
                }
                Some(plain) => plain,
                None => String::new(),
            };
            stored.password_in_keyring = false;
            stored.password_encrypted = false;

            self.records.insert(device_id, stored.into_record(password));
            added += 1;
        }

        if !self.persist_logged("import") {
            return None;
        }
        info!("Imported {} credential(s) from {}", added, path.display());
        Some(added)
    }

    /// Move inline passwords into the secret store. Returns
    /// `(migrated, failed)`; `(0, 0)` without a secret store.
    pub fn migrate_to_keyring(&mut self) -> (usize, usize) {
        if self.secret_store.is_none() {
            return (0, 0);
        }

        let pending: Vec<(String, String)> = self
            .records
            .iter()
            .filter(|(_, r)| !r.password_in_keyring && !r.credential.password.is_empty())
            .map(|(id, r)| (id.clone(), r.credential.password.clone()))
            .collect();

        let mut migrated = 0;
        let mut failed = 0;
        for (device_id, password) in pending {
            if !self.store_in_keyring(&device_id, &password) {
                failed += 1;
                continue;
            }
            if let Some(record) = self.records.get_mut(&device_id) {
                record.credential.password.clear();
                record.password_in_keyring = true;
            }
            migrated += 1;
        }

        if migrated > 0 {
            self.persist_logged("migration");
        }
        info!(
            "Migrated {} password(s) to keyring, {} failed",
            migrated, failed
        );
        (migrated, failed)
    }

    /// Delete every record. Returns `(deleted, failed)`.
    pub fn clear_all_credentials(&mut self) -> (usize, usize) {
        let device_ids: Vec<String> = self.records.keys().cloned().collect();
        let mut deleted = 0;
        let mut failed = 0;
        for device_id in device_ids {
            if self.delete_credential(&device_id) {
                deleted += 1;
            } else {
                failed += 1;
            }
        }
        (deleted, failed)
    }

    pub fn keyring_status(&self) -> KeyringStatus {
        KeyringStatus {
            available: self.secret_store.is_some(),
            enabled: self.secret_store.is_some(),
            backend: self.secret_store.as_ref().map(|s| s.backend_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::MemoryStore;
    use tempfile::TempDir;

    fn credential(password: &str) -> Credential {
        Credential {
            username: "root".into(),
            password: password.into(),
            host: "127.0.0.1".into(),
            port: 2222,
            connection_type: ConnectionType::Usb,
            device_name: "iPhone".into(),
        }
    }

    fn file_vault(dir: &TempDir) -> CredentialVault {
        CredentialVault::open(dir.path(), None).unwrap()
    }

    fn keyring_vault(dir: &TempDir, store: &Arc<MemoryStore>) -> CredentialVault {
        let store: Arc<dyn SecretStore> = store.clone();
        CredentialVault::open(dir.path(), Some(store)).unwrap()
    }

    fn on_disk(dir: &TempDir) -> serde_json::Value {
        let content = fs::read_to_string(dir.path().join(CREDENTIALS_FILE)).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    mod save_and_get {
        use super::*;

        #[test]
        fn test_round_trip_inline() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            assert!(vault.save_credential("udid-1", credential("alpine")));

            let mut reopened = file_vault(&dir);
            let record = reopened.get_credential("udid-1").unwrap();
            assert_eq!(record.credential, credential("alpine"));
            assert!(!record.password_in_keyring);
        }

        #[test]
        fn test_password_never_plaintext_on_disk() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("udid-1", credential("alpine"));

            let raw = fs::read_to_string(dir.path().join(CREDENTIALS_FILE)).unwrap();
            assert!(!raw.contains("alpine"));
            assert_ne!(on_disk(&dir)["udid-1"]["password"], "");
        }

        #[test]
        fn test_keyring_record_keeps_password_off_disk() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::default());
            let mut vault = keyring_vault(&dir, &store);
            vault.save_credential("udid-1", credential("alpine"));

            let json = on_disk(&dir);
            assert_eq!(json["udid-1"]["password"], "");
            assert_eq!(json["udid-1"]["password_in_keyring"], true);
            assert_eq!(store.get("ssh_cred_udid-1").as_deref(), Some("alpine"));

            let summaries = vault.get_all_credentials();
            assert!(summaries[0].has_password);

            let record = vault.get_credential("udid-1").unwrap();
            assert_eq!(record.credential.password, "alpine");
        }

        #[test]
        fn test_keyring_record_survives_reopen() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::default());
            keyring_vault(&dir, &store).save_credential("udid-1", credential("alpine"));

            let mut reopened = keyring_vault(&dir, &store);
            let record = reopened.get_credential("udid-1").unwrap();
            assert!(record.password_in_keyring);
            assert_eq!(record.credential.password, "alpine");
        }

        #[test]
        fn test_keyring_failure_falls_back_to_inline() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::failing());
            let mut vault = keyring_vault(&dir, &store);
            assert!(vault.save_credential("udid-1", credential("alpine")));

            assert_eq!(on_disk(&dir)["udid-1"]["password_in_keyring"], false);
            let record = vault.get_credential("udid-1").unwrap();
            assert_eq!(record.credential.password, "alpine");
        }

        #[test]
        fn test_update_preserves_created_at() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("udid-1", credential("alpine"));
            let first = vault.get_credential("udid-1").unwrap();

            std::thread::sleep(std::time::Duration::from_millis(5));
            vault.save_credential("udid-1", credential("changed"));
            let second = vault.get_credential("udid-1").unwrap();

            assert_eq!(first.created_at, second.created_at);
            assert!(second.last_used > first.last_used);
            assert_eq!(second.credential.password, "changed");
        }

        #[test]
        fn test_unknown_device() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            assert!(vault.get_credential("missing").is_none());
            assert!(!vault.delete_credential("missing"));
            assert!(!vault.update_device_name("missing", "x"));
        }
    }

    mod listing {
        use super::*;

        #[test]
        fn test_summaries_sorted_by_recency_without_passwords() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("old", credential("a"));
            std::thread::sleep(std::time::Duration::from_millis(5));
            vault.save_credential("new", credential(""));

            let all = vault.get_all_credentials();
            assert_eq!(all[0].device_id, "new");
            assert!(!all[0].has_password);
            assert!(all[1].has_password);

            let json = serde_json::to_string(&all).unwrap();
            assert!(!json.contains("\"password\""));

            let recent = vault.get_recent_devices(1);
            assert_eq!(recent.len(), 1);
            assert_eq!(recent[0].device_id, "new");
        }

        #[test]
        fn test_rename_device() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("udid-1", credential("a"));
            assert!(vault.update_device_name("udid-1", "iPad"));
            assert_eq!(file_vault(&dir).get_all_credentials()[0].device_name, "iPad");
        }
    }

    mod delete {
        use super::*;

        #[test]
        fn test_delete_removes_keyring_entry() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::default());
            let mut vault = keyring_vault(&dir, &store);
            vault.save_credential("udid-1", credential("alpine"));

            assert!(vault.delete_credential("udid-1"));
            assert!(store.get("ssh_cred_udid-1").is_none());
            assert!(vault.get_all_credentials().is_empty());
        }

        #[test]
        fn test_clear_all() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("a", credential("1"));
            vault.save_credential("b", credential("2"));

            assert_eq!(vault.clear_all_credentials(), (2, 0));
            assert!(file_vault(&dir).get_all_credentials().is_empty());
        }
    }

    mod export_import {
        use super::*;

        #[test]
        fn test_same_key_recovers_password() {
            let dir = TempDir::new().unwrap();
            let export = dir.path().join("backup.json");
            let mut vault = file_vault(&dir);
            vault.save_credential("udid-1", credential("alpine"));
            assert!(vault.export_credentials(&export, true));

            let raw = fs::read_to_string(&export).unwrap();
            assert!(!raw.contains("alpine"));
            assert!(raw.contains("\"password_encrypted\": true"));

            vault.delete_credential("udid-1");
            assert_eq!(vault.import_credentials(&export), Some(1));
            let record = vault.get_credential("udid-1").unwrap();
            assert_eq!(record.credential.password, "alpine");
        }

        #[test]
        fn test_different_key_degrades_to_empty_password() {
            let source_dir = TempDir::new().unwrap();
            let target_dir = TempDir::new().unwrap();
            let export = source_dir.path().join("backup.json");

            let mut source = file_vault(&source_dir);
            source.save_credential("udid-1", credential("alpine"));
            source.export_credentials(&export, true);

            let mut target = file_vault(&target_dir);
            assert_eq!(target.import_credentials(&export), Some(1));
            let record = target.get_credential("udid-1").unwrap();
            assert_eq!(record.credential.password, "");
            assert_eq!(record.credential.username, "root");
        }

        #[test]
        fn test_keyring_passwords_are_exported_sealed() {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::default());
            let export = dir.path().join("backup.json");
            let mut vault = keyring_vault(&dir, &store);
            vault.save_credential("udid-1", credential("alpine"));
            vault.export_credentials(&export, true);

            let json: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&export).unwrap()).unwrap();
            assert_eq!(json["udid-1"]["password_in_keyring"], false);
            assert_eq!(json["udid-1"]["password_encrypted"], true);

            let other_dir = TempDir::new().unwrap();
            let mut inline = CredentialVault::open(other_dir.path(), None).unwrap();
            // Different key, but the record itself must still arrive.
            assert_eq!(inline.import_credentials(&export), Some(1));
        }

        #[test]
        fn test_export_without_passwords_omits_them() {
            let dir = TempDir::new().unwrap();
            let export = dir.path().join("backup.json");
            let mut vault = file_vault(&dir);
            vault.save_credential("udid-1", credential("alpine"));
            vault.export_credentials(&export, false);

            let json: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&export).unwrap()).unwrap();
            assert!(json["udid-1"].get("password").is_none());
        }

        #[test]
        fn test_import_never_overwrites() {
            let dir = TempDir::new().unwrap();
            let export = dir.path().join("backup.json");
            let mut vault = file_vault(&dir);
            vault.save_credential("udid-1", credential("old"));
            vault.export_credentials(&export, true);
            vault.save_credential("udid-1", credential("new"));

            assert_eq!(vault.import_credentials(&export), Some(0));
            assert_eq!(
                vault.get_credential("udid-1").unwrap().credential.password,
                "new"
            );
        }

        #[test]
        fn test_import_missing_file() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            assert_eq!(vault.import_credentials(&dir.path().join("nope.json")), None);
        }
    }

    mod keyring_migration {
        use super::*;

        #[test]
        fn test_migrate_moves_inline_passwords() {
            let dir = TempDir::new().unwrap();
            let mut inline = file_vault(&dir);
            inline.save_credential("a", credential("one"));
            inline.save_credential("b", credential(""));
            drop(inline);

            let store = Arc::new(MemoryStore::default());
            let mut vault = keyring_vault(&dir, &store);
            assert_eq!(vault.migrate_to_keyring(), (1, 0));
            assert_eq!(on_disk(&dir)["a"]["password"], "");
            assert_eq!(store.get("ssh_cred_a").as_deref(), Some("one"));
            assert_eq!(
                vault.get_credential("a").unwrap().credential.password,
                "one"
            );
        }

        #[test]
        fn test_migrate_without_store() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("a", credential("one"));
            assert_eq!(vault.migrate_to_keyring(), (0, 0));
        }

        #[test]
        fn test_status() {
            let dir = TempDir::new().unwrap();
            assert!(!file_vault(&dir).keyring_status().enabled);

            let store = Arc::new(MemoryStore::default());
            let status = keyring_vault(&dir, &store).keyring_status();
            assert!(status.available && status.enabled);
            assert_eq!(status.backend, Some("memory"));
        }
    }

    mod degradation {
        use super::*;

        #[test]
        fn test_corrupt_password_only_affects_its_record() {
            let dir = TempDir::new().unwrap();
            let mut vault = file_vault(&dir);
            vault.save_credential("good", credential("alpine"));
            vault.save_credential("bad", credential("secret"));
            drop(vault);

            let path = dir.path().join(CREDENTIALS_FILE);
            let mut json = on_disk(&dir);
            json["bad"]["password"] = serde_json::Value::from("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
            fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

            let mut vault = file_vault(&dir);
            assert_eq!(vault.get_credential("bad").unwrap().credential.password, "");
            assert_eq!(
                vault.get_credential("good").unwrap().credential.password,
                "alpine"
            );
        }

        #[test]
        fn test_wrong_key_keeps_sealed_password_for_later() {
            let dir = TempDir::new().unwrap();
            let key_path = dir.path().join(KEY_FILE);
            file_vault(&dir).save_credential("udid-1", credential("alpine"));
            let original_key = fs::read(&key_path).unwrap();

            fs::write(&key_path, [7u8; 32]).unwrap();
            let mut wrong = file_vault(&dir);
            let record = wrong.get_credential("udid-1").unwrap();
            assert_eq!(record.credential.password, "");
            assert!(wrong.get_all_credentials()[0].has_password);
            wrong.update_device_name("udid-1", "iPad");
            drop(wrong);

            fs::write(&key_path, &original_key).unwrap();
            let mut restored = file_vault(&dir);
            let record = restored.get_credential("udid-1").unwrap();
            assert_eq!(record.credential.password, "alpine");
            assert_eq!(record.credential.device_name, "iPad");
        }

        #[test]
        fn test_new_password_replaces_sealed_one() {
            let dir = TempDir::new().unwrap();
            let key_path = dir.path().join(KEY_FILE);
            file_vault(&dir).save_credential("udid-1", credential("alpine"));

            fs::write(&key_path, [7u8; 32]).unwrap();
            let mut vault = file_vault(&dir);
            assert!(vault.save_credential("udid-1", credential("changed")));
            drop(vault);

            let mut reopened = file_vault(&dir);
            assert_eq!(
                reopened.get_credential("udid-1").unwrap().credential.password,
                "changed"
            );
        }

        #[test]
        fn test_invalid_json_fails_open() {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join(CREDENTIALS_FILE), "{not json").unwrap();
            assert!(matches!(
                CredentialVault::open(dir.path(), None),
                Err(VaultError::Json(_))
            ));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let parent = TempDir::new().unwrap();
        let dir = parent.path().join("vault");
        let mut vault = CredentialVault::open(&dir, None).unwrap();
        vault.save_credential("udid-1", credential("alpine"));

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(dir.as_path()), 0o700);
        assert_eq!(mode(dir.join(CREDENTIALS_FILE).as_path()), 0o600);
        assert_eq!(mode(dir.join(KEY_FILE).as_path()), 0o600);
    }
}
