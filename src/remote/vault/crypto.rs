//! Inline password encryption for the credential file.
//!
//! Passwords that do not go to the OS secret store are sealed with
//! AES-256-GCM under a per-installation key kept next to the credential file
//! (`.ssh_key`, 32 raw bytes, mode 0600). Blobs are `base64(nonce || ciphertext)`.
//!
//! When sealing fails the password is stored as `b64:<base64>` instead, which
//! only obscures it; this is logged as a warning.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{info, warn};

use crate::remote::error::VaultError;

/// Length of the raw key file
pub(crate) const KEY_LEN: usize = 32;

/// AES-GCM nonce length
const NONCE_LEN: usize = 12;

/// Prefix of the weaker fallback encoding
const FALLBACK_PREFIX: &str = "b64:";

/// Seals and opens inline passwords.
pub(crate) struct PasswordCipher {
    cipher: Aes256Gcm,
}

impl PasswordCipher {
    pub(crate) fn from_key(key: &[u8]) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            VaultError::InvalidKey(format!("expected {} bytes, found {}", KEY_LEN, key.len()))
        })?;
        Ok(Self { cipher })
    }

    /// Load the key at `path`, generating it (mode 0600) when missing.
    pub(crate) fn load_or_create(path: &Path) -> Result<Self, VaultError> {
        if path.exists() {
            let key = fs::read(path)?;
            super::restrict_file(path);
            return Self::from_key(&key);
        }

        let key = Aes256Gcm::generate_key(OsRng);
        write_new_private(path, key.as_slice())?;
        info!("Generated credential encryption key at {}", path.display());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
        })
    }

    /// Seal `plaintext`. Never fails: degrades to the fallback encoding.
    pub(crate) fn encrypt(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        match self.cipher.encrypt(&nonce, plaintext.as_bytes()) {
            Ok(ciphertext) => {
                let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                blob.extend_from_slice(nonce.as_slice());
                blob.extend_from_slice(&ciphertext);
                BASE64.encode(blob)
            }
            Err(_) => {
                warn!("Password encryption failed, storing with weaker base64 encoding");
                format!("{}{}", FALLBACK_PREFIX, BASE64.encode(plaintext.as_bytes()))
            }
        }
    }

    /// Open a blob produced by [`encrypt`](Self::encrypt). `None` when the
    /// blob is malformed or was sealed under another key.
    pub(crate) fn decrypt(&self, blob: &str) -> Option<String> {
        if let Some(encoded) = blob.strip_prefix(FALLBACK_PREFIX) {
            let bytes = BASE64.decode(encoded).ok()?;
            return String::from_utf8(bytes).ok();
        }

        let bytes = BASE64.decode(blob).ok()?;
        if bytes.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// Create `path` with owner-only permissions and write `contents`. Fails if
/// the file already exists.
fn write_new_private(path: &Path, contents: &[u8]) -> Result<(), VaultError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
