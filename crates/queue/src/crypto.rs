//! Key derivation and at-rest encryption for spool segments.
//!
//! The key is derived from a master passphrase via PBKDF2-HMAC-SHA256 with
//! a per-installation random salt file; the key never leaves process
//! memory. Segments are encrypted with AES-256-GCM, one random nonce per
//! write.

use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 600_000;

/// Errors raised while deriving keys or encrypting/decrypting segment data.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The salt file could not be read or written.
    #[error("salt file error at {path}: {message}")]
    SaltFile {
        /// The salt file path.
        path: String,
        /// The error message.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,

    /// Decryption failed, e.g. due to a corrupted or tampered segment.
    #[error("decryption failed")]
    Decrypt,

    /// The ciphertext was shorter than the nonce prefix.
    #[error("ciphertext truncated")]
    Truncated,
}

/// A derived symmetric key, kept only in process memory.
#[derive(Clone)]
pub struct SpoolKey {
    key: [u8; 32],
}

impl SpoolKey {
    /// Loads (creating if absent) the per-installation salt file at `salt_path`
    /// and derives the key from `passphrase`.
    pub fn derive(passphrase: &[u8], salt_path: &Path) -> Result<Self, Error> {
        let salt = load_or_create_salt(salt_path)?;
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase, &salt, PBKDF2_ROUNDS, &mut key);
        Ok(Self { key })
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| Error::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a `nonce || ciphertext` blob produced by `encrypt`.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, Error> {
        if blob.len() < NONCE_LEN {
            return Err(Error::Truncated);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher.decrypt(nonce, ciphertext).map_err(|_| Error::Decrypt)
    }
}

fn load_or_create_salt(salt_path: &Path) -> Result<[u8; SALT_LEN], Error> {
    if salt_path.exists() {
        let bytes = std::fs::read(salt_path).map_err(|e| Error::SaltFile {
            path: salt_path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut salt = [0u8; SALT_LEN];
        if bytes.len() != SALT_LEN {
            return Err(Error::SaltFile {
                path: salt_path.display().to_string(),
                message: format!("expected {SALT_LEN} bytes, found {}", bytes.len()),
            });
        }
        salt.copy_from_slice(&bytes);
        Ok(salt)
    } else {
        if let Some(parent) = salt_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::SaltFile {
                path: salt_path.display().to_string(),
                message: e.to_string(),
            })?;
        }
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        std::fs::write(salt_path, salt).map_err(|e| Error::SaltFile {
            path: salt_path.display().to_string(),
            message: e.to_string(),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(salt_path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(salt)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let salt_path = dir.path().join("salt");
        let key = SpoolKey::derive(b"correct horse battery staple", &salt_path).unwrap();

        let plaintext = b"some spool record bytes";
        let ciphertext = key.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());

        let decrypted = key.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn salt_file_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let salt_path = dir.path().join("salt");
        let key1 = SpoolKey::derive(b"pw", &salt_path).unwrap();
        let key2 = SpoolKey::derive(b"pw", &salt_path).unwrap();

        let ciphertext = key1.encrypt(b"hello").unwrap();
        assert_eq!(key2.decrypt(&ciphertext).unwrap(), b"hello");
    }
}
