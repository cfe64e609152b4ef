//! Encryption collaborator for sensitive log entries and config fields.
//!
//! The core only depends on the [`Encryptor`] trait. [`AesGcmEncryptor`]
//! is the bundled provider: AES-256-GCM with a fresh 96-bit nonce per
//! message, serialized as `base64(nonce ‖ ciphertext)`.
//!
//! # Key Management
//!
//! - **Generation**: [`ensure_log_key`] writes 32 random bytes from the OS
//!   CSPRNG on first run.
//! - **Storage**: the data directory, never the working tree.
//! - **Permissions**: 0600 on Unix. No enforcement on Windows.

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit, generic_array::GenericArray},
};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;
use std::fs;
use std::path::Path;

use super::error::{Result, SecurityError};

pub const LOG_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Pluggable encryption provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypt and return an opaque, printable token.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String>;

    /// Reverse [`encrypt`](Self::encrypt).
    async fn decrypt(&self, token: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM provider keyed by a local 32-byte key.
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    pub fn new(key: &[u8; LOG_KEY_LEN]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| SecurityError::Encryption(format!("Invalid key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Load the key file, generating it first if missing.
    pub fn from_key_file(path: &Path) -> anyhow::Result<Self> {
        ensure_log_key(path)?;
        let key = read_log_key(path)?;
        Self::new(&key).context("Failed to initialize log encryption")
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| SecurityError::Encryption("AES-GCM encryption failed".into()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn open(&self, token: &str) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(token.trim())
            .map_err(|e| SecurityError::Encryption(format!("Malformed ciphertext: {e}")))?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(SecurityError::Encryption("Ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| SecurityError::Encryption("AES-GCM decryption failed".into()))
    }
}

#[async_trait]
impl Encryptor for AesGcmEncryptor {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        self.seal(plaintext)
    }

    async fn decrypt(&self, token: &str) -> Result<Vec<u8>> {
        self.open(token)
    }
}

/// Create the log key if it does not exist. Returns `true` when a key was written.
pub fn ensure_log_key(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut key = [0u8; LOG_KEY_LEN];
    rand::rng().fill(&mut key);

    fs::write(path, key).context("Failed to write log key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set log key permissions")?;
    }

    tracing::info!("Generated log encryption key at {}", path.display());
    Ok(true)
}

/// Read the log key, rejecting files of the wrong length.
pub fn read_log_key(path: &Path) -> anyhow::Result<[u8; LOG_KEY_LEN]> {
    let bytes = fs::read(path).context("Failed to read log key. Run `docguard keygen`.")?;

    if bytes.len() != LOG_KEY_LEN {
        anyhow::bail!(
            "Log key has unexpected length {} (expected {})",
            bytes.len(),
            LOG_KEY_LEN
        );
    }

    let mut key = [0u8; LOG_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_encryptor() -> AesGcmEncryptor {
        AesGcmEncryptor::new(&[7u8; LOG_KEY_LEN]).unwrap()
    }

    #[tokio::test]
    async fn ciphertext_hides_plaintext_and_decrypts() {
        let enc = test_encryptor();
        let token = enc.encrypt(b"card 4111").await.unwrap();
        assert!(!token.contains("4111"));
        assert_eq!(enc.decrypt(&token).await.unwrap(), b"card 4111");
    }

    #[tokio::test]
    async fn nonces_differ_per_message() {
        let enc = test_encryptor();
        let a = enc.encrypt(b"same").await.unwrap();
        let b = enc.encrypt(b"same").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn tampered_or_foreign_ciphertext_fails() {
        let enc = test_encryptor();
        let token = enc.encrypt(b"secret").await.unwrap();
        let mut raw = STANDARD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(enc.decrypt(&STANDARD.encode(raw)).await.is_err());

        let other = AesGcmEncryptor::new(&[9u8; LOG_KEY_LEN]).unwrap();
        assert!(other.decrypt(&token).await.is_err());
        assert!(enc.decrypt("not base64!").await.is_err());
        assert!(enc.decrypt("AAAA").await.is_err());
    }

    #[test]
    fn key_file_generated_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keys/log.key");

        assert!(ensure_log_key(&path).unwrap());
        let first = read_log_key(&path).unwrap();
        assert!(!ensure_log_key(&path).unwrap());
        assert_eq!(read_log_key(&path).unwrap(), first);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn wrong_length_key_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.key");
        fs::write(&path, b"short").unwrap();
        assert!(read_log_key(&path).is_err());
    }

    #[tokio::test]
    async fn mock_encryptor_is_usable_as_trait_object() {
        let mut mock = MockEncryptor::new();
        mock.expect_encrypt()
            .returning(|plain| Ok(format!("enc:{}", plain.len())));
        let enc: std::sync::Arc<dyn Encryptor> = std::sync::Arc::new(mock);
        assert_eq!(enc.encrypt(b"abc").await.unwrap(), "enc:3");
    }
}
