//! Local symmetric encryption with AES-256-GCM.
//!
//! The key is derived from a configured passphrase, every value gets a fresh
//! random IV, and the result is stored as a [`CipherEnvelope`]. GCM
//! authenticates the ciphertext, so decrypting with the wrong key or a
//! tampered IV fails instead of producing garbage.

use crate::config::{BlankPolicy, ProviderConfig};
use crate::envelope::CipherEnvelope;
use crate::error::Error;
use crate::kdf::{derive_key, digest_key, KdfMode, KdfParams, KEY_SIZE};
use crate::provider::EncryptionProvider;
use aes_gcm::{
    aead::{consts::U12, rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use tracing::debug;
use zeroize::Zeroizing;

/// IV size for AES-GCM (96 bits).
const NONCE_SIZE: usize = 12;

type GcmNonce = Nonce<U12>;

/// Encrypts values locally with a passphrase-derived AES-256 key.
///
/// Options:
/// - `key` (required): passphrase
/// - `salt`: required unless `kdf = "sha256"`
/// - `kdf`: `pbkdf2` (default) or `sha256`
/// - `iterations`: PBKDF2 iteration count (default 60 000)
/// - `strict_mode`: reject empty values
///
/// # Example
///
/// ```
/// use fieldvault::config::ProviderConfig;
/// use fieldvault::provider::{local::LocalSymmetric, EncryptionProvider};
///
/// let config = ProviderConfig::new()
///     .with("key", "super_good_password")
///     .with("salt", "pepper")
///     .with("iterations", "1000");
/// let provider = LocalSymmetric::from_config(&config).unwrap();
///
/// let stored = provider.encrypt("4111-1111-1111-1111").unwrap();
/// assert_ne!(stored, "4111-1111-1111-1111");
/// assert_eq!(provider.decrypt(&stored).unwrap(), "4111-1111-1111-1111");
/// ```
pub struct LocalSymmetric {
    key: SecretVec<u8>,
    policy: BlankPolicy,
}

impl LocalSymmetric {
    /// Creates a provider from a raw 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the key is not 32 bytes long.
    pub fn new(key: SecretVec<u8>, policy: BlankPolicy) -> Result<Self, Error> {
        let len = key.expose_secret().len();
        if len != KEY_SIZE {
            return Err(Error::Configuration(format!(
                "key must be {KEY_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self { key, policy })
    }

    /// Creates a provider from `key`, `salt`, `kdf`, `iterations` and
    /// `strict_mode` options.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `key` is missing, `salt` is missing
    /// in PBKDF2 mode, or an option has an invalid value.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, Error> {
        let passphrase = config.require("key")?;
        let mode = match config.text("kdf").map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => name.parse::<KdfMode>()?,
            None => KdfMode::default(),
        };

        let key: Zeroizing<[u8; KEY_SIZE]> = match mode {
            KdfMode::Pbkdf2 => {
                let salt = config.require("salt")?;
                let params = match config.number("iterations")? {
                    Some(iterations) => KdfParams::new(iterations)?,
                    None => KdfParams::default(),
                };
                derive_key(&passphrase, salt.expose_secret().as_bytes(), &params)?
            }
            KdfMode::Sha256 => digest_key(&passphrase)?,
        };

        debug!(kdf = ?mode, "local provider configured");
        Self::new(SecretVec::new(key.to_vec()), config.blank_policy()?)
    }

    fn cipher(&self) -> Result<Aes256Gcm, String> {
        Aes256Gcm::new_from_slice(self.key.expose_secret()).map_err(|e| format!("Invalid key: {e}"))
    }
}

impl EncryptionProvider for LocalSymmetric {
    fn scheme(&self) -> &'static str {
        "aes"
    }

    fn blank_policy(&self) -> BlankPolicy {
        self.policy
    }

    fn encrypt_value(&self, plaintext: &str) -> Result<String, Error> {
        // Fresh cipher context and IV per value
        let cipher = self.cipher().map_err(Error::EncryptionFailed)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = GcmNonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::EncryptionFailed(format!("AES-GCM encryption failed: {e}")))?;

        Ok(CipherEnvelope::new(nonce_bytes.to_vec(), ciphertext).encode())
    }

    fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error> {
        let envelope = CipherEnvelope::decode(ciphertext)?;
        let cipher = self.cipher().map_err(Error::DecryptionFailed)?;

        let nonce_bytes: [u8; NONCE_SIZE] = envelope
            .iv()
            .try_into()
            .map_err(|_| Error::DecryptionFailed("Invalid IV size".to_string()))?;
        let nonce = GcmNonce::from(nonce_bytes);

        let plaintext = Zeroizing::new(
            cipher.decrypt(&nonce, envelope.ciphertext()).map_err(|_| {
                Error::DecryptionFailed("AES-GCM authentication failed".to_string())
            })?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| Error::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
    }

    fn probe_encrypted(&self, value: &str) -> Option<bool> {
        Some(!value.is_empty() && self.decrypt_value(value).is_ok())
    }
}
