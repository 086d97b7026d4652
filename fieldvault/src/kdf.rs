//! Passphrase-based key derivation.
//!
//! Two modes are supported:
//! - PBKDF2-HMAC-SHA512 over a passphrase and salt (slow hash, default)
//! - a single SHA-256 digest of the passphrase (raw hash, for data written
//!   without a salt)

use crate::error::Error;
use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256, Sha512};
use std::str::FromStr;
use zeroize::Zeroizing;

/// Derived key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 60_000;

/// Key derivation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdfMode {
    /// PBKDF2-HMAC-SHA512 with a salt.
    #[default]
    Pbkdf2,
    /// SHA-256 digest of the passphrase, no salt.
    Sha256,
}

impl FromStr for KdfMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pbkdf2" => Ok(Self::Pbkdf2),
            "sha256" | "digest" => Ok(Self::Sha256),
            other => Err(Error::Configuration(format!("unknown key derivation mode: {other}"))),
        }
    }
}

/// Parameters for the slow hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    iterations: u32,
}

impl KdfParams {
    /// Creates parameters with the given iteration count.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `iterations` is zero.
    pub fn new(iterations: u32) -> Result<Self, Error> {
        if iterations == 0 {
            return Err(Error::Configuration("iterations must be greater than zero".to_string()));
        }
        Ok(Self { iterations })
    }

    /// Returns the iteration count.
    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: DEFAULT_ITERATIONS }
    }
}

/// Derives a 32-byte key from a passphrase and salt using PBKDF2-HMAC-SHA512.
///
/// # Arguments
///
/// * `passphrase` - The secret passphrase
/// * `salt` - Salt bytes; must not be empty
/// * `params` - Iteration count
///
/// # Errors
///
/// Returns `Error::Configuration` if the passphrase or salt is empty.
///
/// # Example
///
/// ```
/// use fieldvault::kdf::{derive_key, KdfParams, KEY_SIZE};
/// use secrecy::SecretString;
///
/// let passphrase = SecretString::new("correct horse".to_string());
/// let key = derive_key(&passphrase, b"salt", &KdfParams::new(1_000).unwrap()).unwrap();
/// assert_eq!(key.len(), KEY_SIZE);
/// ```
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, Error> {
    if passphrase.expose_secret().is_empty() {
        return Err(Error::Configuration("Missing :key".to_string()));
    }
    if salt.is_empty() {
        return Err(Error::Configuration("Missing :salt".to_string()));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha512>(passphrase.expose_secret().as_bytes(), salt, params.iterations, &mut *key);
    Ok(key)
}

/// Hashes a passphrase into a 32-byte key with a single SHA-256 pass.
///
/// # Errors
///
/// Returns `Error::Configuration` if the passphrase is empty.
pub fn digest_key(passphrase: &SecretString) -> Result<Zeroizing<[u8; KEY_SIZE]>, Error> {
    if passphrase.expose_secret().is_empty() {
        return Err(Error::Configuration("Missing :key".to_string()));
    }

    let digest = Sha256::digest(passphrase.expose_secret().as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&digest);
    Ok(key)
}

/// Derives a key and returns it as a lowercase hex string, for engines that
/// take the key as a text argument.
///
/// # Errors
///
/// Returns `Error::Configuration` if the passphrase or salt is empty.
pub fn derive_hex_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> Result<SecretString, Error> {
    let key = derive_key(passphrase, salt, params)?;
    Ok(SecretString::new(hex::encode(*key)))
}
