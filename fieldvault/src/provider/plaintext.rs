//! No-op provider.

use crate::config::{BlankPolicy, ProviderConfig};
use crate::error::Error;
use crate::provider::EncryptionProvider;

/// Stores values as they are. Useful in development and for fields that are
/// being migrated away from encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext {
    policy: BlankPolicy,
}

impl Plaintext {
    /// Creates a no-op provider.
    #[must_use]
    pub const fn new(policy: BlankPolicy) -> Self {
        Self { policy }
    }

    /// Creates a no-op provider honoring `strict_mode`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `strict_mode` is not a boolean.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, Error> {
        Ok(Self::new(config.blank_policy()?))
    }
}

impl EncryptionProvider for Plaintext {
    fn scheme(&self) -> &'static str {
        "plaintext"
    }

    fn blank_policy(&self) -> BlankPolicy {
        self.policy
    }

    fn encrypt_value(&self, plaintext: &str) -> Result<String, Error> {
        Ok(plaintext.to_string())
    }

    fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error> {
        Ok(ciphertext.to_string())
    }
}
