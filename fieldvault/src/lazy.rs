//! Deferred decryption of loaded values.

use crate::error::Error;
use crate::provider::EncryptionProvider;
use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shown by `Display` when a value cannot be decrypted.
pub const UNDECRYPTABLE: &str = "[UNDECRYPTABLE]";

/// A stored value that is decrypted on first access.
///
/// Loading a record wraps each encrypted column in a `LazyPlaintext`, so
/// fields that are never read never pay for decryption. The first
/// successful decryption is memoized for the lifetime of the value; a
/// failed attempt is not, and the next access tries again.
///
/// # Example
///
/// ```
/// use fieldvault::lazy::LazyPlaintext;
/// use fieldvault::provider::{plaintext::Plaintext, EncryptionProvider};
/// use std::sync::Arc;
///
/// let provider: Arc<dyn EncryptionProvider> = Arc::new(Plaintext::default());
/// let value = LazyPlaintext::new(provider, "stored");
///
/// assert!(!value.is_realized());
/// assert!(value == "stored");
/// assert!(value.is_realized());
/// ```
pub struct LazyPlaintext {
    provider: Arc<dyn EncryptionProvider>,
    raw: String,
    plaintext: OnceCell<String>,
}

impl LazyPlaintext {
    /// Wraps a raw stored value.
    #[must_use]
    pub fn new(provider: Arc<dyn EncryptionProvider>, raw: impl Into<String>) -> Self {
        Self { provider, raw: raw.into(), plaintext: OnceCell::new() }
    }

    /// Returns the plaintext, decrypting on first access.
    ///
    /// # Errors
    ///
    /// Returns the provider's decryption error. The failure is not cached.
    pub fn value(&self) -> Result<&str, Error> {
        if let Some(plaintext) = self.plaintext.get() {
            return Ok(plaintext);
        }

        let plaintext = self.provider.decrypt(&self.raw)?;
        debug!(scheme = self.provider.scheme(), "lazy value decrypted");
        Ok(self.plaintext.get_or_init(|| plaintext))
    }

    /// Consumes the value and returns the plaintext.
    ///
    /// # Errors
    ///
    /// Returns the provider's decryption error.
    pub fn into_plaintext(self) -> Result<String, Error> {
        self.value()?;
        self.plaintext
            .into_inner()
            .ok_or_else(|| Error::DecryptionFailed("value was not decrypted".to_string()))
    }

    /// Returns the raw stored value without decrypting.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns true once the plaintext has been computed.
    #[must_use]
    pub fn is_realized(&self) -> bool {
        self.plaintext.get().is_some()
    }

    /// Length of the plaintext in bytes.
    ///
    /// # Errors
    ///
    /// Returns the provider's decryption error.
    pub fn len(&self) -> Result<usize, Error> {
        self.value().map(str::len)
    }

    /// Returns true if the plaintext is empty.
    ///
    /// # Errors
    ///
    /// Returns the provider's decryption error.
    pub fn is_empty(&self) -> Result<bool, Error> {
        self.value().map(str::is_empty)
    }

    /// Compares the plaintext with `other`, surfacing decryption errors.
    ///
    /// # Errors
    ///
    /// Returns the provider's decryption error.
    pub fn try_eq(&self, other: &str) -> Result<bool, Error> {
        self.value().map(|plaintext| plaintext == other)
    }

    fn eq_or_false(&self, other: &str) -> bool {
        self.try_eq(other).unwrap_or_else(|e| {
            warn!(error = %e, "comparison against undecryptable value");
            false
        })
    }
}

impl PartialEq<str> for LazyPlaintext {
    fn eq(&self, other: &str) -> bool {
        self.eq_or_false(other)
    }
}

impl PartialEq<&str> for LazyPlaintext {
    fn eq(&self, other: &&str) -> bool {
        self.eq_or_false(other)
    }
}

impl PartialEq<String> for LazyPlaintext {
    fn eq(&self, other: &String) -> bool {
        self.eq_or_false(other)
    }
}

impl fmt::Display for LazyPlaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Ok(plaintext) => f.write_str(plaintext),
            Err(_) => f.write_str(UNDECRYPTABLE),
        }
    }
}

impl fmt::Debug for LazyPlaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyPlaintext")
            .field("scheme", &self.provider.scheme())
            .field("realized", &self.is_realized())
            .finish_non_exhaustive()
    }
}
