//! Encryption provider abstraction.
//!
//! A provider turns plaintext into the text stored in a column and back.
//! Implementations range from a local cipher to functions evaluated by the
//! database engine; all of them are shared between records through
//! `Arc<dyn EncryptionProvider>`.

pub mod database;
pub mod local;
pub mod plaintext;
pub mod public_key;
pub mod registry;

use crate::config::BlankPolicy;
use crate::error::Error;
use crate::redact::Redactor;
use crate::settings::Settings;
use crate::storage::OwnedBind;
use std::sync::Arc;

/// Encrypts and decrypts individual field values.
///
/// Implementors provide [`encrypt_value`](Self::encrypt_value) and
/// [`decrypt_value`](Self::decrypt_value), which never see an empty
/// string. The provided [`encrypt`](Self::encrypt) and
/// [`decrypt`](Self::decrypt) apply the provider's [`BlankPolicy`] first.
///
/// Implementations must be thread-safe (`Send + Sync`) and immutable after
/// construction.
///
/// # Example
///
/// ```
/// use fieldvault::error::Error;
/// use fieldvault::provider::EncryptionProvider;
///
/// struct Rot13;
///
/// impl EncryptionProvider for Rot13 {
///     fn scheme(&self) -> &'static str {
///         "rot13"
///     }
///
///     fn encrypt_value(&self, plaintext: &str) -> Result<String, Error> {
///         Ok(plaintext
///             .chars()
///             .map(|c| match c {
///                 'a'..='m' | 'A'..='M' => (c as u8 + 13) as char,
///                 'n'..='z' | 'N'..='Z' => (c as u8 - 13) as char,
///                 _ => c,
///             })
///             .collect())
///     }
///
///     fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error> {
///         self.encrypt_value(ciphertext)
///     }
/// }
///
/// let provider = Rot13;
/// assert_eq!(provider.encrypt("hello").unwrap(), "uryyb");
/// assert_eq!(provider.encrypt("").unwrap(), "");
/// ```
pub trait EncryptionProvider: Send + Sync {
    /// Short identifier of the scheme, used in log events.
    fn scheme(&self) -> &'static str;

    /// Returns how empty strings are treated.
    fn blank_policy(&self) -> BlankPolicy {
        BlankPolicy::PassThrough
    }

    /// Encrypts a non-empty plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encrypted.
    fn encrypt_value(&self, plaintext: &str) -> Result<String, Error>;

    /// Decrypts a non-empty stored value.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` on a wrong key or corrupt data.
    fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error>;

    /// Encrypts a plaintext, passing blank values through according to the
    /// blank policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty value in strict mode,
    /// or the error of [`encrypt_value`](Self::encrypt_value).
    fn encrypt(&self, plaintext: &str) -> Result<String, Error> {
        if self.blank_policy().bypass(plaintext, "encrypt")? {
            return Ok(String::new());
        }
        self.encrypt_value(plaintext)
    }

    /// Decrypts a stored value, passing blank values through according to
    /// the blank policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty value in strict mode,
    /// or the error of [`decrypt_value`](Self::decrypt_value).
    fn decrypt(&self, ciphertext: &str) -> Result<String, Error> {
        if self.blank_policy().bypass(ciphertext, "decrypt")? {
            return Ok(String::new());
        }
        self.decrypt_value(ciphertext)
    }

    /// Encrypts several values, preserving order. Stops at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    fn encrypt_batch(&self, plaintexts: &[&str]) -> Result<Vec<String>, Error> {
        plaintexts.iter().map(|value| self.encrypt(value)).collect()
    }

    /// Decrypts several values, preserving order. Stops at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    fn decrypt_batch(&self, ciphertexts: &[&str]) -> Result<Vec<String>, Error> {
        ciphertexts.iter().map(|value| self.decrypt(value)).collect()
    }

    /// Reports whether `value` looks like this provider's ciphertext.
    ///
    /// Returns `None` when the provider cannot tell.
    fn probe_encrypted(&self, _value: &str) -> Option<bool> {
        None
    }

    /// Returns false for providers that can only encrypt, whose `decrypt`
    /// hands stored values back unchanged.
    fn can_decrypt(&self) -> bool {
        true
    }

    /// Plans a search for rows whose decrypted `column` equals `criteria`.
    ///
    /// The default asks the caller to decrypt and compare client-side.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `column` is not a plain
    /// identifier, or `Error::UnsupportedSearch` if the provider cannot
    /// search.
    fn search(&self, column: &str, criteria: &str) -> Result<SearchPlan, Error> {
        check_identifier(column)?;
        Ok(SearchPlan::ClientSide { criteria: criteria.to_string() })
    }

    /// Returns the log redactor for providers whose cryptography appears in
    /// statement text.
    fn redactor(&self) -> Option<&Redactor> {
        None
    }
}

/// How to find rows by plaintext value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPlan {
    /// A boolean SQL expression to use in a `WHERE` clause, with its binds.
    Predicate {
        /// Expression text with positional placeholders
        sql: String,
        /// Bind values in placeholder order
        binds: Vec<OwnedBind>,
    },
    /// The caller must decrypt candidate rows and keep those for which
    /// [`SearchPlan::matches`] holds.
    ClientSide {
        /// The plaintext to compare against
        criteria: String,
    },
}

impl SearchPlan {
    /// Returns true if a decrypted value satisfies a client-side plan.
    ///
    /// Always false for [`SearchPlan::Predicate`], which is evaluated by the
    /// engine.
    #[must_use]
    pub fn matches(&self, plaintext: &str) -> bool {
        match self {
            Self::ClientSide { criteria } => criteria == plaintext,
            Self::Predicate { .. } => false,
        }
    }
}

/// Rejects column names that are not plain identifiers, since they are
/// spliced into statement text.
pub(crate) fn check_identifier(column: &str) -> Result<&str, Error> {
    let mut chars = column.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(column)
    } else {
        Err(Error::InvalidArgument(format!("invalid column name: {column:?}")))
    }
}

/// Wraps a provider so that both directions become identity functions
/// while `Settings::stub_encryption` is on.
///
/// The flag is read on every call.
pub struct StubAware {
    inner: Arc<dyn EncryptionProvider>,
    settings: Arc<Settings>,
}

impl StubAware {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EncryptionProvider>, settings: Arc<Settings>) -> Self {
        Self { inner, settings }
    }

    /// Returns the wrapped provider.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn EncryptionProvider> {
        &self.inner
    }
}

impl EncryptionProvider for StubAware {
    fn scheme(&self) -> &'static str {
        self.inner.scheme()
    }

    fn blank_policy(&self) -> BlankPolicy {
        self.inner.blank_policy()
    }

    fn encrypt_value(&self, plaintext: &str) -> Result<String, Error> {
        self.inner.encrypt_value(plaintext)
    }

    fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error> {
        self.inner.decrypt_value(ciphertext)
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, Error> {
        if self.settings.stub_encryption() {
            return Ok(plaintext.to_string());
        }
        self.inner.encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, Error> {
        if self.settings.stub_encryption() {
            return Ok(ciphertext.to_string());
        }
        self.inner.decrypt(ciphertext)
    }

    fn probe_encrypted(&self, value: &str) -> Option<bool> {
        self.inner.probe_encrypted(value)
    }

    fn can_decrypt(&self) -> bool {
        self.inner.can_decrypt()
    }

    fn search(&self, column: &str, criteria: &str) -> Result<SearchPlan, Error> {
        self.inner.search(column, criteria)
    }

    fn redactor(&self) -> Option<&Redactor> {
        self.inner.redactor()
    }
}
