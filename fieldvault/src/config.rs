//! Provider options and field configuration.

use crate::error::Error;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// How providers treat empty strings.
///
/// Zero-length plaintext is not representable by every backend, so by
/// default it bypasses cryptography entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlankPolicy {
    /// Empty strings are returned unchanged by encrypt and decrypt.
    #[default]
    PassThrough,
    /// Empty strings are rejected with `Error::InvalidArgument`.
    Strict,
}

impl BlankPolicy {
    /// Applies the policy to `value`.
    ///
    /// Returns `Ok(true)` when the value is blank and must be passed through
    /// untouched, `Ok(false)` when it should go through cryptography.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty value under `Strict`.
    pub fn bypass(self, value: &str, operation: &str) -> Result<bool, Error> {
        if !value.is_empty() {
            return Ok(false);
        }
        match self {
            Self::PassThrough => Ok(true),
            Self::Strict => {
                Err(Error::InvalidArgument(format!("cannot {operation} an empty value in strict mode")))
            }
        }
    }
}

/// Opaque key-value options handed to a provider at construction.
///
/// Every value is held as a secret; `Debug` only lists option names.
///
/// # Example
///
/// ```
/// use fieldvault::config::ProviderConfig;
///
/// let options = ProviderConfig::new()
///     .with("key", "super_good_password")
///     .with("salt", "pepper")
///     .with("strict_mode", "true");
///
/// assert!(options.contains("key"));
/// assert!(options.flag("strict_mode").unwrap());
/// ```
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ProviderConfig {
    options: BTreeMap<String, SecretString>,
}

impl ProviderConfig {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an option.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Adds (or replaces) an option in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.options.insert(name.into(), SecretString::new(value.into()));
    }

    /// Returns true if the option is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// Returns the option names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.options.keys().map(String::as_str)
    }

    /// Returns the option as a secret, treating blank values as absent.
    #[must_use]
    pub fn secret(&self, name: &str) -> Option<SecretString> {
        self.options
            .get(name)
            .filter(|value| !value.expose_secret().trim().is_empty())
            .map(|value| SecretString::new(value.expose_secret().clone()))
    }

    /// Returns a required secret option.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` ("Missing :name") when the option is
    /// absent or blank.
    pub fn require(&self, name: &str) -> Result<SecretString, Error> {
        self.secret(name).ok_or_else(|| Error::Configuration(format!("Missing :{name}")))
    }

    /// Returns a non-secret option such as `pgcrypto_options`.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|value| value.expose_secret().as_str())
    }

    /// Parses a boolean option. Absent options are `false`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the value is not a boolean.
    pub fn flag(&self, name: &str) -> Result<bool, Error> {
        match self.text(name).map(str::trim) {
            None | Some("") => Ok(false),
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => {
                Ok(true)
            }
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => {
                Ok(false)
            }
            Some(_) => Err(Error::Configuration(format!(":{name} must be a boolean"))),
        }
    }

    /// Parses an unsigned integer option.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the value is not a positive integer.
    pub fn number(&self, name: &str) -> Result<Option<u32>, Error> {
        match self.text(name).map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => match v.parse::<u32>() {
                Ok(n) if n > 0 => Ok(Some(n)),
                _ => Err(Error::Configuration(format!(":{name} must be a positive integer"))),
            },
        }
    }

    /// Returns the blank-value policy selected by `strict_mode`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `strict_mode` is not a boolean.
    pub fn blank_policy(&self) -> Result<BlankPolicy, Error> {
        Ok(if self.flag("strict_mode")? { BlankPolicy::Strict } else { BlankPolicy::PassThrough })
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig").field("options", &self.options.keys().collect::<Vec<_>>()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for ProviderConfig
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (name, value) in iter {
            config.insert(name, value);
        }
        config
    }
}

/// Field configuration as supplied by the record type: which fields are
/// encrypted and with which provider.
///
/// ```
/// use fieldvault::config::FieldConfig;
///
/// let config = FieldConfig::new("aes", ["ssn", "notes"])
///     .with_option("key", "secret")
///     .with_option("salt", "salt");
/// assert_eq!(config.fields, vec!["ssn".to_string(), "notes".to_string()]);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    /// Provider identifier, e.g. `aes` or `postgres_pgp`.
    pub provider: String,

    /// Names of the encrypted fields.
    pub fields: Vec<String>,

    /// Provider options.
    #[serde(default)]
    pub options: ProviderConfig,

    /// Wrap loaded ciphertext in lazy values instead of decrypting eagerly.
    #[serde(default = "default_lazy")]
    pub lazy: bool,
}

const fn default_lazy() -> bool {
    true
}

impl FieldConfig {
    /// Creates a field configuration for the given provider identifier.
    #[must_use]
    pub fn new<I, S>(provider: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            provider: provider.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            options: ProviderConfig::new(),
            lazy: true,
        }
    }

    /// Adds a provider option.
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name, value);
        self
    }

    /// Selects eager decryption on load.
    #[must_use]
    pub const fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }
}
