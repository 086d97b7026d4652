//! Symmetric encryption evaluated by the database engine.
//!
//! The key travels to the engine as a bind parameter. Engine errors often
//! echo the statement with its parameters, so every error leaving this
//! module is passed through the dialect's [`Redactor`] first.

use crate::config::{BlankPolicy, ProviderConfig};
use crate::error::{Error, StorageError};
use crate::kdf::{derive_hex_key, KdfParams};
use crate::provider::{check_identifier, EncryptionProvider, SearchPlan};
use crate::redact::{RedactionDialect, Redactor, FILTERED};
use crate::storage::{Bind, OwnedBind, SqlValue, Storage};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine function family used by [`DatabaseSymmetric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricDialect {
    /// PostgreSQL `pgp_sym_encrypt` / `pgp_sym_decrypt`
    PostgresPgp,
    /// MySQL `AES_ENCRYPT` / `AES_DECRYPT`, stored base64-encoded
    MysqlAes,
    /// PostgreSQL raw `encrypt` / `decrypt` (or the `_iv` variants)
    PostgresRaw,
}

impl SymmetricDialect {
    /// Returns the provider identifier of this dialect.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::PostgresPgp => "postgres_pgp",
            Self::MysqlAes => "mysql_aes",
            Self::PostgresRaw => "postgres_raw",
        }
    }

    const fn redaction(self) -> RedactionDialect {
        match self {
            Self::PostgresPgp => RedactionDialect::PgpSym,
            Self::MysqlAes => RedactionDialect::MysqlAes,
            Self::PostgresRaw => RedactionDialect::PostgresRaw,
        }
    }

    const fn default_options(self) -> &'static str {
        match self {
            Self::PostgresRaw => "aes",
            Self::PostgresPgp | Self::MysqlAes => "",
        }
    }
}

/// Runs `pgp_key_id` on `value` inside a nested transaction.
///
/// An engine error means the value is not a PGP message; the savepoint keeps
/// that error from aborting the caller's transaction.
pub(crate) fn pgp_key_present(storage: &dyn Storage, value: &str) -> bool {
    let result = storage.nested_transaction(&mut || {
        storage.query_scalar("SELECT pgp_key_id($1::bytea)", &[Bind::Text(value)])
    });

    match result {
        Ok(Some(key_id)) => key_id.into_text().is_some_and(|id| !id.is_empty()),
        _ => false,
    }
}

/// Renders a binary engine result in PostgreSQL's hex `bytea` text form.
pub(crate) fn bytea_text(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Text(text) => Some(text),
        SqlValue::Bytes(bytes) => Some(format!("\\x{}", hex::encode(bytes))),
    }
}

/// Symmetric encryption through engine functions.
///
/// Options:
/// - `key` (required)
/// - `fallback_key`: tried once when decrypting with `key` fails
/// - `pgcrypto_options`: options string for pgcrypto (`aes` for the raw
///   dialect, empty for PGP)
/// - `salt`, `iterations` (MySQL): derive the engine key with PBKDF2
/// - `iv` (raw dialect): use `encrypt_iv` / `decrypt_iv`
/// - `strict_mode`: reject empty values
pub struct DatabaseSymmetric {
    dialect: SymmetricDialect,
    storage: Arc<dyn Storage>,
    key: SecretString,
    fallback_key: Option<SecretString>,
    iv: Option<SecretString>,
    pgcrypto_options: String,
    policy: BlankPolicy,
    redactor: Redactor,
}

impl DatabaseSymmetric {
    /// Creates a provider for the given dialect.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `key` is missing or an option is
    /// invalid.
    pub fn new(
        dialect: SymmetricDialect,
        config: &ProviderConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, Error> {
        let mut key = config.require("key")?;
        let mut fallback_key = config.secret("fallback_key");

        if dialect == SymmetricDialect::MysqlAes {
            if let Some(salt) = config.secret("salt") {
                let params = match config.number("iterations")? {
                    Some(iterations) => KdfParams::new(iterations)?,
                    None => KdfParams::default(),
                };
                let salt = salt.expose_secret().as_bytes();
                key = derive_hex_key(&key, salt, &params)?;
                fallback_key =
                    fallback_key.map(|k| derive_hex_key(&k, salt, &params)).transpose()?;
            }
        }

        let iv = if dialect == SymmetricDialect::PostgresRaw { config.secret("iv") } else { None };
        let pgcrypto_options = config
            .text("pgcrypto_options")
            .unwrap_or_else(|| dialect.default_options())
            .to_string();

        debug!(
            scheme = dialect.scheme(),
            fallback = fallback_key.is_some(),
            "database provider configured"
        );

        Ok(Self {
            dialect,
            storage,
            key,
            fallback_key,
            iv,
            pgcrypto_options,
            policy: config.blank_policy()?,
            redactor: Redactor::new(dialect.redaction())?,
        })
    }

    /// PostgreSQL pgcrypto PGP provider.
    ///
    /// # Errors
    ///
    /// See [`DatabaseSymmetric::new`].
    pub fn postgres_pgp(config: &ProviderConfig, storage: Arc<dyn Storage>) -> Result<Self, Error> {
        Self::new(SymmetricDialect::PostgresPgp, config, storage)
    }

    /// MySQL `AES_ENCRYPT` provider.
    ///
    /// # Errors
    ///
    /// See [`DatabaseSymmetric::new`].
    pub fn mysql_aes(config: &ProviderConfig, storage: Arc<dyn Storage>) -> Result<Self, Error> {
        Self::new(SymmetricDialect::MysqlAes, config, storage)
    }

    /// PostgreSQL raw pgcrypto provider.
    ///
    /// # Errors
    ///
    /// See [`DatabaseSymmetric::new`].
    pub fn postgres_raw(config: &ProviderConfig, storage: Arc<dyn Storage>) -> Result<Self, Error> {
        Self::new(SymmetricDialect::PostgresRaw, config, storage)
    }

    /// Returns the dialect.
    #[must_use]
    pub const fn dialect(&self) -> SymmetricDialect {
        self.dialect
    }

    /// Redacts a storage error message. Function arguments are filtered by
    /// the redactor; configured secrets are also removed wherever else the
    /// engine may have echoed them.
    fn scrub(&self, err: &StorageError) -> String {
        let mut message = self.redactor.redact(err.message());
        let secrets = [Some(&self.key), self.fallback_key.as_ref(), self.iv.as_ref()];
        for secret in secrets.into_iter().flatten() {
            let text = secret.expose_secret();
            if !text.is_empty() {
                message = message.replace(text.as_str(), FILTERED);
            }
        }
        message
    }

    fn encrypt_once(&self, plaintext: &str) -> Result<Option<String>, StorageError> {
        let key = self.key.expose_secret().as_str();
        let options = self.pgcrypto_options.as_str();

        match self.dialect {
            SymmetricDialect::PostgresPgp => Ok(self
                .storage
                .query_scalar(
                    "SELECT pgp_sym_encrypt($1, $2, $3)",
                    &[Bind::Text(plaintext), Bind::Text(key), Bind::Text(options)],
                )?
                .and_then(bytea_text)),
            SymmetricDialect::MysqlAes => Ok(self
                .storage
                .query_scalar("SELECT AES_ENCRYPT(?, ?)", &[Bind::Text(plaintext), Bind::Text(key)])?
                .and_then(SqlValue::into_bytes)
                .map(|bytes| STANDARD.encode(bytes))),
            SymmetricDialect::PostgresRaw => {
                let result = match &self.iv {
                    Some(iv) => self.storage.query_scalar(
                        "SELECT encrypt_iv(convert_to($1, 'UTF8'), $2::bytea, $3::bytea, $4)",
                        &[
                            Bind::Text(plaintext),
                            Bind::Text(key),
                            Bind::Text(iv.expose_secret()),
                            Bind::Text(options),
                        ],
                    )?,
                    None => self.storage.query_scalar(
                        "SELECT encrypt(convert_to($1, 'UTF8'), $2::bytea, $3)",
                        &[Bind::Text(plaintext), Bind::Text(key), Bind::Text(options)],
                    )?,
                };
                Ok(result.and_then(bytea_text))
            }
        }
    }

    fn decrypt_once(&self, ciphertext: &str, key: &SecretString) -> Result<String, StorageError> {
        let key = key.expose_secret().as_str();
        let options = self.pgcrypto_options.as_str();

        let result = match self.dialect {
            SymmetricDialect::PostgresPgp => self.storage.query_scalar(
                "SELECT pgp_sym_decrypt($1::bytea, $2)",
                &[Bind::Text(ciphertext), Bind::Text(key)],
            )?,
            SymmetricDialect::MysqlAes => {
                let compact: String =
                    ciphertext.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                let raw = STANDARD.decode(compact.as_bytes()).map_err(|e| {
                    StorageError::Statement(format!("stored value is not base64: {e}"))
                })?;
                self.storage
                    .query_scalar("SELECT AES_DECRYPT(?, ?)", &[Bind::Bytes(&raw), Bind::Text(key)])?
            }
            SymmetricDialect::PostgresRaw => match &self.iv {
                Some(iv) => self.storage.query_scalar(
                    "SELECT encode(decrypt_iv($1::bytea, $2::bytea, $3::bytea, $4), 'escape')",
                    &[
                        Bind::Text(ciphertext),
                        Bind::Text(key),
                        Bind::Text(iv.expose_secret()),
                        Bind::Text(options),
                    ],
                )?,
                None => self.storage.query_scalar(
                    "SELECT encode(decrypt($1::bytea, $2::bytea, $3), 'escape')",
                    &[Bind::Text(ciphertext), Bind::Text(key), Bind::Text(options)],
                )?,
            },
        };

        result
            .and_then(SqlValue::into_text)
            .ok_or_else(|| StorageError::Statement("decryption returned no plaintext".to_string()))
    }
}

impl EncryptionProvider for DatabaseSymmetric {
    fn scheme(&self) -> &'static str {
        self.dialect.scheme()
    }

    fn blank_policy(&self) -> BlankPolicy {
        self.policy
    }

    fn encrypt_value(&self, plaintext: &str) -> Result<String, Error> {
        self.encrypt_once(plaintext)
            .map_err(|e| Error::Statement(self.scrub(&e)))?
            .ok_or_else(|| Error::EncryptionFailed("engine returned no ciphertext".to_string()))
    }

    fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error> {
        // PGP messages carry a key id; anything without one was never encrypted
        if self.dialect == SymmetricDialect::PostgresPgp
            && !pgp_key_present(self.storage.as_ref(), ciphertext)
        {
            return Ok(ciphertext.to_string());
        }

        match self.decrypt_once(ciphertext, &self.key) {
            Ok(plaintext) => Ok(plaintext),
            Err(primary) => {
                let Some(fallback) = &self.fallback_key else {
                    return Err(Error::DecryptionFailed(self.scrub(&primary)));
                };
                let plaintext = self
                    .decrypt_once(ciphertext, fallback)
                    .map_err(|e| Error::DecryptionFailed(self.scrub(&e)))?;
                warn!(scheme = self.scheme(), "value decrypted with fallback key");
                Ok(plaintext)
            }
        }
    }

    fn probe_encrypted(&self, value: &str) -> Option<bool> {
        if value.is_empty() {
            return Some(false);
        }
        match self.dialect {
            SymmetricDialect::PostgresPgp => Some(pgp_key_present(self.storage.as_ref(), value)),
            SymmetricDialect::MysqlAes | SymmetricDialect::PostgresRaw => {
                let result = self.storage.nested_transaction(&mut || {
                    self.decrypt_once(value, &self.key).map(|_| None)
                });
                Some(result.is_ok())
            }
        }
    }

    fn search(&self, column: &str, criteria: &str) -> Result<SearchPlan, Error> {
        let column = check_identifier(column)?;

        match self.dialect {
            SymmetricDialect::PostgresPgp => Ok(SearchPlan::Predicate {
                sql: format!("pgp_sym_decrypt(cast(\"{column}\" AS bytea), $1) = $2"),
                binds: vec![
                    OwnedBind::Text(self.key.expose_secret().clone()),
                    OwnedBind::Text(criteria.to_string()),
                ],
            }),
            // Deterministic ciphers: compare ciphertexts
            SymmetricDialect::MysqlAes => Ok(SearchPlan::Predicate {
                sql: format!("`{column}` = ?"),
                binds: vec![OwnedBind::Text(self.encrypt(criteria)?)],
            }),
            SymmetricDialect::PostgresRaw => Ok(SearchPlan::Predicate {
                sql: format!("\"{column}\" = $1"),
                binds: vec![OwnedBind::Text(self.encrypt(criteria)?)],
            }),
        }
    }

    fn redactor(&self) -> Option<&Redactor> {
        Some(&self.redactor)
    }
}
