//! Public-key encryption evaluated by PostgreSQL pgcrypto.
//!
//! With only a public key configured the provider runs in pass-through
//! mode: it can encrypt, but decryption hands back the stored value
//! unchanged. This lets write-only services store data they can never read.

use crate::config::{BlankPolicy, ProviderConfig};
use crate::error::{Error, StorageError};
use crate::provider::database::{bytea_text, pgp_key_present};
use crate::provider::{check_identifier, EncryptionProvider, SearchPlan};
use crate::redact::{RedactionDialect, Redactor, FILTERED};
use crate::storage::{Bind, OwnedBind, SqlValue, Storage};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::debug;

/// Asymmetric PGP encryption through `pgp_pub_encrypt` / `pgp_pub_decrypt`.
///
/// Options:
/// - `public_key` (required): ASCII-armored public key
/// - `private_key`: ASCII-armored private key; enables decryption
/// - `passphrase`: passphrase of the private key
/// - `strict_mode`: reject empty values
pub struct DatabaseAsymmetric {
    storage: Arc<dyn Storage>,
    public_key: SecretString,
    private_key: Option<SecretString>,
    passphrase: Option<SecretString>,
    policy: BlankPolicy,
    redactor: Redactor,
}

impl DatabaseAsymmetric {
    /// Creates a provider from `public_key`, `private_key`, `passphrase` and
    /// `strict_mode` options.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `public_key` is missing, or if a
    /// passphrase is given without a private key.
    pub fn from_config(config: &ProviderConfig, storage: Arc<dyn Storage>) -> Result<Self, Error> {
        let public_key = config.require("public_key")?;
        let private_key = config.secret("private_key");
        let passphrase = config.secret("passphrase");

        if passphrase.is_some() && private_key.is_none() {
            return Err(Error::Configuration(
                ":passphrase given without :private_key".to_string(),
            ));
        }

        debug!(pass_through = private_key.is_none(), "public-key provider configured");

        Ok(Self {
            storage,
            public_key,
            private_key,
            passphrase,
            policy: config.blank_policy()?,
            redactor: Redactor::new(RedactionDialect::PgpPublicKey)?,
        })
    }

    fn scrub(&self, err: &StorageError) -> String {
        let mut message = self.redactor.redact(err.message());
        let secrets = [Some(&self.public_key), self.private_key.as_ref(), self.passphrase.as_ref()];
        for secret in secrets.into_iter().flatten() {
            let text = secret.expose_secret();
            if !text.is_empty() {
                message = message.replace(text.as_str(), FILTERED);
            }
        }
        message
    }

    fn decrypt_once(&self, ciphertext: &str, private_key: &SecretString) -> Result<String, StorageError> {
        let private_key = private_key.expose_secret().as_str();
        let result = match &self.passphrase {
            Some(passphrase) => self.storage.query_scalar(
                "SELECT pgp_pub_decrypt($1::bytea, dearmor($2), $3)",
                &[Bind::Text(ciphertext), Bind::Text(private_key), Bind::Text(passphrase.expose_secret())],
            )?,
            None => self.storage.query_scalar(
                "SELECT pgp_pub_decrypt($1::bytea, dearmor($2))",
                &[Bind::Text(ciphertext), Bind::Text(private_key)],
            )?,
        };

        result
            .and_then(SqlValue::into_text)
            .ok_or_else(|| StorageError::Statement("decryption returned no plaintext".to_string()))
    }
}

impl EncryptionProvider for DatabaseAsymmetric {
    fn scheme(&self) -> &'static str {
        "postgres_pgp_pub_key"
    }

    fn blank_policy(&self) -> BlankPolicy {
        self.policy
    }

    fn encrypt_value(&self, plaintext: &str) -> Result<String, Error> {
        // Pass-through mode: values loaded from storage come back as
        // ciphertext and must not be wrapped a second time
        if !self.can_decrypt() && pgp_key_present(self.storage.as_ref(), plaintext) {
            return Ok(plaintext.to_string());
        }

        self.storage
            .query_scalar(
                "SELECT pgp_pub_encrypt($1, dearmor($2))",
                &[Bind::Text(plaintext), Bind::Text(self.public_key.expose_secret())],
            )
            .map_err(|e| Error::Statement(self.scrub(&e)))?
            .and_then(bytea_text)
            .ok_or_else(|| Error::EncryptionFailed("engine returned no ciphertext".to_string()))
    }

    fn decrypt_value(&self, ciphertext: &str) -> Result<String, Error> {
        let Some(private_key) = &self.private_key else {
            return Ok(ciphertext.to_string());
        };
        if !pgp_key_present(self.storage.as_ref(), ciphertext) {
            return Ok(ciphertext.to_string());
        }

        self.decrypt_once(ciphertext, private_key)
            .map_err(|e| Error::DecryptionFailed(self.scrub(&e)))
    }

    fn probe_encrypted(&self, value: &str) -> Option<bool> {
        Some(!value.is_empty() && pgp_key_present(self.storage.as_ref(), value))
    }

    /// Returns false in pass-through mode.
    fn can_decrypt(&self) -> bool {
        self.private_key.is_some()
    }

    fn search(&self, column: &str, criteria: &str) -> Result<SearchPlan, Error> {
        let column = check_identifier(column)?;
        let Some(private_key) = &self.private_key else {
            return Err(Error::UnsupportedSearch(
                "public-key provider has no private key".to_string(),
            ));
        };

        let mut binds = vec![OwnedBind::Text(private_key.expose_secret().clone())];
        let sql = match &self.passphrase {
            Some(passphrase) => {
                binds.push(OwnedBind::Text(passphrase.expose_secret().clone()));
                format!("pgp_pub_decrypt(cast(\"{column}\" AS bytea), dearmor($1), $2) = $3")
            }
            None => format!("pgp_pub_decrypt(cast(\"{column}\" AS bytea), dearmor($1)) = $2"),
        };
        binds.push(OwnedBind::Text(criteria.to_string()));

        Ok(SearchPlan::Predicate { sql, binds })
    }

    fn redactor(&self) -> Option<&Redactor> {
        Some(&self.redactor)
    }
}
