//! Error types for `fieldvault` operations.

use std::fmt;

/// Main error type for `fieldvault` operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Provider or field configuration is invalid (unknown provider, missing
    /// key material, wrong column kind)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Ciphertext could not be decrypted (wrong key or corrupt data)
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Cryptography was attempted on an empty value while strict mode is enabled
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The storage engine rejected a statement. The message has already been
    /// passed through the provider's redactor.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The named field is not configured for encryption
    #[error("{0} is not an encrypted field")]
    UnknownField(String),

    /// The provider cannot search on encrypted values
    #[error("search not supported: {0}")]
    UnsupportedSearch(String),
}

impl Error {
    /// Returns true for errors that mean the value could not be decrypted.
    #[must_use]
    pub const fn is_decryption(&self) -> bool {
        matches!(self, Self::DecryptionFailed(_))
    }
}

/// Error reported by the storage collaborator while executing a statement.
///
/// Engines commonly echo the offending statement, bind values included, in
/// their messages. A `StorageError` must therefore never be shown to a caller
/// or a log before it has been redacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The engine rejected or failed to execute the statement
    Statement(String),

    /// The requested table or row does not exist
    NotFound(String),

    /// Connection or transaction failure
    Connection(String),
}

impl StorageError {
    /// Returns the raw (unredacted) message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Statement(msg) | Self::NotFound(msg) | Self::Connection(msg) => msg,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement(msg) => write!(f, "statement invalid: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}
