//! # `FieldVault`
//!
//! Transparent field-level encryption for database records.
//!
//! ## Features
//!
//! - Pluggable providers: local AES-256-GCM, PostgreSQL pgcrypto (symmetric
//!   PGP, public-key PGP and raw ciphers), MySQL `AES_ENCRYPT`, plaintext
//! - Lazy decryption of loaded values
//! - Dirty tracking so unchanged ciphertext is written back byte-for-byte
//! - SQL log redaction for statements that carry keys
//! - Batched table migrations to and from encrypted form
//!
//! ## Example
//!
//! ```rust
//! use fieldvault::prelude::*;
//!
//! let model = EncryptedModel::builder("users", "aes")
//!     .field("email")
//!     .option("key", "a long application secret")
//!     .option("kdf", "sha256")
//!     .build()
//!     .unwrap();
//!
//! let mut record = model.new_record();
//! record.set_field("email", Some("alice@example.com")).unwrap();
//! assert_eq!(record.get_field("email").unwrap(), Some("alice@example.com"));
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod lazy;
pub mod lifecycle;
pub mod migration;
pub mod provider;
pub mod redact;
pub mod settings;
pub mod storage;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::config::{BlankPolicy, FieldConfig, ProviderConfig};
    pub use crate::error::{Error, StorageError};
    pub use crate::lazy::LazyPlaintext;
    pub use crate::lifecycle::{
        EncryptedFieldSpec, EncryptedModel, EncryptedRecord, FieldValue, PendingWrite,
    };
    pub use crate::migration::{MigrationReport, Migrator};
    pub use crate::provider::registry::ProviderKind;
    pub use crate::provider::{EncryptionProvider, SearchPlan};
    pub use crate::redact::{LogSink, RedactionDialect, Redactor, SqlLogFilter};
    pub use crate::settings::Settings;
    pub use crate::storage::{Bind, ColumnKind, SqlValue, Storage, StoredRow, TableStore};
}
