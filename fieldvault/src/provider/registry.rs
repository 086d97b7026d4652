//! Provider selection by identifier.

use crate::config::ProviderConfig;
use crate::error::Error;
use crate::provider::database::{DatabaseSymmetric, SymmetricDialect};
use crate::provider::local::LocalSymmetric;
use crate::provider::plaintext::Plaintext;
use crate::provider::public_key::DatabaseAsymmetric;
use crate::provider::EncryptionProvider;
use crate::storage::Storage;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The closed set of available providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Local AES-256-GCM (`aes`)
    Local,
    /// PostgreSQL symmetric PGP (`postgres_pgp`)
    PostgresPgp,
    /// PostgreSQL public-key PGP (`postgres_pgp_pub_key`)
    PostgresPgpPublicKey,
    /// MySQL `AES_ENCRYPT` (`mysql_aes`)
    MysqlAes,
    /// PostgreSQL raw pgcrypto (`postgres_raw`)
    PostgresRaw,
    /// No encryption (`plaintext`)
    Plaintext,
}

impl ProviderKind {
    /// Every provider kind.
    pub const ALL: [Self; 6] = [
        Self::Local,
        Self::PostgresPgp,
        Self::PostgresPgpPublicKey,
        Self::MysqlAes,
        Self::PostgresRaw,
        Self::Plaintext,
    ];

    /// Returns the identifier used in field configuration.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Local => "aes",
            Self::PostgresPgp => "postgres_pgp",
            Self::PostgresPgpPublicKey => "postgres_pgp_pub_key",
            Self::MysqlAes => "mysql_aes",
            Self::PostgresRaw => "postgres_raw",
            Self::Plaintext => "plaintext",
        }
    }

    /// Returns true if the provider runs its cryptography in the database
    /// and therefore needs a [`Storage`] handle.
    #[must_use]
    pub const fn needs_storage(self) -> bool {
        !matches!(self, Self::Local | Self::Plaintext)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.id().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::Configuration(format!("unknown encryption provider: {wanted}")))
    }
}

/// Builds a provider of the given kind.
///
/// # Errors
///
/// Returns `Error::Configuration` if a required option is missing, or if a
/// database-native provider is requested without a storage handle.
///
/// # Example
///
/// ```
/// use fieldvault::config::ProviderConfig;
/// use fieldvault::provider::registry::{build, ProviderKind};
///
/// let options = ProviderConfig::new().with("key", "k").with("kdf", "sha256");
/// let provider = build("aes".parse::<ProviderKind>().unwrap(), &options, None).unwrap();
/// assert_eq!(provider.scheme(), "aes");
/// ```
pub fn build(
    kind: ProviderKind,
    config: &ProviderConfig,
    storage: Option<Arc<dyn Storage>>,
) -> Result<Arc<dyn EncryptionProvider>, Error> {
    let require_storage = || {
        storage
            .clone()
            .ok_or_else(|| Error::Configuration(format!("provider {kind} requires a storage handle")))
    };

    let provider: Arc<dyn EncryptionProvider> = match kind {
        ProviderKind::Local => Arc::new(LocalSymmetric::from_config(config)?),
        ProviderKind::Plaintext => Arc::new(Plaintext::from_config(config)?),
        ProviderKind::PostgresPgp => {
            Arc::new(DatabaseSymmetric::new(SymmetricDialect::PostgresPgp, config, require_storage()?)?)
        }
        ProviderKind::MysqlAes => {
            Arc::new(DatabaseSymmetric::new(SymmetricDialect::MysqlAes, config, require_storage()?)?)
        }
        ProviderKind::PostgresRaw => {
            Arc::new(DatabaseSymmetric::new(SymmetricDialect::PostgresRaw, config, require_storage()?)?)
        }
        ProviderKind::PostgresPgpPublicKey => {
            Arc::new(DatabaseAsymmetric::from_config(config, require_storage()?)?)
        }
    };

    Ok(provider)
}
