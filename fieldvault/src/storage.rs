//! Storage collaborator contracts.
//!
//! The persistence engine, connection handling and statement sanitization
//! live outside this crate. Providers that run their cryptography inside the
//! database only need [`Storage`]; the bulk migration runner additionally
//! needs [`TableStore`].

use crate::error::{Error, StorageError};
use std::collections::BTreeMap;
use std::fmt;

/// A bind parameter for a parameterized statement.
///
/// Values are always bound, never interpolated into statement text.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Bind<'a> {
    /// A text parameter
    Text(&'a str),
    /// A binary parameter
    Bytes(&'a [u8]),
}

impl fmt::Debug for Bind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "Text(<{} bytes>)", s.len()),
            Self::Bytes(b) => write!(f, "Bytes(<{} bytes>)", b.len()),
        }
    }
}

/// An owned bind parameter, used where a statement outlives the call that
/// built it (search predicates).
#[derive(Clone, PartialEq, Eq)]
pub enum OwnedBind {
    /// A text parameter
    Text(String),
    /// A binary parameter
    Bytes(Vec<u8>),
}

impl OwnedBind {
    /// Borrows this parameter.
    #[must_use]
    pub fn as_bind(&self) -> Bind<'_> {
        match self {
            Self::Text(s) => Bind::Text(s),
            Self::Bytes(b) => Bind::Bytes(b),
        }
    }
}

impl fmt::Debug for OwnedBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_bind(), f)
    }
}

/// A scalar returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Text result
    Text(String),
    /// Binary result
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Returns the value as text, decoding binary results as UTF-8.
    ///
    /// Returns `None` for NULL or for binary data that is not valid UTF-8.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s),
            Self::Bytes(b) => String::from_utf8(b).ok(),
        }
    }

    /// Returns the value as raw bytes. Returns `None` for NULL.
    #[must_use]
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.into_bytes()),
            Self::Bytes(b) => Some(b),
        }
    }
}

/// Storage type of a column, as reported by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Unbounded text (`TEXT`, MongoDB `String`)
    Text,
    /// Unbounded binary (`BYTEA`, `BLOB`)
    Binary,
    /// Length-limited text (`VARCHAR(n)`)
    BoundedText(u32),
    /// Length-limited binary (`VARBINARY(n)`)
    BoundedBinary(u32),
    /// Any other type, by name
    Other(String),
}

impl ColumnKind {
    /// Returns true if the column can hold arbitrarily long ciphertext.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Binary => write!(f, "binary"),
            Self::BoundedText(n) => write!(f, "varchar({n})"),
            Self::BoundedBinary(n) => write!(f, "varbinary({n})"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Statement execution and schema introspection supplied by the
/// persistence layer.
///
/// Implementations must be thread-safe (`Send + Sync`): a single provider
/// instance is shared by every record of a type.
pub trait Storage: Send + Sync {
    /// Executes a parameterized statement and returns the first column of
    /// the first row, or `None` if the statement produced no rows.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Statement` if the engine rejects the statement.
    /// The message may contain bind values and must be redacted before it is
    /// surfaced.
    fn query_scalar(&self, sql: &str, binds: &[Bind<'_>]) -> Result<Option<SqlValue>, StorageError>;

    /// Runs `body` inside a new nested transaction (savepoint), so a failing
    /// probe does not abort the caller's transaction.
    ///
    /// The default runs `body` inline.
    ///
    /// # Errors
    ///
    /// Returns whatever `body` or the transaction machinery fails with.
    fn nested_transaction(
        &self,
        body: &mut dyn FnMut() -> Result<Option<SqlValue>, StorageError>,
    ) -> Result<Option<SqlValue>, StorageError> {
        body()
    }

    /// Returns the storage kind of `table.column`, or `None` if the column
    /// does not exist.
    fn column_kind(&self, table: &str, column: &str) -> Option<ColumnKind>;
}

/// Primary key of a stored row.
pub type RowId = i64;

/// A row as read from storage: raw (still encrypted) column values.
///
/// Columns that were not selected are simply absent; a present column may
/// still hold NULL (`None`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRow {
    id: RowId,
    columns: BTreeMap<String, Option<String>>,
}

impl StoredRow {
    /// Creates an empty row with the given id.
    #[must_use]
    pub fn new(id: RowId) -> Self {
        Self { id, columns: BTreeMap::new() }
    }

    /// Adds a column value.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.columns.insert(column.into(), value.map(Into::into));
        self
    }

    /// Sets a column value in place.
    pub fn set(&mut self, column: impl Into<String>, value: Option<String>) {
        self.columns.insert(column.into(), value);
    }

    /// Returns the row id.
    #[must_use]
    pub const fn id(&self) -> RowId {
        self.id
    }

    /// Returns `Some(value)` if the column was selected, `None` otherwise.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Option<&str>> {
        self.columns.get(name).map(Option::as_deref)
    }

    /// Iterates over the selected columns.
    pub fn columns(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value.as_deref()))
    }
}

/// Row access used by the migration runner.
pub trait TableStore {
    /// Fetches up to `limit` rows of `table` with an id greater than
    /// `after` (all rows when `None`), ordered by id, with the given columns.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the rows cannot be read.
    fn fetch_batch(
        &self,
        table: &str,
        columns: &[&str],
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StorageError>;

    /// Writes new raw values for the given columns of one row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the row cannot be updated.
    fn update_row(
        &self,
        table: &str,
        id: RowId,
        values: &[(&str, Option<&str>)],
    ) -> Result<(), StorageError>;

    /// Runs `body` inside a transaction that commits if `body` returns `Ok`
    /// and rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error from `body`, or a commit failure.
    fn transaction(&self, body: &mut dyn FnMut() -> Result<(), Error>) -> Result<(), Error>;
}
