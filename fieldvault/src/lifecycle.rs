//! Encryption lifecycle of record fields.
//!
//! An [`EncryptedModel`] describes one record type: its table, its encrypted
//! fields and the provider. It turns stored rows into [`EncryptedRecord`]s
//! and records back into the raw values to persist. The persistence layer
//! calls it at three points:
//!
//! 1. [`EncryptedModel::load`] after a row was read,
//! 2. [`EncryptedModel::before_save`] before a row is written,
//! 3. [`EncryptedModel::after_save`] once the write succeeded.
//!
//! Each record keeps a [`DirtyCache`] of the raw values it last saw in
//! storage. Unchanged fields are written back from that cache verbatim, so
//! saving a record that was only read never re-encrypts anything.

use crate::config::{FieldConfig, ProviderConfig};
use crate::error::Error;
use crate::lazy::LazyPlaintext;
use crate::provider::registry::{self, ProviderKind};
use crate::provider::{EncryptionProvider, SearchPlan, StubAware};
use crate::settings::Settings;
use crate::storage::{ColumnKind, RowId, Storage, StoredRow};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// An encrypted field and the column backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFieldSpec {
    name: String,
    column: String,
    kind: ColumnKind,
}

impl EncryptedFieldSpec {
    /// Creates a text field stored in a column of the same name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { column: name.clone(), name, kind: ColumnKind::Text }
    }

    /// Sets the backing column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Sets the expected storage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: ColumnKind) -> Self {
        self.kind = kind;
        self
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column name.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Expected storage kind.
    #[must_use]
    pub const fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.column.is_empty() {
            return Err(Error::Configuration("field and column names must not be empty".to_string()));
        }
        if !self.kind.is_unbounded() {
            return Err(unbounded_required(&self.column, &self.kind));
        }
        Ok(())
    }
}

fn unbounded_required(column: &str, found: &ColumnKind) -> Error {
    Error::Configuration(format!(
        "Column :{column} must be of type 'text' or 'binary' to be used for encryption, found {found}"
    ))
}

/// Last raw storage value seen per field.
///
/// A field without an entry has never been read from or written to storage
/// and is always encrypted on the next save.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DirtyCache {
    entries: HashMap<String, Option<String>>,
}

impl DirtyCache {
    /// Records the raw value of a field.
    pub fn record(&mut self, field: impl Into<String>, raw: Option<String>) {
        self.entries.insert(field.into(), raw);
    }

    /// Returns the cached raw value, or `None` if the field is new.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<Option<&str>> {
        self.entries.get(field).map(Option::as_deref)
    }

    /// Returns true if the field has a cached raw value.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.entries.contains_key(field)
    }

    /// Forgets every cached value.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for DirtyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Current value of an encrypted field.
pub enum FieldValue {
    /// The column was not loaded; it is neither read nor written.
    Absent,
    /// SQL NULL.
    Null,
    /// Known plaintext.
    Plain(String),
    /// Ciphertext loaded from storage, decrypted on first access.
    Lazy(LazyPlaintext),
}

impl FieldValue {
    fn plaintext(&self) -> Result<Option<&str>, Error> {
        match self {
            Self::Absent | Self::Null => Ok(None),
            Self::Plain(value) => Ok(Some(value)),
            Self::Lazy(lazy) => lazy.value().map(Some),
        }
    }

    fn same_as(&self, other: Option<&str>) -> bool {
        match (self, other) {
            (Self::Null, None) => true,
            (Self::Plain(value), Some(other)) => value == other,
            // An undecryptable value differs from anything assigned
            (Self::Lazy(lazy), Some(other)) => lazy.try_eq(other).unwrap_or(false),
            _ => false,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Null => write!(f, "Null"),
            Self::Plain(_) => write!(f, "Plain(..)"),
            Self::Lazy(lazy) => fmt::Debug::fmt(lazy, f),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: FieldValue,
    /// Value as of the last load or save, kept while the field has unsaved
    /// changes
    previous: Option<FieldValue>,
}

impl Slot {
    const fn new(value: FieldValue) -> Self {
        Self { value, previous: None }
    }

    const fn is_changed(&self) -> bool {
        self.previous.is_some()
    }
}

/// One record's encrypted fields.
///
/// Created by [`EncryptedModel::new_record`] or [`EncryptedModel::load`].
/// `Debug` output never contains plaintext or ciphertext.
#[derive(Debug)]
pub struct EncryptedRecord {
    id: Option<RowId>,
    slots: BTreeMap<String, Slot>,
    cache: DirtyCache,
}

impl EncryptedRecord {
    fn slot(&self, field: &str) -> Result<&Slot, Error> {
        self.slots.get(field).ok_or_else(|| Error::UnknownField(field.to_string()))
    }

    fn slot_mut(&mut self, field: &str) -> Result<&mut Slot, Error> {
        self.slots.get_mut(field).ok_or_else(|| Error::UnknownField(field.to_string()))
    }

    /// Row id, once the record has been stored.
    #[must_use]
    pub const fn id(&self) -> Option<RowId> {
        self.id
    }

    /// Sets the row id assigned by storage.
    pub fn set_id(&mut self, id: RowId) {
        self.id = Some(id);
    }

    /// Returns the plaintext of a field, decrypting a lazy value on first
    /// access.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted, or
    /// the provider's decryption error.
    pub fn get_field(&self, field: &str) -> Result<Option<&str>, Error> {
        self.slot(field)?.value.plaintext()
    }

    /// Returns the raw value of a field as lazy storage, if it was loaded and
    /// not reassigned since.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted.
    pub fn lazy_field(&self, field: &str) -> Result<Option<&LazyPlaintext>, Error> {
        match &self.slot(field)?.value {
            FieldValue::Lazy(lazy) => Ok(Some(lazy)),
            _ => Ok(None),
        }
    }

    /// Assigns a plaintext value. Assigning the current value is a no-op and
    /// leaves the field unchanged; assigning the value of the last load or
    /// save undoes the change.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted.
    pub fn set_field<S: Into<String>>(&mut self, field: &str, value: Option<S>) -> Result<(), Error> {
        let slot = self.slot_mut(field)?;
        let value = value.map(Into::into);

        if slot.value.same_as(value.as_deref()) {
            return Ok(());
        }
        if slot.previous.as_ref().is_some_and(|previous| previous.same_as(value.as_deref())) {
            if let Some(previous) = slot.previous.take() {
                slot.value = previous;
            }
            return Ok(());
        }

        let current = std::mem::replace(&mut slot.value, value.map_or(FieldValue::Null, FieldValue::Plain));
        if slot.previous.is_none() {
            slot.previous = Some(current);
        }
        Ok(())
    }

    /// Returns the plaintext of a field as of the last load or save.
    ///
    /// For an unchanged field this is the current value. A field whose
    /// column was not loaded reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted, or
    /// the provider's decryption error.
    pub fn field_was(&self, field: &str) -> Result<Option<&str>, Error> {
        let slot = self.slot(field)?;
        slot.previous.as_ref().unwrap_or(&slot.value).plaintext()
    }

    /// Returns `(previous, current)` plaintext for a changed field, `None`
    /// if the field is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted, or
    /// the provider's decryption error.
    pub fn field_change(&self, field: &str) -> Result<Option<(Option<&str>, Option<&str>)>, Error> {
        let slot = self.slot(field)?;
        match &slot.previous {
            Some(previous) => Ok(Some((previous.plaintext()?, slot.value.plaintext()?))),
            None => Ok(None),
        }
    }

    /// Discards an unsaved assignment, restoring the value of the last load
    /// or save. The stored ciphertext is reused on the next save.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted.
    pub fn reset_field(&mut self, field: &str) -> Result<(), Error> {
        let slot = self.slot_mut(field)?;
        if let Some(previous) = slot.previous.take() {
            slot.value = previous;
        }
        Ok(())
    }

    /// Returns true if the field was assigned a different value since the
    /// last load or save.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` for a field that is not encrypted.
    pub fn is_changed(&self, field: &str) -> Result<bool, Error> {
        Ok(self.slot(field)?.is_changed())
    }

    /// Names of changed fields.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&str> {
        self.slots.iter().filter(|(_, slot)| slot.is_changed()).map(|(name, _)| name.as_str()).collect()
    }

    /// Last raw value seen in storage for a field, `None` if the field is new.
    #[must_use]
    pub fn cached_raw(&self, field: &str) -> Option<Option<&str>> {
        self.cache.get(field)
    }
}

/// Raw values to persist, produced by [`EncryptedModel::before_save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    table: String,
    id: Option<RowId>,
    entries: Vec<PendingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    field: String,
    column: String,
    raw: Option<String>,
}

impl PendingWrite {
    /// Target table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Target row, `None` for an insert.
    #[must_use]
    pub const fn id(&self) -> Option<RowId> {
        self.id
    }

    /// `(column, raw value)` pairs to write.
    pub fn values(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|e| (e.column.as_str(), e.raw.as_deref()))
    }

    /// Raw value to write for a column, `None` if the column is not written.
    #[must_use]
    pub fn value(&self, column: &str) -> Option<Option<&str>> {
        self.entries.iter().find(|e| e.column == column).map(|e| e.raw.as_deref())
    }

    /// Returns true if nothing is written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum ProviderSource {
    Id(String),
    Instance(Arc<dyn EncryptionProvider>),
}

/// Builder for [`EncryptedModel`].
///
/// # Example
///
/// ```
/// use fieldvault::lifecycle::EncryptedModel;
///
/// let model = EncryptedModel::builder("users", "aes")
///     .field("ssn")
///     .field("notes")
///     .option("key", "super_good_password")
///     .option("kdf", "sha256")
///     .build()
///     .unwrap();
///
/// let mut user = model.new_record();
/// user.set_field("ssn", Some("123-45-6789")).unwrap();
/// assert_eq!(user.get_field("ssn").unwrap(), Some("123-45-6789"));
/// ```
pub struct ModelBuilder {
    table: String,
    provider: ProviderSource,
    fields: Vec<EncryptedFieldSpec>,
    options: ProviderConfig,
    storage: Option<Arc<dyn Storage>>,
    settings: Option<Arc<Settings>>,
    lazy: bool,
}

impl ModelBuilder {
    /// Adds a text field stored in a column of the same name.
    #[must_use]
    pub fn field(self, name: impl Into<String>) -> Self {
        self.field_spec(EncryptedFieldSpec::new(name))
    }

    /// Adds a field with an explicit column and kind.
    #[must_use]
    pub fn field_spec(mut self, spec: EncryptedFieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Adds a provider option.
    #[must_use]
    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name, value);
        self
    }

    /// Replaces all provider options.
    #[must_use]
    pub fn options(mut self, options: ProviderConfig) -> Self {
        self.options = options;
        self
    }

    /// Uses an already constructed provider instead of the identifier.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn EncryptionProvider>) -> Self {
        self.provider = ProviderSource::Instance(provider);
        self
    }

    /// Storage handle for database-native providers.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Shared settings; a private instance with both switches off is used
    /// otherwise.
    #[must_use]
    pub fn settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Decrypts every field when a row is loaded instead of on first access.
    #[must_use]
    pub const fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }

    /// Validates the field specs and constructs the provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no fields are configured, a field
    /// is listed twice or has a bounded kind, the provider identifier is
    /// unknown, or the provider rejects its options.
    pub fn build(self) -> Result<EncryptedModel, Error> {
        if self.fields.is_empty() {
            return Err(Error::Configuration(format!("no encrypted fields configured for {}", self.table)));
        }

        let mut seen = HashSet::new();
        for spec in &self.fields {
            spec.validate()?;
            if !seen.insert(spec.name()) {
                return Err(Error::Configuration(format!("field {} configured twice", spec.name())));
            }
        }

        let inner = match self.provider {
            ProviderSource::Instance(provider) => provider,
            ProviderSource::Id(id) => {
                let kind: ProviderKind = id.parse()?;
                registry::build(kind, &self.options, self.storage)?
            }
        };
        let settings = self.settings.unwrap_or_else(Settings::shared);
        let provider: Arc<dyn EncryptionProvider> =
            Arc::new(StubAware::new(Arc::clone(&inner), Arc::clone(&settings)));

        debug!(
            table = %self.table,
            scheme = inner.scheme(),
            fields = self.fields.len(),
            lazy = self.lazy,
            "encrypted model configured"
        );

        Ok(EncryptedModel {
            table: self.table,
            specs: self.fields,
            provider,
            inner,
            settings,
            lazy: self.lazy,
        })
    }
}

/// Encryption configuration of one record type.
pub struct EncryptedModel {
    table: String,
    specs: Vec<EncryptedFieldSpec>,
    provider: Arc<dyn EncryptionProvider>,
    inner: Arc<dyn EncryptionProvider>,
    settings: Arc<Settings>,
    lazy: bool,
}

impl EncryptedModel {
    /// Starts configuring a model for `table` using the provider with the
    /// given identifier (`aes`, `postgres_pgp`, ...).
    #[must_use]
    pub fn builder(table: impl Into<String>, provider: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            table: table.into(),
            provider: ProviderSource::Id(provider.into()),
            fields: Vec::new(),
            options: ProviderConfig::new(),
            storage: None,
            settings: None,
            lazy: true,
        }
    }

    /// Builds a model from a deserialized field configuration.
    ///
    /// # Errors
    ///
    /// See [`ModelBuilder::build`].
    pub fn from_config(
        table: impl Into<String>,
        config: &FieldConfig,
        storage: Option<Arc<dyn Storage>>,
        settings: Arc<Settings>,
    ) -> Result<Self, Error> {
        let mut builder = Self::builder(table, config.provider.clone())
            .options(config.options.clone())
            .settings(settings);
        for field in &config.fields {
            builder = builder.field(field.clone());
        }
        if let Some(storage) = storage {
            builder = builder.storage(storage);
        }
        if !config.lazy {
            builder = builder.eager();
        }
        builder.build()
    }

    /// Table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Configured fields.
    #[must_use]
    pub fn fields(&self) -> &[EncryptedFieldSpec] {
        &self.specs
    }

    /// The provider, honoring `stub_encryption`.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn EncryptionProvider> {
        &self.provider
    }

    /// The provider without the stub switch, for bulk migrations.
    pub(crate) fn raw_provider(&self) -> &Arc<dyn EncryptionProvider> {
        &self.inner
    }

    /// Shared settings.
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Looks up a field spec by field name.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` if the field is not encrypted.
    pub fn spec(&self, field: &str) -> Result<&EncryptedFieldSpec, Error> {
        self.specs
            .iter()
            .find(|spec| spec.name == field)
            .ok_or_else(|| Error::UnknownField(field.to_string()))
    }

    /// Creates an unsaved record with every field NULL and new.
    #[must_use]
    pub fn new_record(&self) -> EncryptedRecord {
        let slots = self
            .specs
            .iter()
            .map(|spec| (spec.name.clone(), Slot::new(FieldValue::Null)))
            .collect();
        EncryptedRecord { id: None, slots, cache: DirtyCache::default() }
    }

    /// Wraps a freshly read row.
    ///
    /// Columns missing from the row are left absent and are not decrypted.
    /// The returned record has no changes.
    ///
    /// # Errors
    ///
    /// In eager mode, returns the provider's decryption error.
    pub fn load(&self, row: &StoredRow) -> Result<EncryptedRecord, Error> {
        let mut record = EncryptedRecord {
            id: Some(row.id()),
            slots: BTreeMap::new(),
            cache: DirtyCache::default(),
        };

        for spec in &self.specs {
            let value = match row.column(&spec.column) {
                None => FieldValue::Absent,
                Some(None) => {
                    record.cache.record(spec.name.clone(), None);
                    FieldValue::Null
                }
                Some(Some(raw)) => {
                    record.cache.record(spec.name.clone(), Some(raw.to_string()));
                    if self.lazy {
                        FieldValue::Lazy(LazyPlaintext::new(Arc::clone(&self.provider), raw))
                    } else {
                        FieldValue::Plain(self.provider.decrypt(raw)?)
                    }
                }
            };
            record.slots.insert(spec.name.clone(), Slot::new(value));
        }

        Ok(record)
    }

    /// Checks that every configured column exists and can hold ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for a missing or bounded column.
    pub fn validate_columns(&self, storage: &dyn Storage) -> Result<(), Error> {
        for spec in &self.specs {
            match storage.column_kind(&self.table, &spec.column) {
                None => {
                    return Err(Error::Configuration(format!(
                        "Column :{} does not exist in {}",
                        spec.column, self.table
                    )))
                }
                Some(kind) if !kind.is_unbounded() => {
                    return Err(unbounded_required(&spec.column, &kind));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Computes the raw values to persist for `record`.
    ///
    /// Changed and new fields are encrypted; unchanged fields are written
    /// back from the dirty cache byte for byte. Absent fields are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if column validation fails, or the
    /// provider's error for a field that cannot be encrypted. Nothing is
    /// written in either case.
    pub fn before_save(&self, record: &EncryptedRecord, storage: &dyn Storage) -> Result<PendingWrite, Error> {
        self.validate_columns(storage)?;

        let mut entries = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let slot = record.slot(&spec.name)?;
            if matches!(slot.value, FieldValue::Absent) {
                continue;
            }

            let raw = match record.cache.get(&spec.name) {
                Some(cached) if !slot.is_changed() => cached.map(str::to_string),
                _ => match slot.value.plaintext()? {
                    Some(plaintext) => Some(self.provider.encrypt(plaintext)?),
                    None => None,
                },
            };

            entries.push(PendingEntry { field: spec.name.clone(), column: spec.column.clone(), raw });
        }

        Ok(PendingWrite { table: self.table.clone(), id: record.id, entries })
    }

    /// Records a successful write: the written raw values become the dirty
    /// cache and change tracking is cleared. Assigned plaintext stays
    /// readable without decrypting.
    pub fn after_save(&self, record: &mut EncryptedRecord, write: PendingWrite) {
        if let Some(id) = write.id {
            record.id = Some(id);
        }
        for entry in write.entries {
            record.cache.record(entry.field, entry.raw);
        }
        for slot in record.slots.values_mut() {
            slot.previous = None;
        }
    }

    /// Plans a search for records whose `field` equals `criteria`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownField` if the field is not encrypted, or the
    /// provider's search error.
    pub fn search_by_plaintext(&self, field: &str, criteria: &str) -> Result<SearchPlan, Error> {
        let spec = self.spec(field)?;
        self.provider.search(&spec.column, criteria)
    }
}

impl fmt::Debug for EncryptedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedModel")
            .field("table", &self.table)
            .field("fields", &self.specs)
            .field("scheme", &self.inner.scheme())
            .field("lazy", &self.lazy)
            .finish_non_exhaustive()
    }
}
