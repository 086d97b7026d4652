//! Bulk encryption and decryption of existing rows.
//!
//! Used when encryption is introduced on a table that already holds
//! plaintext, or removed from one. Rows are processed in id order, one
//! transaction per batch; a failing batch is rolled back and stops the run,
//! leaving earlier batches committed. Re-running after a failure is safe for
//! providers that can tell ciphertext from plaintext.

use crate::error::{Error, StorageError};
use crate::lifecycle::EncryptedModel;
use crate::provider::EncryptionProvider;
use crate::storage::{RowId, StoredRow, TableStore};
use tracing::info;

/// Rows per transaction unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    const fn label(self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }

    /// Returns true if a value the provider classified as `encrypted` is
    /// already in this direction's target state.
    const fn reached(self, encrypted: Option<bool>) -> bool {
        matches!(
            (self, encrypted),
            (Self::Encrypt, Some(true)) | (Self::Decrypt, Some(false))
        )
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Committed batches
    pub batches: usize,
    /// Rows visited
    pub rows: usize,
    /// Values rewritten
    pub transformed: usize,
    /// Values already in the target state
    pub skipped: usize,
}

/// Runs table-wide migrations for one model.
///
/// Stub encryption does not apply here: migrations always run the real
/// provider.
pub struct Migrator<'a> {
    model: &'a EncryptedModel,
    batch_size: usize,
}

impl<'a> Migrator<'a> {
    /// Creates a migrator with the default batch size.
    #[must_use]
    pub const fn new(model: &'a EncryptedModel) -> Self {
        Self { model, batch_size: DEFAULT_BATCH_SIZE }
    }

    /// Sets the number of rows per transaction (at least one).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Encrypts every non-blank plaintext value of the configured fields.
    ///
    /// # Errors
    ///
    /// Returns the first provider or storage error; the batch in progress
    /// is rolled back.
    pub fn encrypt_table(&self, store: &dyn TableStore) -> Result<MigrationReport, Error> {
        self.run(store, Direction::Encrypt)
    }

    /// Decrypts every non-blank value of the configured fields back to
    /// plaintext.
    ///
    /// # Errors
    ///
    /// Returns the first provider or storage error; the batch in progress
    /// is rolled back.
    pub fn decrypt_table(&self, store: &dyn TableStore) -> Result<MigrationReport, Error> {
        self.run(store, Direction::Decrypt)
    }

    fn run(&self, store: &dyn TableStore, direction: Direction) -> Result<MigrationReport, Error> {
        let provider = self.model.raw_provider().as_ref();
        let table = self.model.table();
        let columns: Vec<&str> = self.model.fields().iter().map(|spec| spec.column()).collect();

        if direction == Direction::Decrypt && !provider.can_decrypt() {
            return Err(Error::Configuration(format!(
                "provider {} cannot decrypt {table}: no decryption key configured",
                provider.scheme()
            )));
        }

        let mut report = MigrationReport::default();
        let mut after: Option<RowId> = None;

        loop {
            let mut rows: Vec<StoredRow> = Vec::new();
            let mut transformed = 0;
            let mut skipped = 0;

            // Rows are read inside the transaction that rewrites them
            store.transaction(&mut || {
                transformed = 0;
                skipped = 0;
                rows = store
                    .fetch_batch(table, &columns, after, self.batch_size)
                    .map_err(|e| statement_error(provider, &e))?;

                for row in &rows {
                    let mut updates: Vec<(&str, String)> = Vec::new();
                    for column in &columns {
                        let Some(Some(value)) = row.column(column) else {
                            continue;
                        };
                        if value.is_empty() {
                            continue;
                        }
                        if direction.reached(provider.probe_encrypted(value)) {
                            skipped += 1;
                            continue;
                        }

                        let rewritten = match direction {
                            Direction::Encrypt => provider.encrypt(value)?,
                            Direction::Decrypt => provider.decrypt(value)?,
                        };
                        if rewritten == value {
                            skipped += 1;
                            continue;
                        }
                        updates.push((*column, rewritten));
                    }

                    if !updates.is_empty() {
                        let values: Vec<(&str, Option<&str>)> =
                            updates.iter().map(|(column, raw)| (*column, Some(raw.as_str()))).collect();
                        store
                            .update_row(table, row.id(), &values)
                            .map_err(|e| statement_error(provider, &e))?;
                        transformed += updates.len();
                    }
                }
                Ok(())
            })?;

            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.id());

            report.batches += 1;
            report.rows += rows.len();
            report.transformed += transformed;
            report.skipped += skipped;
            info!(
                table,
                direction = direction.label(),
                batch = report.batches,
                rows = rows.len(),
                "migration batch committed"
            );
        }

        info!(
            table,
            direction = direction.label(),
            batches = report.batches,
            rows = report.rows,
            transformed = report.transformed,
            skipped = report.skipped,
            "migration finished"
        );
        Ok(report)
    }
}

fn statement_error(provider: &dyn EncryptionProvider, err: &StorageError) -> Error {
    let message = err.to_string();
    Error::Statement(provider.redactor().map_or(message.clone(), |r| r.redact(&message)))
}
