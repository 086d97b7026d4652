//! In-memory stand-in for a database engine with pgcrypto and MySQL AES
//! functions, shared by the integration tests.
//!
//! The engine really encrypts (ChaCha20-Poly1305 for PGP messages, AES-SIV
//! for the deterministic MySQL and raw pgcrypto functions), keeps rows per
//! table and supports transactions with rollback. Like a real engine, its
//! error messages echo the statement with every bind value interpolated.

#![allow(dead_code)]

use aes_siv::{aead::Aead as _, Aes256SivAead};
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use fieldvault::error::{Error, StorageError};
use fieldvault::lifecycle::{EncryptedModel, EncryptedRecord, PendingWrite};
use fieldvault::redact::{LogSink, SqlLogFilter};
use fieldvault::storage::{Bind, ColumnKind, RowId, SqlValue, Storage, StoredRow, TableStore};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

const SYM_TAG: u8 = 0xC3;
const PUB_TAG: u8 = 0xC1;

type Rows = BTreeMap<RowId, BTreeMap<String, Option<String>>>;

#[derive(Default, Clone)]
struct State {
    tables: BTreeMap<String, Rows>,
    next_id: RowId,
}

/// Fake database engine.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
    kinds: Mutex<HashMap<(String, String), ColumnKind>>,
    fail_update_of: Mutex<Option<RowId>>,
    statements: Mutex<usize>,
    log: Mutex<Option<Arc<SqlLogFilter>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declares a column and its storage kind.
    pub fn column(&self, table: &str, column: &str, kind: ColumnKind) {
        self.kinds.lock().unwrap().insert((table.to_string(), column.to_string()), kind);
    }

    /// Sends every executed statement, interpolated, through `filter`.
    pub fn log_to(&self, filter: Arc<SqlLogFilter>) {
        *self.log.lock().unwrap() = Some(filter);
    }

    /// Makes updates of the given row fail.
    pub fn fail_update_of(&self, id: RowId) {
        *self.fail_update_of.lock().unwrap() = Some(id);
    }

    /// Number of statements executed so far.
    pub fn statements(&self) -> usize {
        *self.statements.lock().unwrap()
    }

    /// Inserts a row and returns its id.
    pub fn insert(&self, table: &str, values: &[(&str, Option<&str>)]) -> RowId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        let row = values.iter().map(|(c, v)| ((*c).to_string(), v.map(str::to_string))).collect();
        state.tables.entry(table.to_string()).or_default().insert(id, row);
        id
    }

    /// Raw stored value of a column.
    pub fn raw(&self, table: &str, id: RowId, column: &str) -> Option<String> {
        self.state.lock().unwrap().tables[table][&id][column].clone()
    }

    /// Reads a row with the given columns.
    pub fn row(&self, table: &str, id: RowId, columns: &[&str]) -> StoredRow {
        let state = self.state.lock().unwrap();
        let values = &state.tables[table][&id];
        columns.iter().fold(StoredRow::new(id), |row, column| {
            row.with(*column, values.get(*column).cloned().flatten())
        })
    }

    /// Persists a record through the model's save hooks, the way a
    /// persistence layer would.
    pub fn save(&self, model: &EncryptedModel, record: &mut EncryptedRecord) -> Result<RowId, Error> {
        let write: PendingWrite = model.before_save(record, self)?;
        let values: Vec<(&str, Option<&str>)> = write.values().collect();
        let id = match write.id() {
            Some(id) => {
                self.update_row(write.table(), id, &values)
                    .map_err(|e| Error::Statement(e.to_string()))?;
                id
            }
            None => self.insert(write.table(), &values),
        };
        model.after_save(record, write);
        record.set_id(id);
        Ok(id)
    }

    fn emit(&self, sql: &str, binds: &[Bind<'_>]) -> String {
        let interpolated = interpolate(sql, binds);
        *self.statements.lock().unwrap() += 1;
        if let Some(filter) = self.log.lock().unwrap().as_ref() {
            filter.sql(&interpolated);
        }
        interpolated
    }

    fn snapshot(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    fn restore(&self, snapshot: State) {
        *self.state.lock().unwrap() = snapshot;
    }
}

impl Storage for FakeEngine {
    fn query_scalar(&self, sql: &str, binds: &[Bind<'_>]) -> Result<Option<SqlValue>, StorageError> {
        let statement = self.emit(sql, binds);
        let fail = |reason: &str| StorageError::Statement(format!("ERROR:  {reason}\nSTATEMENT:  {statement}"));

        if sql.starts_with("SELECT pgp_key_id(") {
            let data = bytea(text(binds, 0)).ok_or_else(|| fail("Wrong key or corrupt data"))?;
            return match data.first() {
                Some(&SYM_TAG) => Ok(Some(SqlValue::Text("SYMKEY".to_string()))),
                Some(&PUB_TAG) if data.len() > 9 => Ok(Some(SqlValue::Text(hex::encode(&data[1..9])))),
                _ => Err(fail("Wrong key or corrupt data")),
            };
        }
        if sql.starts_with("SELECT pgp_sym_encrypt(") {
            return Ok(Some(SqlValue::Bytes(seal(SYM_TAG, &[], text(binds, 1), text(binds, 0)))));
        }
        if sql.starts_with("SELECT pgp_sym_decrypt(") {
            let plain = bytea(text(binds, 0))
                .and_then(|data| open(SYM_TAG, 0, text(binds, 1), &data))
                .ok_or_else(|| fail("Wrong key or corrupt data"))?;
            return Ok(Some(SqlValue::Text(plain)));
        }
        if sql.starts_with("SELECT pgp_pub_encrypt(") {
            let id = armored_id(text(binds, 1), "PUBLIC").ok_or_else(|| fail("Wrong key"))?;
            let key_id = Sha256::digest(id.as_bytes());
            return Ok(Some(SqlValue::Bytes(seal(PUB_TAG, &key_id[..8], &id, text(binds, 0)))));
        }
        if sql.starts_with("SELECT pgp_pub_decrypt(") {
            let id = armored_id(text(binds, 1), "PRIVATE").ok_or_else(|| fail("Wrong key"))?;
            let plain = bytea(text(binds, 0))
                .and_then(|data| open(PUB_TAG, 8, &id, &data))
                .ok_or_else(|| fail("Wrong key or corrupt data"))?;
            return Ok(Some(SqlValue::Text(plain)));
        }
        if sql.starts_with("SELECT AES_ENCRYPT(") {
            return Ok(Some(SqlValue::Bytes(siv_encrypt(text(binds, 1), text(binds, 0)))));
        }
        if sql.starts_with("SELECT AES_DECRYPT(") {
            // MySQL answers a wrong key with NULL, not an error
            let data = match binds.first() {
                Some(Bind::Bytes(data)) => data.to_vec(),
                _ => return Err(fail("expected binary argument")),
            };
            return Ok(Some(siv_decrypt(text(binds, 1), &data).map_or(SqlValue::Null, SqlValue::Bytes)));
        }
        if sql.starts_with("SELECT encrypt_iv(") {
            let key = format!("{}{}", text(binds, 1), text(binds, 2));
            return Ok(Some(SqlValue::Bytes(siv_encrypt(&key, text(binds, 0)))));
        }
        if sql.starts_with("SELECT encrypt(") {
            return Ok(Some(SqlValue::Bytes(siv_encrypt(text(binds, 1), text(binds, 0)))));
        }
        if sql.starts_with("SELECT encode(decrypt_iv(") || sql.starts_with("SELECT encode(decrypt(") {
            let key = if sql.contains("decrypt_iv") {
                format!("{}{}", text(binds, 1), text(binds, 2))
            } else {
                text(binds, 1).to_string()
            };
            let plain = bytea(text(binds, 0))
                .and_then(|data| siv_decrypt(&key, &data))
                .ok_or_else(|| fail("decrypt error: Data not a multiple of block size"))?;
            return String::from_utf8(plain)
                .map(|p| Some(SqlValue::Text(p)))
                .map_err(|_| fail("invalid byte sequence for encoding \"UTF8\""));
        }

        Err(fail("function does not exist"))
    }

    fn nested_transaction(
        &self,
        body: &mut dyn FnMut() -> Result<Option<SqlValue>, StorageError>,
    ) -> Result<Option<SqlValue>, StorageError> {
        let snapshot = self.snapshot();
        let result = body();
        if result.is_err() {
            self.restore(snapshot);
        }
        result
    }

    fn column_kind(&self, table: &str, column: &str) -> Option<ColumnKind> {
        self.kinds.lock().unwrap().get(&(table.to_string(), column.to_string())).cloned()
    }
}

impl TableStore for FakeEngine {
    fn fetch_batch(
        &self,
        table: &str,
        columns: &[&str],
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StorageError> {
        let state = self.state.lock().unwrap();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| StorageError::NotFound(format!("relation \"{table}\" does not exist")))?;

        Ok(rows
            .iter()
            .filter(|(id, _)| after.map_or(true, |after| **id > after))
            .take(limit)
            .map(|(id, values)| {
                columns.iter().fold(StoredRow::new(*id), |row, column| {
                    row.with(*column, values.get(*column).cloned().flatten())
                })
            })
            .collect())
    }

    fn update_row(
        &self,
        table: &str,
        id: RowId,
        values: &[(&str, Option<&str>)],
    ) -> Result<(), StorageError> {
        if *self.fail_update_of.lock().unwrap() == Some(id) {
            return Err(StorageError::Connection("deadlock detected".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        let row = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| StorageError::NotFound(format!("row {id} in {table}")))?;
        for (column, value) in values {
            row.insert((*column).to_string(), value.map(str::to_string));
        }
        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut() -> Result<(), Error>) -> Result<(), Error> {
        let snapshot = self.snapshot();
        let result = body();
        if result.is_err() {
            self.restore(snapshot);
        }
        result
    }
}

/// Log sink that keeps every line.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn log(&self, statement: &str) {
        self.lines.lock().unwrap().push(statement.to_string());
    }
}

/// An ASCII-armored fake PGP key.
pub fn armored(kind: &str, id: &str) -> String {
    format!("-----BEGIN PGP {kind} KEY BLOCK-----\n{id}\n-----END PGP {kind} KEY BLOCK-----")
}

fn armored_id(key: &str, kind: &str) -> Option<String> {
    let mut lines = key.lines();
    let header = lines.next()?;
    if !header.contains(&format!("PGP {kind} KEY")) {
        return None;
    }
    lines.next().map(str::to_string)
}

fn text<'a>(binds: &'a [Bind<'_>], i: usize) -> &'a str {
    match binds.get(i) {
        Some(Bind::Text(s)) => s,
        _ => "",
    }
}

/// Parses PostgreSQL hex `bytea` text.
fn bytea(value: &str) -> Option<Vec<u8>> {
    hex::decode(value.strip_prefix("\\x")?).ok()
}

fn seal(tag: u8, key_id: &[u8], secret: &str, plaintext: &str) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(&Sha256::digest(secret.as_bytes()));
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .expect("Failed to seal");

    let mut out = vec![tag];
    out.extend_from_slice(key_id);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

fn open(tag: u8, key_id_len: usize, secret: &str, data: &[u8]) -> Option<String> {
    if data.first() != Some(&tag) || data.len() < 1 + key_id_len + 12 {
        return None;
    }
    let (nonce, ciphertext) = data[1 + key_id_len..].split_at(12);
    let cipher = ChaCha20Poly1305::new(&Sha256::digest(secret.as_bytes()));
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
    String::from_utf8(plaintext).ok()
}

fn siv(secret: &str) -> Aes256SivAead {
    Aes256SivAead::new_from_slice(&Sha512::digest(secret.as_bytes())).expect("Failed to create cipher")
}

fn siv_encrypt(secret: &str, plaintext: &str) -> Vec<u8> {
    siv(secret).encrypt(&Default::default(), plaintext.as_bytes()).expect("Failed to encrypt")
}

fn siv_decrypt(secret: &str, data: &[u8]) -> Option<Vec<u8>> {
    siv(secret).decrypt(&Default::default(), data).ok()
}

/// Renders a statement with its bind values inlined.
fn interpolate(sql: &str, binds: &[Bind<'_>]) -> String {
    let literal = |bind: &Bind<'_>| match bind {
        Bind::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Bind::Bytes(b) => format!("x'{}'", hex::encode(b)),
    };

    if sql.contains('?') {
        let mut parts = sql.split('?');
        let mut out = parts.next().unwrap_or_default().to_string();
        for (i, part) in parts.enumerate() {
            out.push_str(&binds.get(i).map(literal).unwrap_or_default());
            out.push_str(part);
        }
        return out;
    }

    // Highest index first so `$1` never clobbers `$10`
    binds.iter().enumerate().rev().fold(sql.to_string(), |out, (i, bind)| {
        out.replace(&format!("${}", i + 1), &literal(bind))
    })
}
