//! Removal of key material and payloads from statement text.
//!
//! Database-native providers have to hand their key to the query engine as
//! a function argument, so the statement text and any engine error that
//! echoes it contain secrets. A [`Redactor`] rewrites every call to one of
//! its dialect's cryptographic functions so that only the function name
//! survives:
//!
//! ```text
//! SELECT pgp_sym_encrypt('secret', 'key') AS x
//! SELECT pgp_sym_encrypt([FILTERED]) AS x
//! ```

use crate::error::Error;
use crate::provider::EncryptionProvider;
use crate::settings::Settings;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Replacement for a redacted argument list.
pub const FILTERED: &str = "[FILTERED]";

/// Tracing target used by [`TracingSink`].
pub const SQL_LOG_TARGET: &str = "fieldvault::sql";

/// Family of functions whose arguments must be hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedactionDialect {
    /// PostgreSQL pgcrypto symmetric PGP functions
    PgpSym,
    /// PostgreSQL pgcrypto public-key PGP functions
    PgpPublicKey,
    /// MySQL `AES_ENCRYPT` / `AES_DECRYPT`
    MysqlAes,
    /// PostgreSQL pgcrypto raw `encrypt` / `decrypt`
    PostgresRaw,
}

impl RedactionDialect {
    const fn functions(self) -> &'static [&'static str] {
        match self {
            Self::PgpSym => &[
                "pgp_sym_encrypt_bytea",
                "pgp_sym_decrypt_bytea",
                "pgp_sym_encrypt",
                "pgp_sym_decrypt",
                "pgp_key_id",
            ],
            Self::PgpPublicKey => &[
                "pgp_pub_encrypt_bytea",
                "pgp_pub_decrypt_bytea",
                "pgp_pub_encrypt",
                "pgp_pub_decrypt",
                "pgp_key_id",
                "dearmor",
            ],
            Self::MysqlAes => &["aes_encrypt", "aes_decrypt"],
            Self::PostgresRaw => &["encrypt_iv", "decrypt_iv", "encrypt", "decrypt"],
        }
    }
}

/// Rewrites cryptographic function calls in statement text.
///
/// Matching is case-insensitive and anchored on word boundaries, so
/// `PGP_SYM_ENCRYPT(` is redacted while an identifier such as
/// `my_pgp_sym_encrypt_log` is left alone. Nested calls collapse into the
/// outermost one. Quoted literals are skipped while looking for the closing
/// parenthesis; an argument list that never closes is redacted to the end of
/// the text.
///
/// # Example
///
/// ```
/// use fieldvault::redact::{RedactionDialect, Redactor};
///
/// let redactor = Redactor::new(RedactionDialect::MysqlAes).unwrap();
/// let sql = "INSERT INTO t VALUES (aes_encrypt('4111', 'hunter2'))";
///
/// assert_eq!(redactor.redact(sql), "INSERT INTO t VALUES (aes_encrypt([FILTERED]))");
/// ```
#[derive(Clone)]
pub struct Redactor {
    dialect: RedactionDialect,
    pattern: Regex,
}

impl Redactor {
    /// Creates a redactor for the given dialect.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the call pattern cannot be compiled.
    pub fn new(dialect: RedactionDialect) -> Result<Self, Error> {
        let names = dialect.functions().join("|");
        // Function names may be quoted as identifiers
        let pattern = Regex::new(&format!(r#"(?i)["`]?\b(?:{names})\b["`]?\s*\("#))
            .map_err(|e| Error::Configuration(format!("invalid redaction pattern: {e}")))?;
        Ok(Self { dialect, pattern })
    }

    /// Returns the dialect this redactor handles.
    #[must_use]
    pub const fn dialect(&self) -> RedactionDialect {
        self.dialect
    }

    /// Returns true if `text` contains at least one call to redact.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Returns `text` with every matched call's arguments replaced by
    /// [`FILTERED`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        while let Some(m) = self.pattern.find_at(text, last) {
            // `m.end()` sits just past the opening parenthesis
            out.push_str(&text[last..m.end()]);
            out.push_str(FILTERED);
            match closing_paren(text.as_bytes(), m.end()) {
                Some(close) => {
                    out.push(')');
                    last = close + 1;
                }
                None => {
                    last = text.len();
                    break;
                }
            }
        }

        out.push_str(&text[last..]);
        out
    }

    /// Redacts an arbitrary byte payload. Invalid UTF-8 sequences are
    /// replaced first so binary statements are still matched.
    #[must_use]
    pub fn redact_bytes(&self, payload: &[u8]) -> String {
        self.redact(&String::from_utf8_lossy(payload))
    }
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redactor").field("dialect", &self.dialect).finish_non_exhaustive()
    }
}

/// Finds the parenthesis closing the argument list that starts at `start`.
fn closing_paren(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<u8> = None;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    // Over-skipping only widens the redacted span
                    i += 1;
                } else if b == q {
                    if bytes.get(i + 1) == Some(&q) {
                        i += 1;
                    } else {
                        quote = None;
                    }
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }

    None
}

/// Destination for statement text after filtering.
pub trait LogSink: Send + Sync {
    /// Records one statement.
    fn log(&self, statement: &str);
}

/// Forwards statements to `tracing` at debug level on the
/// `fieldvault::sql` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, statement: &str) {
        debug!(target: SQL_LOG_TARGET, statement, "sql");
    }
}

/// Statement log filter installed by the storage collaborator in front of
/// its log sink.
///
/// Every statement is redacted with each registered redactor. When
/// `silence_logs` is on, statements containing any cryptographic call are
/// dropped instead.
pub struct SqlLogFilter {
    settings: Arc<Settings>,
    redactors: Vec<Redactor>,
    sink: Arc<dyn LogSink>,
}

impl SqlLogFilter {
    /// Creates a filter that forwards to [`TracingSink`].
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self::with_sink(settings, Arc::new(TracingSink))
    }

    /// Creates a filter with a custom sink.
    #[must_use]
    pub fn with_sink(settings: Arc<Settings>, sink: Arc<dyn LogSink>) -> Self {
        Self { settings, redactors: Vec::new(), sink }
    }

    /// Registers a redactor. Registering a dialect twice has no effect.
    pub fn register(&mut self, redactor: Redactor) {
        if !self.redactors.iter().any(|r| r.dialect() == redactor.dialect()) {
            self.redactors.push(redactor);
        }
    }

    /// Registers the redactor of a provider, if it has one.
    pub fn register_provider(&mut self, provider: &dyn EncryptionProvider) {
        if let Some(redactor) = provider.redactor() {
            self.register(redactor.clone());
        }
    }

    /// Returns the text that would be logged for `statement`, or `None` if
    /// it is silenced.
    #[must_use]
    pub fn filter(&self, statement: &str) -> Option<String> {
        let matched = self.redactors.iter().any(|r| r.is_match(statement));
        if !matched {
            return Some(statement.to_string());
        }
        if self.settings.silence_logs() {
            return None;
        }

        Some(self.redactors.iter().fold(statement.to_string(), |text, r| r.redact(&text)))
    }

    /// Filters and logs a statement.
    pub fn sql(&self, statement: &str) {
        if let Some(text) = self.filter(statement) {
            self.sink.log(&text);
        }
    }

    /// Filters and logs a statement given as raw bytes.
    pub fn sql_bytes(&self, payload: &[u8]) {
        self.sql(&String::from_utf8_lossy(payload));
    }
}

impl fmt::Debug for SqlLogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlLogFilter")
            .field("redactors", &self.redactors)
            .field("silence_logs", &self.settings.silence_logs())
            .finish_non_exhaustive()
    }
}
