//! On-disk format for locally encrypted values.
//!
//! ```text
//! base64( iv ++ SEPARATOR ++ ciphertext )
//! ```
//!
//! The separator is a fixed byte sequence that is very unlikely to appear in
//! a random IV. This layout is a compatibility surface: changing it makes
//! previously stored data undecryptable.

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Separator between IV and ciphertext.
pub const SEPARATOR: &[u8] = b":fieldvault:";

/// An IV and the ciphertext it was used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl CipherEnvelope {
    /// Creates a new envelope.
    #[must_use]
    pub fn new(iv: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { iv, ciphertext }
    }

    /// Returns the IV.
    #[must_use]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Returns the ciphertext.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Serializes the envelope to its stored text form.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(self.iv.len() + SEPARATOR.len() + self.ciphertext.len());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(SEPARATOR);
        bytes.extend_from_slice(&self.ciphertext);
        STANDARD.encode(bytes)
    }

    /// Parses a stored value.
    ///
    /// Line breaks and other ASCII whitespace inside the base64 text are
    /// ignored, since some writers wrap long encodings.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if:
    /// - The value is not valid base64
    /// - The separator is missing
    /// - The IV or ciphertext part is empty
    pub fn decode(value: &str) -> Result<Self, Error> {
        let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| Error::DecryptionFailed(format!("invalid envelope encoding: {e}")))?;

        let pos = find(&bytes, SEPARATOR)
            .ok_or_else(|| Error::DecryptionFailed("envelope separator missing".to_string()))?;

        let iv = &bytes[..pos];
        let ciphertext = &bytes[pos + SEPARATOR.len()..];

        if iv.is_empty() {
            return Err(Error::DecryptionFailed("envelope IV is empty".to_string()));
        }
        if ciphertext.is_empty() {
            return Err(Error::DecryptionFailed("envelope ciphertext is empty".to_string()));
        }

        Ok(Self { iv: iv.to_vec(), ciphertext: ciphertext.to_vec() })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
