//! Process-wide switches read on every cryptographic call.
//!
//! `Settings` replaces ambient global flags with an explicit context that is
//! shared through an `Arc`. Both switches may be flipped at any time from any
//! thread; readers load them once per operation and never cache the result.

use crate::error::Error;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Environment variable prefix used by [`Settings::from_env`].
pub const ENV_PREFIX: &str = "FIELDVAULT";

/// Shared runtime switches.
///
/// * `stub_encryption` turns encrypt/decrypt into identity functions, for
///   environments where cryptography must be bypassed entirely.
/// * `silence_logs` drops statements containing cryptographic calls instead
///   of logging a redacted version.
#[derive(Debug, Default)]
pub struct Settings {
    stub_encryption: AtomicBool,
    silence_logs: AtomicBool,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(default)]
    stub_encryption: bool,
    #[serde(default)]
    silence_logs: bool,
}

impl From<RawSettings> for Settings {
    fn from(raw: RawSettings) -> Self {
        Self {
            stub_encryption: AtomicBool::new(raw.stub_encryption),
            silence_logs: AtomicBool::new(raw.silence_logs),
        }
    }
}

impl Settings {
    /// Creates settings with both switches off.
    #[must_use]
    pub const fn new() -> Self {
        Self { stub_encryption: AtomicBool::new(false), silence_logs: AtomicBool::new(false) }
    }

    /// Creates a shareable handle with both switches off.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Loads settings from `FIELDVAULT_STUB_ENCRYPTION` and
    /// `FIELDVAULT_SILENCE_LOGS`. Unset variables default to `false`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a variable is set to something that
    /// is not a boolean.
    pub fn from_env() -> Result<Self, Error> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to read environment: {e}")))?;

        let raw: RawSettings = source
            .try_deserialize()
            .map_err(|e| Error::Configuration(format!("invalid settings: {e}")))?;

        Ok(raw.into())
    }

    /// Loads settings from a TOML file with `stub_encryption` and
    /// `silence_logs` keys.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .map_err(|e| {
                Error::Configuration(format!("failed to read {}: {e}", path.display()))
            })?;

        let raw: RawSettings = source
            .try_deserialize()
            .map_err(|e| Error::Configuration(format!("invalid settings: {e}")))?;

        Ok(raw.into())
    }

    /// Returns whether cryptography is currently stubbed out.
    #[must_use]
    pub fn stub_encryption(&self) -> bool {
        self.stub_encryption.load(Ordering::Acquire)
    }

    /// Enables or disables stub encryption.
    pub fn set_stub_encryption(&self, enabled: bool) {
        self.stub_encryption.store(enabled, Ordering::Release);
    }

    /// Returns whether cryptographic statements are dropped from the log.
    #[must_use]
    pub fn silence_logs(&self) -> bool {
        self.silence_logs.load(Ordering::Acquire)
    }

    /// Enables or disables log silencing.
    pub fn set_silence_logs(&self, enabled: bool) {
        self.silence_logs.store(enabled, Ordering::Release);
    }
}
