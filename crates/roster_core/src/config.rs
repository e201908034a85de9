//! Store configuration.
//!
//! # Responsibility
//! - Describe where the single named store lives and how commits behave.
//! - Stay serializable so hosts can load it from their own config files.
//!
//! # Invariants
//! - `store_name` is a bare file stem: non-blank, no path separators.
//! - `directory = None` selects an in-memory store.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STORE_NAME: &str = "Roster";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const STORE_FILE_EXTENSION: &str = "sqlite3";

/// How a commit treats rows changed by another context since they were loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Reject the commit with `CommitError::VersionConflict`.
    #[default]
    Detect,
    /// Last writer wins; version stamps are bumped but not checked.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidStoreName(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStoreName(name) => write!(
                f,
                "store name `{name}` must be non-blank and must not contain path separators"
            ),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// File stem of the store; the file is `<store_name>.sqlite3`.
    pub store_name: String,
    /// Directory holding the store file. `None` opens an in-memory store.
    pub directory: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
    /// Whether isolated contexts also receive merges of other commits.
    /// The coordinating context always does.
    pub merge_into_isolated: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_name: DEFAULT_STORE_NAME.to_string(),
            directory: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            conflict_policy: ConflictPolicy::default(),
            merge_into_isolated: true,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed config placing the default-named store under `directory`.
    pub fn at_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Resolves the store file path, or `None` for an in-memory store.
    ///
    /// # Errors
    /// - Returns `InvalidStoreName` when `store_name` is blank or path-like.
    pub fn store_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        let name = self.store_name.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ConfigError::InvalidStoreName(self.store_name.clone()));
        }

        Ok(self
            .directory
            .as_ref()
            .map(|dir| dir.join(format!("{name}.{STORE_FILE_EXTENSION}"))))
    }
}
