//! Error taxonomy for store, context and facade operations.

use crate::config::ConfigError;
use crate::context::ContextId;
use crate::db::DbError;
use crate::model::{ObjectKey, ValidationError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;
pub type FetchResult<T> = Result<T, FetchError>;
pub type CommitResult<T> = Result<T, CommitError>;

/// Query execution or row mapping failure.
#[derive(Debug)]
pub enum FetchError {
    Db(DbError),
    InvalidData(String),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<rusqlite::Error> for FetchError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Pending-change commit failure. The pending set is left untouched.
#[derive(Debug)]
pub enum CommitError {
    Db(DbError),
    Validation {
        key: ObjectKey,
        error: ValidationError,
    },
    /// Row was changed by another commit since this context loaded it.
    VersionConflict {
        key: ObjectKey,
        expected: i64,
        found: i64,
    },
    /// Row was deleted by another commit since this context loaded it.
    MissingRow(ObjectKey),
    /// Insert of an id that is already stored.
    DuplicateRow(ObjectKey),
}

impl Display for CommitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Validation { key, error } => write!(f, "{key} failed validation: {error}"),
            Self::VersionConflict {
                key,
                expected,
                found,
            } => write!(
                f,
                "{key} was modified concurrently: expected version {expected}, found {found}"
            ),
            Self::MissingRow(key) => write!(f, "{key} no longer exists in the store"),
            Self::DuplicateRow(key) => write!(f, "{key} already exists in the store"),
        }
    }
}

impl Error for CommitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation { error, .. } => Some(error),
            Self::VersionConflict { .. } | Self::MissingRow(_) | Self::DuplicateRow(_) => None,
        }
    }
}

impl From<rusqlite::Error> for CommitError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Top-level error returned by contexts and the repository facade.
#[derive(Debug)]
pub enum StoreError {
    Config(ConfigError),
    /// Backing store failed to open or migrate.
    Open(DbError),
    Commit(CommitError),
    Fetch(FetchError),
    /// Handle used through a context that does not own it.
    CrossContextMisuse {
        key: ObjectKey,
        owner: ContextId,
        accessor: ContextId,
    },
    UnknownObject(ObjectKey),
    ObjectDeleted(ObjectKey),
    DuplicateObject(ObjectKey),
    /// Blocking wait issued from inside the context's own domain.
    ReentrantWait(ContextId),
    /// Domain stopped before delivering a result.
    ContextUnavailable(ContextId),
    Spawn(std::io::Error),
}

impl StoreError {
    /// Whether this error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Commit(CommitError::VersionConflict { .. } | CommitError::MissingRow(_))
        )
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid store config: {err}"),
            Self::Open(err) => write!(f, "failed to open store: {err}"),
            Self::Commit(err) => write!(f, "commit failed: {err}"),
            Self::Fetch(err) => write!(f, "fetch failed: {err}"),
            Self::CrossContextMisuse {
                key,
                owner,
                accessor,
            } => write!(
                f,
                "{key} is owned by context {owner} and cannot be used from context {accessor}"
            ),
            Self::UnknownObject(key) => write!(f, "{key} is not registered in this context"),
            Self::ObjectDeleted(key) => write!(f, "{key} is pending deletion"),
            Self::DuplicateObject(key) => write!(f, "{key} is already registered"),
            Self::ReentrantWait(id) => write!(
                f,
                "blocking wait issued from inside context {id}; use the provided scope instead"
            ),
            Self::ContextUnavailable(id) => write!(f, "context {id} stopped before replying"),
            Self::Spawn(err) => write!(f, "failed to start context domain: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Open(err) => Some(err),
            Self::Commit(err) => Some(err),
            Self::Fetch(err) => Some(err),
            Self::Spawn(err) => Some(err),
            Self::CrossContextMisuse { .. }
            | Self::UnknownObject(_)
            | Self::ObjectDeleted(_)
            | Self::DuplicateObject(_)
            | Self::ReentrantWait(_)
            | Self::ContextUnavailable(_) => None,
        }
    }
}

impl From<ConfigError> for StoreError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<CommitError> for StoreError {
    fn from(value: CommitError) -> Self {
        Self::Commit(value)
    }
}

impl From<FetchError> for StoreError {
    fn from(value: FetchError) -> Self {
        Self::Fetch(value)
    }
}
