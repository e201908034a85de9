//! Durable backing store shared by every context.
//!
//! # Responsibility
//! - Own the single SQLite connection of one opened store.
//! - Execute fetches and atomic multi-row commits.
//! - Publish a `ChangeNotification` for every successful commit.
//!
//! # Invariants
//! - The connection lock is held for exactly one fetch or one commit
//!   transaction, never across a context job.
//! - A commit either applies every pending write or none of them.
//! - Validation runs on every record before any SQL is executed.

pub mod error;
pub mod request;
mod rows;

use crate::config::{ConflictPolicy, StoreConfig};
use crate::context::{ContextId, ExecutionDomain};
use crate::db::{open_db_in_memory, open_db_with_timeout};
use crate::model::{Entity, EntityKind, EntityRecord, ObjectKey};
use log::{debug, error, info};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;

pub use error::{CommitError, CommitResult, FetchError, FetchResult, StoreError, StoreResult};
pub use request::{Comparison, FetchRequest, Predicate, SortDescriptor, SortKey};

pub(crate) use rows::StoredRecord;

/// One row-level write of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingWrite {
    Insert(EntityRecord),
    Update {
        record: EntityRecord,
        expected_version: i64,
    },
    Delete {
        key: ObjectKey,
        expected_version: i64,
    },
}

impl PendingWrite {
    pub(crate) fn key(&self) -> ObjectKey {
        match self {
            Self::Insert(record) | Self::Update { record, .. } => record.key(),
            Self::Delete { key, .. } => *key,
        }
    }
}

/// Keys touched by one successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub inserted: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    pub deleted: Vec<ObjectKey>,
}

impl ChangeSet {
    pub(crate) fn from_writes(writes: &[PendingWrite]) -> Self {
        let mut changes = Self::default();
        for write in writes {
            match write {
                PendingWrite::Insert(record) => changes.inserted.push(record.key()),
                PendingWrite::Update { record, .. } => changes.updated.push(record.key()),
                PendingWrite::Delete { key, .. } => changes.deleted.push(*key),
            }
        }
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Whether `key` was inserted, updated or deleted.
    pub fn contains(&self, key: ObjectKey) -> bool {
        self.inserted.contains(&key) || self.updated.contains(&key) || self.deleted.contains(&key)
    }
}

/// Published to subscribers after each successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub origin: ContextId,
    pub domain: ExecutionDomain,
    pub changes: ChangeSet,
}

/// Counters of statements that reached SQLite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Commit transactions started.
    pub commits: u64,
    /// Fetch and single-row load queries executed.
    pub fetches: u64,
}

struct StoreInner {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    conflict_policy: ConflictPolicy,
    merge_into_isolated: bool,
    commits: AtomicU64,
    fetches: AtomicU64,
    subscribers: Mutex<Vec<Sender<ChangeNotification>>>,
}

/// Cloneable handle to one opened store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens the store described by `config`, applying migrations.
    ///
    /// The configured directory must already exist.
    ///
    /// # Errors
    /// - `StoreError::Config` when the store name is invalid.
    /// - `StoreError::Open` when SQLite cannot open or migrate the file.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let path = config.store_path()?;
        let conn = match path.as_ref() {
            Some(path) => open_db_with_timeout(path, config.busy_timeout()),
            None => open_db_in_memory(),
        }
        .map_err(StoreError::Open)?;

        Ok(Self::from_connection(
            conn,
            path,
            config.conflict_policy,
            config.merge_into_isolated,
        ))
    }

    /// Opens an in-memory store with default settings.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Opens a file store at an explicit path with default settings.
    pub fn open_at(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = open_db_with_timeout(path, StoreConfig::default().busy_timeout())
            .map_err(StoreError::Open)?;
        Ok(Self::from_connection(
            conn,
            Some(path.to_path_buf()),
            ConflictPolicy::default(),
            true,
        ))
    }

    fn from_connection(
        conn: Connection,
        path: Option<PathBuf>,
        conflict_policy: ConflictPolicy,
        merge_into_isolated: bool,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path,
                conflict_policy,
                merge_into_isolated,
                commits: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Store file path, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.inner.conflict_policy
    }

    pub fn merges_into_isolated(&self) -> bool {
        self.inner.merge_into_isolated
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            commits: self.inner.commits.load(Ordering::SeqCst),
            fetches: self.inner.fetches.load(Ordering::SeqCst),
        }
    }

    /// Registers a receiver for every subsequent successful commit.
    ///
    /// Dropped receivers are pruned on the next publish.
    pub fn subscribe(&self) -> Receiver<ChangeNotification> {
        let (sender, receiver) = mpsc::channel();
        self.inner.subscribers.lock().push(sender);
        receiver
    }

    pub(crate) fn publish(&self, notification: ChangeNotification) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|sender| sender.send(notification.clone()).is_ok());
    }

    /// Runs `request` against the committed rows of `T`.
    pub(crate) fn fetch<T: Entity>(
        &self,
        request: &FetchRequest<T>,
    ) -> FetchResult<Vec<StoredRecord>> {
        let (tail, binds) = request.to_sql();
        self.select(T::KIND, &tail, binds)
    }

    /// Loads the committed row for `key`, if any.
    pub(crate) fn load(&self, key: ObjectKey) -> FetchResult<Option<StoredRecord>> {
        let started_at = Instant::now();
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let conn = self.inner.conn.lock();
        let result = rows::select_record(&conn, key);
        drop(conn);

        match &result {
            Ok(found) => debug!(
                "event=store_load module=store status=ok kind={} found={} duration_ms={}",
                key.kind,
                found.is_some(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=store_load module=store status=error kind={} duration_ms={} error={}",
                key.kind,
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    fn select(
        &self,
        kind: EntityKind,
        tail: &str,
        binds: Vec<rusqlite::types::Value>,
    ) -> FetchResult<Vec<StoredRecord>> {
        let started_at = Instant::now();
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let conn = self.inner.conn.lock();
        let result = rows::select_records(&conn, kind, tail, binds);
        drop(conn);

        match &result {
            Ok(records) => debug!(
                "event=store_fetch module=store status=ok kind={} rows={} duration_ms={}",
                kind,
                records.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=store_fetch module=store status=error kind={} duration_ms={} error={}",
                kind,
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    /// Applies `writes` in one immediate transaction.
    ///
    /// Returns the new version of every inserted or updated row, in write order.
    ///
    /// # Errors
    /// - `CommitError::Validation` before any SQL runs.
    /// - `CommitError::VersionConflict` / `MissingRow` under
    ///   `ConflictPolicy::Detect` when a row changed since it was loaded.
    /// - `CommitError::Db` on SQLite failure; the transaction is rolled back.
    pub(crate) fn commit(&self, writes: &[PendingWrite]) -> CommitResult<Vec<(ObjectKey, i64)>> {
        for write in writes {
            match write {
                PendingWrite::Insert(record) | PendingWrite::Update { record, .. } => {
                    record
                        .validate()
                        .map_err(|error| CommitError::Validation {
                            key: record.key(),
                            error,
                        })?;
                }
                PendingWrite::Delete { .. } => {}
            }
        }

        let policy = self.inner.conflict_policy;
        let mut conn = self.inner.conn.lock();
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut versions = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                PendingWrite::Insert(record) => {
                    rows::insert_record(&tx, record)?;
                    versions.push((record.key(), 1));
                }
                PendingWrite::Update {
                    record,
                    expected_version,
                } => {
                    let version = rows::update_record(&tx, record, *expected_version, policy)?;
                    versions.push((record.key(), version));
                }
                PendingWrite::Delete {
                    key,
                    expected_version,
                } => rows::delete_record(&tx, *key, *expected_version, policy)?,
            }
        }

        for write in writes {
            if let PendingWrite::Insert(EntityRecord::Company(company))
            | PendingWrite::Update {
                record: EntityRecord::Company(company),
                ..
            } = write
            {
                rows::write_company_positions(&tx, company)?;
            }
        }

        tx.commit()?;
        info!(
            "event=store_commit module=store status=ok writes={}",
            writes.len()
        );
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingWrite, Store};
    use crate::model::{Company, Entity, ObjectKey};
    use crate::store::{CommitError, FetchRequest};

    #[test]
    fn commit_assigns_version_one_then_increments() {
        let store = Store::open_in_memory().unwrap();
        let mut company = Company::new();
        company.name = Some("Acme".to_string());

        let versions = store
            .commit(&[PendingWrite::Insert(company.clone().into_record())])
            .unwrap();
        assert_eq!(versions, vec![(company.key(), 1)]);

        company.name = Some("Acme2".to_string());
        let versions = store
            .commit(&[PendingWrite::Update {
                record: company.clone().into_record(),
                expected_version: 1,
            }])
            .unwrap();
        assert_eq!(versions, vec![(company.key(), 2)]);

        let stored = store.load(company.key()).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.record, company.into_record());
        assert_eq!(store.stats().commits, 2);
    }

    #[test]
    fn failed_commit_rolls_back_every_write() {
        let store = Store::open_in_memory().unwrap();
        let existing = Company::new();
        store
            .commit(&[PendingWrite::Insert(existing.clone().into_record())])
            .unwrap();

        let fresh = Company::new();
        let error = store
            .commit(&[
                PendingWrite::Insert(fresh.clone().into_record()),
                PendingWrite::Delete {
                    key: existing.key(),
                    expected_version: 7,
                },
            ])
            .unwrap_err();
        assert!(matches!(
            error,
            CommitError::VersionConflict {
                expected: 7,
                found: 1,
                ..
            }
        ));

        let rows = store.fetch(&FetchRequest::<Company>::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.key(), existing.key());
        assert!(store.load(ObjectKey::of::<Company>(fresh.id())).unwrap().is_none());
    }

    #[test]
    fn validation_failure_runs_no_sql() {
        let store = Store::open_in_memory().unwrap();
        let invalid = Company::with_id(uuid::Uuid::nil());

        let error = store
            .commit(&[PendingWrite::Insert(invalid.into_record())])
            .unwrap_err();
        assert!(matches!(error, CommitError::Validation { .. }));
        assert_eq!(store.stats().commits, 0);
    }
}
