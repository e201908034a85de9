//! Transactional contexts and their manager.
//!
//! # Responsibility
//! - Hand out the single coordinating context and independent isolated
//!   contexts, each confined to its own execution domain.
//! - Track which context owns each uncommitted insert.
//! - Propagate committed changes into every other live context.
//!
//! # Invariants
//! - `coordinating_context` returns the same context for the manager's
//!   lifetime.
//! - An uncommitted insert is owned by exactly one context.
//! - A commit's merge is enqueued on every other live context before the
//!   commit returns, so it runs before any job submitted afterwards.

mod domain;
mod handle;
mod scope;

use crate::model::ObjectKey;
use crate::store::{ChangeNotification, ChangeSet, Store, StoreResult};
use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

pub use domain::Context;
pub use handle::{EntityHandle, Snapshot};
pub use scope::Scope;

use domain::ContextInner;
use scope::MergeBatch;

/// Process-unique identifier of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of domain a call should run in. Always chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionDomain {
    /// The single serialized domain for display-facing reads and commits.
    Coordinating,
    /// An independent background domain.
    Isolated,
}

impl ExecutionDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinating => "coordinating",
            Self::Isolated => "isolated",
        }
    }
}

impl Display for ExecutionDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of committing a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was pending; the store was not touched.
    NoChanges,
    Committed(ChangeSet),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn changes(&self) -> Option<&ChangeSet> {
        match self {
            Self::NoChanges => None,
            Self::Committed(changes) => Some(changes),
        }
    }
}

/// State shared by the manager and every domain worker.
pub(crate) struct ManagerShared {
    store: Store,
    contexts: Mutex<HashMap<ContextId, Weak<ContextInner>>>,
    in_flight: Mutex<HashMap<ObjectKey, ContextId>>,
    next_context_id: AtomicU64,
}

impl ManagerShared {
    fn next_context_id(&self) -> ContextId {
        ContextId::new(self.next_context_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register(&self, context: &Arc<ContextInner>) {
        self.contexts
            .lock()
            .insert(context.id(), Arc::downgrade(context));
    }

    fn unregister(&self, id: ContextId) {
        self.contexts.lock().remove(&id);
        self.in_flight.lock().retain(|_, owner| *owner != id);
    }

    /// Records `owner` as the owner of an uncommitted insert.
    /// Returns the current owner when another context already holds `key`.
    fn claim(&self, key: ObjectKey, owner: ContextId) -> Result<(), ContextId> {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(&key) {
            Some(current) if *current != owner => Err(*current),
            _ => {
                in_flight.insert(key, owner);
                Ok(())
            }
        }
    }

    fn release(&self, key: ObjectKey, owner: ContextId) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&key) == Some(&owner) {
            in_flight.remove(&key);
        }
    }

    fn owner_of(&self, key: ObjectKey) -> Option<ContextId> {
        self.in_flight.lock().get(&key).copied()
    }

    fn broadcast_merge(&self, batch: MergeBatch) {
        let origin = batch.origin;
        let batch = Arc::new(batch);
        let targets: Vec<Arc<ContextInner>> = self
            .contexts
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|context| context.id() != origin)
            .filter(|context| {
                context.domain() == ExecutionDomain::Coordinating
                    || self.store.merges_into_isolated()
            })
            .collect();

        let mut delivered = 0;
        for context in &targets {
            if context.enqueue_merge(Arc::clone(&batch)) {
                delivered += 1;
            }
        }
        debug!(
            "event=context_merge module=context status=enqueued origin={} targets={}",
            origin, delivered
        );
    }
}

/// Produces and tracks contexts over one store.
///
/// Cloning shares the same coordinating context and registry.
#[derive(Clone)]
pub struct ContextManager {
    shared: Arc<ManagerShared>,
    coordinating: Arc<OnceCell<Context>>,
}

impl ContextManager {
    pub fn new(store: Store) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                store,
                contexts: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_context_id: AtomicU64::new(1),
            }),
            coordinating: Arc::new(OnceCell::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    /// The single coordinating context, started on first use.
    ///
    /// # Errors
    /// - `Spawn` when the domain thread cannot be started.
    pub fn coordinating_context(&self) -> StoreResult<Context> {
        self.coordinating
            .get_or_try_init(|| Context::spawn(&self.shared, ExecutionDomain::Coordinating))
            .cloned()
    }

    /// A new context on its own isolated domain.
    ///
    /// # Errors
    /// - `Spawn` when the domain thread cannot be started.
    pub fn new_isolated_context(&self) -> StoreResult<Context> {
        Context::spawn(&self.shared, ExecutionDomain::Isolated)
    }

    /// Commits `context`; see [`Scope::save`].
    pub fn commit(&self, context: &Context) -> StoreResult<CommitOutcome> {
        context.save()
    }

    /// Runs `task` on a one-shot isolated context discarded afterwards.
    pub fn perform_background_task<F>(&self, task: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Scope<'_>) + Send + 'static,
    {
        let context = self.new_isolated_context()?;
        context.perform(task)
    }

    /// Context owning the uncommitted insert `key`, if any.
    pub fn owner_of(&self, key: ObjectKey) -> Option<ContextId> {
        self.shared.owner_of(key)
    }

    /// Looks up a live context by id.
    pub fn context(&self, id: ContextId) -> Option<Context> {
        self.shared
            .contexts
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Context::from_inner)
    }

    /// Ids of every live context, ascending.
    pub fn live_contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .shared
            .contexts
            .lock()
            .iter()
            .filter(|(_, context)| context.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Receives a notification for every subsequent successful commit.
    pub fn subscribe(&self) -> Receiver<ChangeNotification> {
        self.shared.store.subscribe()
    }
}
