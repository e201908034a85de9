//! Entity repository facade over the context manager.
//!
//! # Responsibility
//! - Offer CRUD and fetch operations parameterized by entity type.
//! - Run every call inside the context selected by the caller's explicit
//!   `ExecutionDomain`, committing where the operation calls for it.
//!
//! # Invariants
//! - The domain is never inferred from the calling thread.
//! - Handles are only honored by the context that issued them.
//! - Fetch failures are errors, never an empty result.
//! - A commit that fails inside `insert`, `update` or `delete` discards every
//!   pending change of that context, so later calls start clean. The error is
//!   returned unchanged; callers re-fetch before retrying.

use crate::config::StoreConfig;
use crate::context::{
    CommitOutcome, Context, ContextManager, EntityHandle, ExecutionDomain, Scope, Snapshot,
};
use crate::model::{Entity, EntityId};
use crate::store::{FetchRequest, Predicate, SortDescriptor, Store, StoreError, StoreResult};
use once_cell::sync::OnceCell;

/// Typed CRUD contract used by services.
pub trait EntityRepository {
    /// Registers a new, empty `T` in the chosen context and returns its handle.
    fn new_entity<T: Entity>(&self, domain: ExecutionDomain) -> StoreResult<EntityHandle<T>>;

    /// Same as [`EntityRepository::new_entity`] with a caller-provided id.
    fn new_entity_with_id<T: Entity>(
        &self,
        id: EntityId,
        domain: ExecutionDomain,
    ) -> StoreResult<EntityHandle<T>>;

    /// Commits the chosen context, which must own `handle`.
    ///
    /// On commit failure the context's pending changes are rolled back.
    fn insert<T: Entity>(
        &self,
        handle: EntityHandle<T>,
        domain: ExecutionDomain,
    ) -> StoreResult<CommitOutcome>;

    /// Commits whatever is pending on the chosen context.
    ///
    /// On commit failure the context's pending changes are rolled back.
    fn update(&self, domain: ExecutionDomain) -> StoreResult<CommitOutcome>;

    /// Discards every pending change of the chosen context.
    fn rollback(&self, domain: ExecutionDomain) -> StoreResult<()>;

    /// Applies `mutate` to the object inside its owning domain. Not committed.
    fn modify<T, R, F>(&self, handle: EntityHandle<T>, mutate: F) -> StoreResult<R>
    where
        T: Entity,
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static;

    /// Marks the object deleted in the chosen context and commits.
    ///
    /// On commit failure the context's pending changes are rolled back.
    fn delete<T: Entity>(
        &self,
        handle: EntityHandle<T>,
        domain: ExecutionDomain,
    ) -> StoreResult<CommitOutcome>;

    fn fetch<T: Entity>(
        &self,
        request: FetchRequest<T>,
        domain: ExecutionDomain,
    ) -> StoreResult<Vec<Snapshot<T>>>;

    /// First match of `predicate` under `sort`, or `None`.
    fn fetch_single<T: Entity>(
        &self,
        predicate: Option<Predicate<T::Field>>,
        sort: Vec<SortDescriptor<T::Field>>,
        domain: ExecutionDomain,
    ) -> StoreResult<Option<Snapshot<T>>>;

    /// Runs `work` with direct scope access inside the chosen domain.
    fn with_scope<R, F>(&self, domain: ExecutionDomain, work: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Scope<'_>) -> R + Send + 'static;

    /// Every committed `T` visible to the chosen context, in insertion order.
    fn fetch_all<T: Entity>(&self, domain: ExecutionDomain) -> StoreResult<Vec<Snapshot<T>>> {
        self.fetch(FetchRequest::all(), domain)
    }
}

/// `EntityRepository` backed by a `ContextManager`.
///
/// Coordinating calls share the manager's coordinating context. Isolated
/// calls share one long-lived isolated context owned by this repository,
/// started on first use; [`ContextRepository::fork`] gives another one.
pub struct ContextRepository {
    manager: ContextManager,
    isolated: OnceCell<Context>,
}

impl ContextRepository {
    pub fn new(manager: ContextManager) -> Self {
        Self {
            manager,
            isolated: OnceCell::new(),
        }
    }

    /// Opens the configured store and wraps it in a fresh manager.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        Ok(Self::new(ContextManager::new(Store::open(config)?)))
    }

    pub fn manager(&self) -> &ContextManager {
        &self.manager
    }

    /// Repository over the same manager with its own isolated context.
    pub fn fork(&self) -> Self {
        Self::new(self.manager.clone())
    }

    /// Context serving calls for `domain`.
    pub fn context_for(&self, domain: ExecutionDomain) -> StoreResult<Context> {
        match domain {
            ExecutionDomain::Coordinating => self.manager.coordinating_context(),
            ExecutionDomain::Isolated => self
                .isolated
                .get_or_try_init(|| self.manager.new_isolated_context())
                .cloned(),
        }
    }

    /// Creates a new `T` and hands it to `callback` inside the domain.
    ///
    /// The callback is the only place the new object can be edited before
    /// it is committed. Returns once the job is queued.
    pub fn new_entity_with<T, F>(&self, domain: ExecutionDomain, callback: F) -> StoreResult<()>
    where
        T: Entity,
        F: FnOnce(&mut Scope<'_>, StoreResult<EntityHandle<T>>) + Send + 'static,
    {
        self.context_for(domain)?.perform(move |scope| {
            let created = scope.create::<T>();
            callback(scope, created);
        })
    }

    /// Non-blocking [`EntityRepository::insert`]; `completion` runs in the domain.
    pub fn insert_async<T, F>(
        &self,
        handle: EntityHandle<T>,
        domain: ExecutionDomain,
        completion: F,
    ) -> StoreResult<()>
    where
        T: Entity,
        F: FnOnce(StoreResult<CommitOutcome>) + Send + 'static,
    {
        self.context_for(domain)?
            .perform(move |scope| completion(insert_in(scope, handle)))
    }

    /// Non-blocking [`EntityRepository::update`]; `completion` runs in the domain.
    pub fn update_async<F>(&self, domain: ExecutionDomain, completion: F) -> StoreResult<()>
    where
        F: FnOnce(StoreResult<CommitOutcome>) + Send + 'static,
    {
        self.context_for(domain)?
            .perform(move |scope| completion(save_or_rollback(scope)))
    }

    /// Non-blocking [`EntityRepository::delete`]; `completion` runs in the domain.
    pub fn delete_async<T, F>(
        &self,
        handle: EntityHandle<T>,
        domain: ExecutionDomain,
        completion: F,
    ) -> StoreResult<()>
    where
        T: Entity,
        F: FnOnce(StoreResult<CommitOutcome>) + Send + 'static,
    {
        self.context_for(domain)?
            .perform(move |scope| completion(delete_in(scope, handle)))
    }

    /// Non-blocking [`EntityRepository::fetch_all`]; `callback` runs in the domain.
    pub fn fetch_all_async<T, F>(&self, domain: ExecutionDomain, callback: F) -> StoreResult<()>
    where
        T: Entity,
        F: FnOnce(StoreResult<Vec<Snapshot<T>>>) + Send + 'static,
    {
        self.context_for(domain)?
            .perform(move |scope| callback(scope.fetch(&FetchRequest::<T>::all())))
    }
}

impl EntityRepository for ContextRepository {
    fn new_entity<T: Entity>(&self, domain: ExecutionDomain) -> StoreResult<EntityHandle<T>> {
        self.context_for(domain)?
            .perform_and_wait(|scope| scope.create::<T>())?
    }

    fn new_entity_with_id<T: Entity>(
        &self,
        id: EntityId,
        domain: ExecutionDomain,
    ) -> StoreResult<EntityHandle<T>> {
        self.context_for(domain)?
            .perform_and_wait(move |scope| scope.create_with_id::<T>(id))?
    }

    fn insert<T: Entity>(
        &self,
        handle: EntityHandle<T>,
        domain: ExecutionDomain,
    ) -> StoreResult<CommitOutcome> {
        self.context_for(domain)?
            .perform_and_wait(move |scope| insert_in(scope, handle))?
    }

    fn update(&self, domain: ExecutionDomain) -> StoreResult<CommitOutcome> {
        self.context_for(domain)?
            .perform_and_wait(save_or_rollback)?
    }

    fn rollback(&self, domain: ExecutionDomain) -> StoreResult<()> {
        self.context_for(domain)?
            .perform_and_wait(|scope| scope.rollback())
    }

    fn modify<T, R, F>(&self, handle: EntityHandle<T>, mutate: F) -> StoreResult<R>
    where
        T: Entity,
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let owner = self
            .manager
            .context(handle.context())
            .ok_or(StoreError::ContextUnavailable(handle.context()))?;
        owner.perform_and_wait(move |scope| scope.get_mut(handle).map(mutate))?
    }

    fn delete<T: Entity>(
        &self,
        handle: EntityHandle<T>,
        domain: ExecutionDomain,
    ) -> StoreResult<CommitOutcome> {
        self.context_for(domain)?
            .perform_and_wait(move |scope| delete_in(scope, handle))?
    }

    fn fetch<T: Entity>(
        &self,
        request: FetchRequest<T>,
        domain: ExecutionDomain,
    ) -> StoreResult<Vec<Snapshot<T>>> {
        self.context_for(domain)?
            .perform_and_wait(move |scope| scope.fetch(&request))?
    }

    fn fetch_single<T: Entity>(
        &self,
        predicate: Option<Predicate<T::Field>>,
        sort: Vec<SortDescriptor<T::Field>>,
        domain: ExecutionDomain,
    ) -> StoreResult<Option<Snapshot<T>>> {
        self.context_for(domain)?
            .perform_and_wait(move |scope| scope.fetch_single::<T>(predicate, sort))?
    }

    fn with_scope<R, F>(&self, domain: ExecutionDomain, work: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Scope<'_>) -> R + Send + 'static,
    {
        self.context_for(domain)?.perform_and_wait(work)
    }
}

fn insert_in<T: Entity>(scope: &mut Scope<'_>, handle: EntityHandle<T>) -> StoreResult<CommitOutcome> {
    scope.get(handle)?;
    save_or_rollback(scope)
}

fn delete_in<T: Entity>(scope: &mut Scope<'_>, handle: EntityHandle<T>) -> StoreResult<CommitOutcome> {
    scope.delete(handle)?;
    save_or_rollback(scope)
}

/// Saves `scope`; a failed commit leaves the context with nothing pending.
fn save_or_rollback(scope: &mut Scope<'_>) -> StoreResult<CommitOutcome> {
    match scope.save() {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            scope.rollback();
            Err(err)
        }
    }
}
