//! Execution domains: one worker thread per context.
//!
//! # Responsibility
//! - Run jobs submitted to a context strictly in submission order.
//! - Keep the context's object registry on its own thread.
//!
//! # Invariants
//! - A job never runs on any thread but its context's worker.
//! - A panicking job is logged and does not stop the worker.
//! - The worker exits once every `Context` handle is dropped and the queue
//!   is drained.

use super::scope::{ContextState, MergeBatch, Scope};
use super::{CommitOutcome, ContextId, ExecutionDomain, ManagerShared};
use crate::store::{StoreError, StoreResult};
use log::{error, info, warn};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce(&mut Scope<'_>) + Send + 'static>;

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Context running on the calling thread, if it is a domain worker.
pub(crate) fn current_context() -> Option<ContextId> {
    CURRENT_CONTEXT.with(Cell::get)
}

pub(crate) struct ContextInner {
    id: ContextId,
    domain: ExecutionDomain,
    jobs: Sender<Job>,
}

impl ContextInner {
    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn domain(&self) -> ExecutionDomain {
        self.domain
    }

    pub(crate) fn enqueue_merge(&self, batch: Arc<MergeBatch>) -> bool {
        self.jobs
            .send(Box::new(move |scope: &mut Scope<'_>| {
                scope.apply_merge(&batch);
            }))
            .is_ok()
    }
}

/// Handle to a transactional context and its execution domain.
///
/// Cloning shares the same context. Entity data is reachable only through
/// the `Scope` passed to jobs submitted with [`Context::perform`] or
/// [`Context::perform_and_wait`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Starts the worker thread of a new context and registers it.
    pub(crate) fn spawn(shared: &Arc<ManagerShared>, domain: ExecutionDomain) -> StoreResult<Self> {
        let id = shared.next_context_id();
        let thread_name = match domain {
            ExecutionDomain::Coordinating => "roster-coordinator".to_string(),
            ExecutionDomain::Isolated => format!("roster-isolated-{id}"),
        };

        let (jobs, receiver) = mpsc::channel::<Job>();
        let worker_shared = Arc::clone(shared);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_domain(id, domain, receiver, worker_shared))
            .map_err(|err| {
                error!(
                    "event=context_start module=context status=error context={} domain={} error={}",
                    id, domain, err
                );
                StoreError::Spawn(err)
            })?;

        let inner = Arc::new(ContextInner { id, domain, jobs });
        shared.register(&inner);
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn domain(&self) -> ExecutionDomain {
        self.inner.domain
    }

    /// Whether the calling thread is this context's domain.
    pub fn is_current(&self) -> bool {
        current_context() == Some(self.inner.id)
    }

    /// Schedules `job` on this context's domain and returns immediately.
    ///
    /// # Errors
    /// - `ContextUnavailable` when the domain has stopped.
    pub fn perform<F>(&self, job: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Scope<'_>) + Send + 'static,
    {
        self.inner
            .jobs
            .send(Box::new(job))
            .map_err(|_| StoreError::ContextUnavailable(self.inner.id))
    }

    /// Runs `job` on this context's domain and blocks for its result.
    ///
    /// # Errors
    /// - `ReentrantWait` when called from this context's own domain; use the
    ///   `Scope` already in hand instead.
    /// - `ContextUnavailable` when the domain stopped or `job` panicked.
    pub fn perform_and_wait<R, F>(&self, job: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Scope<'_>) -> R + Send + 'static,
    {
        if self.is_current() {
            warn!(
                "event=context_wait module=context status=error context={} error_code=reentrant_wait",
                self.inner.id
            );
            return Err(StoreError::ReentrantWait(self.inner.id));
        }

        let (reply, result) = mpsc::sync_channel(1);
        self.perform(move |scope| {
            let _ = reply.send(job(scope));
        })?;
        result
            .recv()
            .map_err(|_| StoreError::ContextUnavailable(self.inner.id))
    }

    /// Whether the context has uncommitted changes.
    pub fn has_changes(&self) -> StoreResult<bool> {
        self.perform_and_wait(|scope| scope.has_changes())
    }

    /// Commits pending changes; see [`Scope::save`].
    pub fn save(&self) -> StoreResult<CommitOutcome> {
        self.perform_and_wait(|scope| scope.save())?
    }

    /// Discards pending changes; see [`Scope::rollback`].
    pub fn rollback(&self) -> StoreResult<()> {
        self.perform_and_wait(|scope| scope.rollback())
    }

    /// Drops clean registered objects; see [`Scope::evict_clean`].
    pub fn evict_clean(&self) -> StoreResult<usize> {
        self.perform_and_wait(|scope| scope.evict_clean())
    }

    /// Number of objects currently registered in the context.
    pub fn registered_count(&self) -> StoreResult<usize> {
        self.perform_and_wait(|scope| scope.registered_count())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("domain", &self.inner.domain)
            .finish()
    }
}

fn run_domain(
    id: ContextId,
    domain: ExecutionDomain,
    receiver: Receiver<Job>,
    shared: Arc<ManagerShared>,
) {
    CURRENT_CONTEXT.with(|current| current.set(Some(id)));
    info!(
        "event=context_start module=context status=ok context={} domain={}",
        id, domain
    );

    let mut state = ContextState::new(id, domain);
    let mut jobs_run: u64 = 0;
    while let Ok(job) = receiver.recv() {
        jobs_run += 1;
        let mut scope = Scope::new(&mut state, &shared);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut scope))) {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            error!(
                "event=context_job module=context status=error context={} error_code=job_panicked error={}",
                id, message
            );
        }
    }

    {
        let mut scope = Scope::new(&mut state, &shared);
        scope.reset();
    }
    shared.unregister(id);
    CURRENT_CONTEXT.with(|current| current.set(None));
    info!(
        "event=context_stop module=context status=ok context={} jobs={}",
        id, jobs_run
    );
}
