//! Core of the Roster company/person store.
//!
//! Persists `Company`/`Person` records in one SQLite store and exposes them
//! through transactional contexts bound to execution domains: one
//! coordinating domain plus any number of isolated background domains.
//! Committed changes merge into every other live context.

pub mod config;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use config::{ConfigError, ConflictPolicy, StoreConfig};
pub use context::{
    CommitOutcome, Context, ContextId, ContextManager, EntityHandle, ExecutionDomain, Scope,
    Snapshot,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::{
    Company, CompanyField, CompanyId, Entity, EntityId, EntityKind, ObjectKey, Person,
    PersonField, PersonId, ValidationError,
};
pub use repo::entity_repo::{ContextRepository, EntityRepository};
pub use service::company_service::CompanyService;
pub use store::{
    ChangeNotification, ChangeSet, CommitError, Comparison, FetchError, FetchRequest, Predicate,
    SortDescriptor, SortKey, Store, StoreError, StoreResult, StoreStats,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
