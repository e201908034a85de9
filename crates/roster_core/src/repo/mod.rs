//! Repository layer: typed data access for services.
//!
//! # Responsibility
//! - Define the entity CRUD contract services are written against.
//! - Map each call onto a context chosen by an explicit execution domain.
//!
//! # Invariants
//! - Repository writes go through a context commit, which validates every
//!   record before persistence.

pub mod entity_repo;
