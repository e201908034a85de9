//! Entity model for the Company/Person object graph.
//!
//! # Responsibility
//! - Define the persistable record kinds and their shared identity types.
//! - Provide the `Entity` capability used to parameterize contexts,
//!   fetches and the repository facade at compile time.
//!
//! # Invariants
//! - Every record is identified by a stable, non-nil UUID assigned at creation.
//! - The set of kinds is closed: one kind maps to exactly one table.
//! - Relationship fields are only mutated through a context so both sides
//!   of Company <-> Person stay consistent.

pub mod company;
pub mod person;

use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use uuid::Uuid;

pub use company::{Company, CompanyField, CompanyId};
pub use person::{Person, PersonField, PersonId};

/// Stable identifier shared by every entity kind.
pub type EntityId = Uuid;

/// Persisted record kinds known to the store schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Company,
    Person,
}

impl EntityKind {
    /// Backing table name.
    pub fn table(self) -> &'static str {
        match self {
            Self::Company => "companies",
            Self::Person => "persons",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Person => "person",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one record across contexts: kind plus id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl ObjectKey {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }

    pub fn of<T: Entity>(id: EntityId) -> Self {
        Self::new(T::KIND, id)
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Record-level validation failures, checked before any commit SQL runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NilId(EntityKind),
    DuplicateRelatedPerson {
        company: EntityId,
        person: EntityId,
    },
    NilRelatedCompany {
        person: EntityId,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NilId(kind) => write!(f, "{kind} id must not be the nil uuid"),
            Self::DuplicateRelatedPerson { company, person } => write!(
                f,
                "company {company} lists person {person} more than once"
            ),
            Self::NilRelatedCompany { person } => {
                write!(f, "person {person} references the nil company id")
            }
        }
    }
}

impl Error for ValidationError {}

/// Column-backed attribute of an entity kind, usable in predicates and sorts.
pub trait EntityField: Copy + Eq + Debug + Send + Sync + 'static {
    fn column(self) -> &'static str;
}

/// Closed sum of every entity kind, as tracked by contexts and the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRecord {
    Company(Company),
    Person(Person),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Company(_) => EntityKind::Company,
            Self::Person(_) => EntityKind::Person,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Company(company) => company.id(),
            Self::Person(person) => person.id(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.id())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Company(company) => company.validate(),
            Self::Person(person) => person.validate(),
        }
    }

    /// Creates an empty record of `key.kind` carrying `key.id`.
    pub fn empty(key: ObjectKey) -> Self {
        match key.kind {
            EntityKind::Company => Self::Company(Company::with_id(key.id)),
            EntityKind::Person => Self::Person(Person::with_id(key.id)),
        }
    }
}

/// Persistable record capability.
///
/// Implemented by `Company` and `Person`; generic store, context and
/// facade operations are constrained by it, so the entity kind is resolved
/// at compile time rather than looked up by name.
pub trait Entity: Clone + PartialEq + Debug + Send + Sync + 'static {
    const KIND: EntityKind;
    type Field: EntityField;

    /// Creates an empty record carrying the given stable id.
    fn with_id(id: EntityId) -> Self;

    fn id(&self) -> EntityId;

    fn validate(&self) -> Result<(), ValidationError>;

    fn into_record(self) -> EntityRecord;

    fn from_record(record: EntityRecord) -> Option<Self>;

    fn from_record_ref(record: &EntityRecord) -> Option<&Self>;

    fn from_record_mut(record: &mut EntityRecord) -> Option<&mut Self>;

    fn key(&self) -> ObjectKey {
        ObjectKey::new(Self::KIND, self.id())
    }
}
