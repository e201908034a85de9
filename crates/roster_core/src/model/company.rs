//! Company record.
//!
//! # Invariants
//! - `id` is stable and never reused for another company.
//! - `related_persons` is an ordered set: no duplicates, order is the
//!   persisted `company_position` of each person.

use super::{Entity, EntityField, EntityId, EntityKind, EntityRecord, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub type CompanyId = EntityId;

/// Company attributes usable in fetch predicates and sort descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanyField {
    Name,
    Location,
}

impl EntityField for CompanyField {
    fn column(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Location => "location",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    id: CompanyId,
    pub name: Option<String>,
    pub location: Option<String>,
    /// Maintained through `Scope::relate`/`Scope::unrelate`.
    related_persons: Vec<EntityId>,
}

impl Company {
    /// Creates a company with a generated stable id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Ordered ids of the persons belonging to this company.
    pub fn related_persons(&self) -> &[EntityId] {
        &self.related_persons
    }

    pub(crate) fn related_persons_mut(&mut self) -> &mut Vec<EntityId> {
        &mut self.related_persons
    }

    pub(crate) fn from_parts(
        id: CompanyId,
        name: Option<String>,
        location: Option<String>,
        related_persons: Vec<EntityId>,
    ) -> Self {
        Self {
            id,
            name,
            location,
            related_persons,
        }
    }
}

impl Default for Company {
    fn default() -> Self {
        Self::new()
    }
}

impl Entity for Company {
    const KIND: EntityKind = EntityKind::Company;
    type Field = CompanyField;

    fn with_id(id: EntityId) -> Self {
        Self {
            id,
            name: None,
            location: None,
            related_persons: Vec::new(),
        }
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            return Err(ValidationError::NilId(EntityKind::Company));
        }
        let mut seen = HashSet::with_capacity(self.related_persons.len());
        for person in &self.related_persons {
            if !seen.insert(*person) {
                return Err(ValidationError::DuplicateRelatedPerson {
                    company: self.id,
                    person: *person,
                });
            }
        }
        Ok(())
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::Company(self)
    }

    fn from_record(record: EntityRecord) -> Option<Self> {
        match record {
            EntityRecord::Company(company) => Some(company),
            EntityRecord::Person(_) => None,
        }
    }

    fn from_record_ref(record: &EntityRecord) -> Option<&Self> {
        match record {
            EntityRecord::Company(company) => Some(company),
            EntityRecord::Person(_) => None,
        }
    }

    fn from_record_mut(record: &mut EntityRecord) -> Option<&mut Self> {
        match record {
            EntityRecord::Company(company) => Some(company),
            EntityRecord::Person(_) => None,
        }
    }
}
