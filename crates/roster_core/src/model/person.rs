//! Person record.

use super::{Entity, EntityField, EntityId, EntityKind, EntityRecord, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PersonId = EntityId;

/// Person attributes usable in fetch predicates and sort descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonField {
    Name,
    /// Back-reference column; compared against the company id text.
    Company,
}

impl EntityField for PersonField {
    fn column(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Company => "company_uuid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    id: PersonId,
    pub name: Option<String>,
    related_company: Option<EntityId>,
}

impl Person {
    /// Creates a person with a generated stable id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Company this person belongs to, if any.
    pub fn related_company(&self) -> Option<EntityId> {
        self.related_company
    }

    pub(crate) fn set_related_company(&mut self, company: Option<EntityId>) {
        self.related_company = company;
    }

    pub(crate) fn from_parts(
        id: PersonId,
        name: Option<String>,
        related_company: Option<EntityId>,
    ) -> Self {
        Self {
            id,
            name,
            related_company,
        }
    }
}

impl Default for Person {
    fn default() -> Self {
        Self::new()
    }
}

impl Entity for Person {
    const KIND: EntityKind = EntityKind::Person;
    type Field = PersonField;

    fn with_id(id: EntityId) -> Self {
        Self {
            id,
            name: None,
            related_company: None,
        }
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            return Err(ValidationError::NilId(EntityKind::Person));
        }
        if self.related_company.is_some_and(|company| company.is_nil()) {
            return Err(ValidationError::NilRelatedCompany { person: self.id });
        }
        Ok(())
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::Person(self)
    }

    fn from_record(record: EntityRecord) -> Option<Self> {
        match record {
            EntityRecord::Person(person) => Some(person),
            EntityRecord::Company(_) => None,
        }
    }

    fn from_record_ref(record: &EntityRecord) -> Option<&Self> {
        match record {
            EntityRecord::Person(person) => Some(person),
            EntityRecord::Company(_) => None,
        }
    }

    fn from_record_mut(record: &mut EntityRecord) -> Option<&mut Self> {
        match record {
            EntityRecord::Person(person) => Some(person),
            EntityRecord::Company(_) => None,
        }
    }
}
