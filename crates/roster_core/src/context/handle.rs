//! Inert references to context-owned objects.

use super::ContextId;
use crate::model::{Entity, EntityId, ObjectKey};
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;

/// Copyable reference to an object registered in one context.
///
/// Carries no entity data; reads and writes go through the owning
/// context's `Scope`.
pub struct EntityHandle<T: Entity> {
    id: EntityId,
    context: ContextId,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityHandle<T> {
    pub(crate) fn new(id: EntityId, context: ContextId) -> Self {
        Self {
            id,
            context,
            _entity: PhantomData,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Context the object is registered in.
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::of::<T>(self.id)
    }
}

impl<T: Entity> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Entity> Copy for EntityHandle<T> {}

impl<T: Entity> PartialEq for EntityHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.context == other.context
    }
}

impl<T: Entity> Eq for EntityHandle<T> {}

impl<T: Entity> Hash for EntityHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.context.hash(state);
    }
}

impl<T: Entity> Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("kind", &T::KIND)
            .field("id", &self.id)
            .field("context", &self.context)
            .finish()
    }
}

/// Detached copy of an object's state at read time, plus its handle.
///
/// Later changes in the owning context are not reflected; fetch again to
/// observe them.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T: Entity> {
    handle: EntityHandle<T>,
    value: T,
}

impl<T: Entity> Snapshot<T> {
    pub(crate) fn new(handle: EntityHandle<T>, value: T) -> Self {
        Self { handle, value }
    }

    pub fn handle(&self) -> EntityHandle<T> {
        self.handle
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Entity> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
