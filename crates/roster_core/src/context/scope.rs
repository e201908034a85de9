//! In-domain access to a context's registered objects.
//!
//! # Responsibility
//! - Track every object a context created, fetched or adopted, together
//!   with the committed state and version it was loaded at.
//! - Derive the pending write set and apply commits and merges.
//!
//! # Invariants
//! - A `Scope` only exists on the context's own domain thread.
//! - An object is inserted iff it has no committed state, updated iff its
//!   current state differs from its committed state.
//! - A failed save leaves every registered object untouched.
//! - Registered objects stay registered until the scope is reset or clean
//!   objects are evicted, so a long-lived context holds at most one entry
//!   per row it has ever fetched.

use super::handle::{EntityHandle, Snapshot};
use super::{CommitOutcome, ContextId, ExecutionDomain, ManagerShared};
use crate::model::{Company, Entity, EntityId, EntityKind, EntityRecord, ObjectKey, Person};
use crate::store::{
    ChangeNotification, ChangeSet, FetchRequest, PendingWrite, Predicate, SortDescriptor,
    StoreError, StoreResult, StoredRecord,
};
use log::{debug, error, info};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Committed rows broadcast from a saving context to other live contexts.
#[derive(Debug)]
pub(crate) struct MergeBatch {
    pub origin: ContextId,
    pub upserts: Vec<StoredRecord>,
    pub deleted: Vec<ObjectKey>,
}

#[derive(Debug)]
struct ManagedObject {
    current: EntityRecord,
    committed: Option<EntityRecord>,
    version: i64,
    deleted: bool,
    seq: u64,
}

impl ManagedObject {
    fn is_inserted(&self) -> bool {
        self.committed.is_none()
    }

    fn is_dirty(&self) -> bool {
        self.deleted || self.committed.as_ref() != Some(&self.current)
    }
}

/// Object registry of one context, owned by its domain thread.
pub(crate) struct ContextState {
    id: ContextId,
    domain: ExecutionDomain,
    objects: HashMap<ObjectKey, ManagedObject>,
    next_seq: u64,
}

impl ContextState {
    pub(crate) fn new(id: ContextId, domain: ExecutionDomain) -> Self {
        Self {
            id,
            domain,
            objects: HashMap::new(),
            next_seq: 0,
        }
    }

    fn register_committed(&mut self, stored: StoredRecord) {
        let seq = self.bump_seq();
        self.objects.insert(
            stored.record.key(),
            ManagedObject {
                current: stored.record.clone(),
                committed: Some(stored.record),
                version: stored.version,
                deleted: false,
                seq,
            },
        );
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Refreshes a clean registered object from a newer committed row.
    /// Dirty objects keep their pending state.
    fn refresh_if_clean(&mut self, stored: &StoredRecord) -> bool {
        match self.objects.get_mut(&stored.record.key()) {
            Some(object) if !object.is_dirty() && object.version < stored.version => {
                object.current = stored.record.clone();
                object.committed = Some(stored.record.clone());
                object.version = stored.version;
                true
            }
            _ => false,
        }
    }

    fn has_changes(&self) -> bool {
        self.objects.values().any(ManagedObject::is_dirty)
    }

    /// Pending writes in commit order: inserts (companies first), updates,
    /// then deletes (persons first), each group in registration order.
    fn pending_writes(&self) -> Vec<PendingWrite> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for object in self.objects.values() {
            if object.deleted {
                deletes.push(object);
            } else if object.is_inserted() {
                inserts.push(object);
            } else if object.is_dirty() {
                updates.push(object);
            }
        }

        inserts.sort_by_key(|object| (object.current.kind(), object.seq));
        updates.sort_by_key(|object| object.seq);
        deletes.sort_by_key(|object| (std::cmp::Reverse(object.current.kind()), object.seq));

        inserts
            .into_iter()
            .map(|object| PendingWrite::Insert(object.current.clone()))
            .chain(updates.into_iter().map(|object| PendingWrite::Update {
                record: object.current.clone(),
                expected_version: object.version,
            }))
            .chain(deletes.into_iter().map(|object| PendingWrite::Delete {
                key: object.current.key(),
                expected_version: object.version,
            }))
            .collect()
    }

    fn apply_commit(&mut self, writes: &[PendingWrite], versions: &[(ObjectKey, i64)]) {
        for (key, version) in versions {
            if let Some(object) = self.objects.get_mut(key) {
                object.committed = Some(object.current.clone());
                object.version = *version;
            }
        }
        for write in writes {
            if let PendingWrite::Delete { key, .. } = write {
                self.objects.remove(key);
            }
        }
    }

    fn apply_merge(&mut self, batch: &MergeBatch) -> (usize, usize) {
        let mut refreshed = 0;
        for stored in &batch.upserts {
            if self.refresh_if_clean(stored) {
                refreshed += 1;
            }
        }

        let mut removed = 0;
        for key in &batch.deleted {
            let clean = self
                .objects
                .get(key)
                .is_some_and(|object| !object.is_dirty());
            if clean {
                self.objects.remove(key);
                removed += 1;
            }
        }
        (refreshed, removed)
    }

    /// Keys of uncommitted inserts, whose in-flight claims this context holds.
    fn inserted_keys(&self) -> Vec<ObjectKey> {
        self.objects
            .iter()
            .filter(|(_, object)| object.is_inserted())
            .map(|(key, _)| *key)
            .collect()
    }
}

/// Confined access to one context, handed to jobs running on its domain.
pub struct Scope<'a> {
    state: &'a mut ContextState,
    shared: &'a ManagerShared,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(state: &'a mut ContextState, shared: &'a ManagerShared) -> Self {
        Self { state, shared }
    }

    pub fn context_id(&self) -> ContextId {
        self.state.id
    }

    pub fn domain(&self) -> ExecutionDomain {
        self.state.domain
    }

    /// Registers a new, empty `T` with a generated id as a pending insert.
    pub fn create<T: Entity>(&mut self) -> StoreResult<EntityHandle<T>> {
        self.create_with_id(Uuid::new_v4())
    }

    /// Registers a new, empty `T` carrying `id` as a pending insert.
    ///
    /// # Errors
    /// - `DuplicateObject` when `id` is already registered here or in flight
    ///   in another context.
    pub fn create_with_id<T: Entity>(&mut self, id: EntityId) -> StoreResult<EntityHandle<T>> {
        let key = ObjectKey::of::<T>(id);
        if self.state.objects.contains_key(&key) {
            return Err(StoreError::DuplicateObject(key));
        }
        if self.shared.claim(key, self.state.id).is_err() {
            return Err(StoreError::DuplicateObject(key));
        }

        let seq = self.state.bump_seq();
        self.state.objects.insert(
            key,
            ManagedObject {
                current: T::with_id(id).into_record(),
                committed: None,
                version: 0,
                deleted: false,
                seq,
            },
        );
        Ok(EntityHandle::new(id, self.state.id))
    }

    pub fn contains<T: Entity>(&self, handle: EntityHandle<T>) -> bool {
        handle.context() == self.state.id
            && self
                .state
                .objects
                .get(&handle.key())
                .is_some_and(|object| !object.deleted)
    }

    pub fn get<T: Entity>(&self, handle: EntityHandle<T>) -> StoreResult<&T> {
        self.check_owner(handle)?;
        let key = handle.key();
        let object = self
            .state
            .objects
            .get(&key)
            .ok_or(StoreError::UnknownObject(key))?;
        if object.deleted {
            return Err(StoreError::ObjectDeleted(key));
        }
        T::from_record_ref(&object.current).ok_or(StoreError::UnknownObject(key))
    }

    pub fn get_mut<T: Entity>(&mut self, handle: EntityHandle<T>) -> StoreResult<&mut T> {
        self.check_owner(handle)?;
        let key = handle.key();
        let object = self
            .state
            .objects
            .get_mut(&key)
            .ok_or(StoreError::UnknownObject(key))?;
        if object.deleted {
            return Err(StoreError::ObjectDeleted(key));
        }
        T::from_record_mut(&mut object.current).ok_or(StoreError::UnknownObject(key))
    }

    pub fn snapshot<T: Entity>(&self, handle: EntityHandle<T>) -> StoreResult<Snapshot<T>> {
        let value = self.get(handle)?.clone();
        Ok(Snapshot::new(handle, value))
    }

    /// Marks the object for deletion and detaches it from its relationships.
    ///
    /// A pending insert is simply discarded.
    pub fn delete<T: Entity>(&mut self, handle: EntityHandle<T>) -> StoreResult<()> {
        self.get(handle)?;
        let key = handle.key();

        let related = match self.record(key)? {
            EntityRecord::Company(company) => company.related_persons().to_vec(),
            EntityRecord::Person(person) => person.related_company().into_iter().collect(),
        };
        match key.kind {
            EntityKind::Company => {
                for person in related {
                    let person_key = ObjectKey::of::<Person>(person);
                    if self.fault_in(person_key)? {
                        if let Some(EntityRecord::Person(person)) = self.record_mut(person_key) {
                            if person.related_company() == Some(key.id) {
                                person.set_related_company(None);
                            }
                        }
                    }
                }
            }
            EntityKind::Person => {
                for company in related {
                    let company_key = ObjectKey::of::<Company>(company);
                    if self.fault_in(company_key)? {
                        if let Some(EntityRecord::Company(company)) = self.record_mut(company_key) {
                            company.related_persons_mut().retain(|id| *id != key.id);
                        }
                    }
                }
            }
        }

        let inserted = self
            .state
            .objects
            .get(&key)
            .is_some_and(ManagedObject::is_inserted);
        if inserted {
            self.state.objects.remove(&key);
            self.shared.release(key, self.state.id);
        } else if let Some(object) = self.state.objects.get_mut(&key) {
            object.deleted = true;
        }
        Ok(())
    }

    /// Attaches `person` to `company`, detaching it from any previous company.
    pub fn relate(
        &mut self,
        company: EntityHandle<Company>,
        person: EntityHandle<Person>,
    ) -> StoreResult<()> {
        self.get(company)?;
        let previous = self.get(person)?.related_company();

        if let Some(previous) = previous.filter(|previous| *previous != company.id()) {
            let previous_key = ObjectKey::of::<Company>(previous);
            if self.fault_in(previous_key)? {
                if let Some(EntityRecord::Company(old)) = self.record_mut(previous_key) {
                    old.related_persons_mut().retain(|id| *id != person.id());
                }
            }
        }

        self.get_mut(person)?.set_related_company(Some(company.id()));
        let persons = self.get_mut(company)?.related_persons_mut();
        if !persons.contains(&person.id()) {
            persons.push(person.id());
        }
        Ok(())
    }

    /// Detaches `person` from `company`. No-op when they are not related.
    pub fn unrelate(
        &mut self,
        company: EntityHandle<Company>,
        person: EntityHandle<Person>,
    ) -> StoreResult<()> {
        self.get(company)?;
        if self.get(person)?.related_company() == Some(company.id()) {
            self.get_mut(person)?.set_related_company(None);
        }
        self.get_mut(company)?
            .related_persons_mut()
            .retain(|id| *id != person.id());
        Ok(())
    }

    /// Fetches committed objects of `T` and registers them in this context.
    ///
    /// Registered clean objects are refreshed from the store; objects with
    /// pending changes keep their pending state and pending deletions are
    /// skipped. Filtering and ordering apply to committed rows.
    pub fn fetch<T: Entity>(&mut self, request: &FetchRequest<T>) -> StoreResult<Vec<Snapshot<T>>> {
        let rows = self.shared.store.fetch(request)?;
        let mut snapshots = Vec::with_capacity(rows.len());

        for stored in rows {
            let key = stored.record.key();
            let pending_delete = self.state.objects.get(&key).map(|object| object.deleted);
            match pending_delete {
                Some(true) => continue,
                Some(false) => {
                    self.state.refresh_if_clean(&stored);
                }
                None => self.state.register_committed(stored),
            }

            let handle = EntityHandle::new(key.id, self.state.id);
            snapshots.push(self.snapshot(handle)?);
        }
        Ok(snapshots)
    }

    /// First object of `T` matching `predicate` under `sort`, if any.
    pub fn fetch_single<T: Entity>(
        &mut self,
        predicate: Option<Predicate<T::Field>>,
        sort: Vec<SortDescriptor<T::Field>>,
    ) -> StoreResult<Option<Snapshot<T>>> {
        let mut request = FetchRequest::<T>::all();
        request.predicate = predicate;
        request.sort = sort;
        Ok(self.fetch(&request)?.into_iter().next())
    }

    /// Re-attaches an object handed over from another context.
    ///
    /// The object is re-read from the store, so it must already be committed.
    ///
    /// # Errors
    /// - `CrossContextMisuse` when the object is still an uncommitted insert
    ///   of another context.
    /// - `UnknownObject` when no committed row exists.
    pub fn adopt<T: Entity>(&mut self, handle: EntityHandle<T>) -> StoreResult<EntityHandle<T>> {
        let key = handle.key();
        let local = EntityHandle::new(key.id, self.state.id);
        if self.state.objects.contains_key(&key) {
            return Ok(local);
        }

        if let Some(owner) = self.shared.owner_of(key) {
            if owner != self.state.id {
                return Err(StoreError::CrossContextMisuse {
                    key,
                    owner,
                    accessor: self.state.id,
                });
            }
        }

        if !self.fault_in(key)? {
            return Err(StoreError::UnknownObject(key));
        }
        Ok(local)
    }

    pub fn has_changes(&self) -> bool {
        self.state.has_changes()
    }

    /// Keys that the next `save` would insert, update or delete.
    pub fn pending_changes(&self) -> ChangeSet {
        ChangeSet::from_writes(&self.state.pending_writes())
    }

    pub fn registered_count(&self) -> usize {
        self.state.objects.len()
    }

    /// Commits every pending change atomically.
    ///
    /// Returns `NoChanges` without touching the store when nothing is
    /// pending. On success the committed rows are merged into every other
    /// live context before this returns. On failure all pending changes are
    /// kept so the caller may retry, roll back or give up.
    pub fn save(&mut self) -> StoreResult<CommitOutcome> {
        let writes = self.state.pending_writes();
        if writes.is_empty() {
            debug!(
                "event=context_commit module=context status=skipped context={} reason=no_changes",
                self.state.id
            );
            return Ok(CommitOutcome::NoChanges);
        }

        let started_at = Instant::now();
        info!(
            "event=context_commit module=context status=start context={} domain={} writes={}",
            self.state.id,
            self.state.domain,
            writes.len()
        );

        let versions = match self.shared.store.commit(&writes) {
            Ok(versions) => versions,
            Err(err) => {
                error!(
                    "event=context_commit module=context status=error context={} duration_ms={} error={}",
                    self.state.id,
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err.into());
            }
        };

        let released = self.state.inserted_keys();
        self.state.apply_commit(&writes, &versions);
        for key in released {
            self.shared.release(key, self.state.id);
        }

        let changes = ChangeSet::from_writes(&writes);
        let batch = MergeBatch {
            origin: self.state.id,
            upserts: versions
                .iter()
                .filter_map(|(key, version)| {
                    self.state.objects.get(key).map(|object| StoredRecord {
                        record: object.current.clone(),
                        version: *version,
                    })
                })
                .collect(),
            deleted: changes.deleted.clone(),
        };
        self.shared.broadcast_merge(batch);
        self.shared.store.publish(ChangeNotification {
            origin: self.state.id,
            domain: self.state.domain,
            changes: changes.clone(),
        });

        info!(
            "event=context_commit module=context status=ok context={} inserted={} updated={} deleted={} duration_ms={}",
            self.state.id,
            changes.inserted.len(),
            changes.updated.len(),
            changes.deleted.len(),
            started_at.elapsed().as_millis()
        );
        Ok(CommitOutcome::Committed(changes))
    }

    /// Discards pending changes: inserts are dropped, updates and deletions
    /// revert to the committed state.
    pub fn rollback(&mut self) {
        let dropped = self.state.inserted_keys();
        for key in &dropped {
            self.state.objects.remove(key);
            self.shared.release(*key, self.state.id);
        }
        for object in self.state.objects.values_mut() {
            if let Some(committed) = object.committed.as_ref() {
                object.current = committed.clone();
            }
            object.deleted = false;
        }
        debug!(
            "event=context_rollback module=context status=ok context={} dropped_inserts={}",
            self.state.id,
            dropped.len()
        );
    }

    /// Forgets registered objects without pending changes and returns how
    /// many were dropped.
    ///
    /// Handles to evicted objects report `UnknownObject` until they are
    /// fetched again. Evicted objects no longer receive merged changes.
    pub fn evict_clean(&mut self) -> usize {
        let before = self.state.objects.len();
        self.state.objects.retain(|_, object| object.is_dirty());
        let evicted = before - self.state.objects.len();
        debug!(
            "event=context_evict module=context status=ok context={} evicted={}",
            self.state.id, evicted
        );
        evicted
    }

    /// Forgets every registered object, pending or not.
    pub fn reset(&mut self) {
        for key in self.state.inserted_keys() {
            self.shared.release(key, self.state.id);
        }
        self.state.objects.clear();
    }

    pub(crate) fn apply_merge(&mut self, batch: &MergeBatch) {
        let (refreshed, removed) = self.state.apply_merge(batch);
        debug!(
            "event=context_merge module=context status=ok context={} origin={} refreshed={} removed={}",
            self.state.id, batch.origin, refreshed, removed
        );
    }

    fn check_owner<T: Entity>(&self, handle: EntityHandle<T>) -> StoreResult<()> {
        if handle.context() == self.state.id {
            return Ok(());
        }
        Err(StoreError::CrossContextMisuse {
            key: handle.key(),
            owner: handle.context(),
            accessor: self.state.id,
        })
    }

    fn record(&self, key: ObjectKey) -> StoreResult<&EntityRecord> {
        self.state
            .objects
            .get(&key)
            .map(|object| &object.current)
            .ok_or(StoreError::UnknownObject(key))
    }

    fn record_mut(&mut self, key: ObjectKey) -> Option<&mut EntityRecord> {
        self.state
            .objects
            .get_mut(&key)
            .filter(|object| !object.deleted)
            .map(|object| &mut object.current)
    }

    /// Ensures `key` is registered, loading it from the store when needed.
    /// Returns `false` when no committed row exists.
    fn fault_in(&mut self, key: ObjectKey) -> StoreResult<bool> {
        if self.state.objects.contains_key(&key) {
            return Ok(true);
        }
        match self.shared.store.load(key)? {
            Some(stored) => {
                self.state.register_committed(stored);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextState, ManagedObject};
    use crate::context::{ContextId, ExecutionDomain};
    use crate::model::{Company, Entity, Person};
    use crate::store::PendingWrite;

    fn register(state: &mut ContextState, record: crate::model::EntityRecord, inserted: bool) {
        let seq = state.bump_seq();
        state.objects.insert(
            record.key(),
            ManagedObject {
                committed: (!inserted).then(|| record.clone()),
                current: record,
                version: if inserted { 0 } else { 1 },
                deleted: false,
                seq,
            },
        );
    }

    #[test]
    fn pending_writes_insert_parents_first_and_delete_children_first() {
        let mut state = ContextState::new(ContextId::new(1), ExecutionDomain::Isolated);
        let person = Person::new();
        let company = Company::new();
        register(&mut state, person.clone().into_record(), true);
        register(&mut state, company.clone().into_record(), true);

        let writes = state.pending_writes();
        assert!(matches!(&writes[0], PendingWrite::Insert(record) if record.key() == company.key()));
        assert!(matches!(&writes[1], PendingWrite::Insert(record) if record.key() == person.key()));

        let mut state = ContextState::new(ContextId::new(2), ExecutionDomain::Isolated);
        register(&mut state, company.clone().into_record(), false);
        register(&mut state, person.clone().into_record(), false);
        for object in state.objects.values_mut() {
            object.deleted = true;
        }

        let writes = state.pending_writes();
        assert_eq!(writes[0].key(), person.key());
        assert_eq!(writes[1].key(), company.key());
    }

    #[test]
    fn clean_objects_produce_no_writes() {
        let mut state = ContextState::new(ContextId::new(3), ExecutionDomain::Coordinating);
        register(&mut state, Company::new().into_record(), false);
        assert!(!state.has_changes());
        assert!(state.pending_writes().is_empty());
    }
}
