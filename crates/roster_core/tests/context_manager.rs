use roster_core::{
    CommitError, CommitOutcome, Company, ConflictPolicy, ContextManager, Entity, EntityId,
    ExecutionDomain, FetchRequest, ObjectKey, Person, Predicate, Scope, Store, StoreConfig,
    StoreError, StoreResult,
};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn manager() -> ContextManager {
    ContextManager::new(Store::open_in_memory().unwrap())
}

fn manager_with(config: StoreConfig) -> ContextManager {
    ContextManager::new(Store::open(&config).unwrap())
}

fn create_company(scope: &mut Scope<'_>, name: &str) -> StoreResult<EntityId> {
    let handle = scope.create::<Company>()?;
    scope.get_mut(handle)?.name = Some(name.to_string());
    scope.save()?;
    Ok(handle.id())
}

fn seed_company(manager: &ContextManager, name: &'static str) -> EntityId {
    manager
        .new_isolated_context()
        .unwrap()
        .perform_and_wait(move |scope| create_company(scope, name))
        .unwrap()
        .unwrap()
}

fn rename_in(scope: &mut Scope<'_>, id: EntityId, name: &str) -> StoreResult<()> {
    let company = scope
        .fetch_single::<Company>(Some(Predicate::id(id)), Vec::new())?
        .ok_or(StoreError::UnknownObject(ObjectKey::of::<Company>(id)))?;
    scope.get_mut(company.handle())?.name = Some(name.to_string());
    Ok(())
}

#[test]
fn coordinating_context_is_a_singleton() {
    let manager = manager();
    let first = manager.coordinating_context().unwrap();
    let second = manager.clone().coordinating_context().unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first.domain(), ExecutionDomain::Coordinating);
}

#[test]
fn isolated_contexts_are_independent() {
    let manager = manager();
    let coordinating = manager.coordinating_context().unwrap();
    let first = manager.new_isolated_context().unwrap();
    let second = manager.new_isolated_context().unwrap();

    assert_ne!(first.id(), second.id());
    assert_ne!(first.id(), coordinating.id());
    assert_eq!(first.domain(), ExecutionDomain::Isolated);

    let live = manager.live_contexts();
    assert!(live.contains(&first.id()) && live.contains(&second.id()));

    let dropped = second.id();
    drop(second);
    assert!(!manager.live_contexts().contains(&dropped));
    assert!(manager.context(dropped).is_none());
}

#[test]
fn jobs_run_on_the_domain_in_submission_order() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for index in 0..50 {
        let seen = Arc::clone(&seen);
        context.perform(move |_| seen.lock().push(index)).unwrap();
    }
    let same_context = context.clone();
    let on_domain = context
        .perform_and_wait(move |_| same_context.is_current())
        .unwrap();

    assert!(on_domain);
    assert!(!context.is_current());
    assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
}

#[test]
fn blocking_wait_from_own_domain_is_rejected() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    let inner = context.clone();

    let nested = context
        .perform_and_wait(move |_| inner.perform_and_wait(|_| ()))
        .unwrap();
    assert!(matches!(nested, Err(StoreError::ReentrantWait(id)) if id == context.id()));
}

#[test]
fn panicking_job_does_not_stop_the_domain() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();

    let result: StoreResult<()> = context.perform_and_wait(|_| panic!("job failed"));
    assert!(matches!(result, Err(StoreError::ContextUnavailable(_))));

    assert_eq!(context.perform_and_wait(|scope| scope.registered_count()).unwrap(), 0);
}

#[test]
fn commit_without_changes_touches_nothing() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    let before = manager.store().stats();

    assert_eq!(manager.commit(&context).unwrap(), CommitOutcome::NoChanges);
    assert_eq!(manager.store().stats(), before);
}

#[test]
fn uncommitted_inserts_are_owned_until_saved() {
    let manager = manager();
    let isolated = manager.new_isolated_context().unwrap();
    let coordinating = manager.coordinating_context().unwrap();
    let handle = isolated
        .perform_and_wait(|scope| scope.create::<Company>())
        .unwrap()
        .unwrap();
    assert_eq!(manager.owner_of(handle.key()), Some(isolated.id()));

    let read = coordinating
        .perform_and_wait(move |scope| scope.get(handle).map(|_| ()))
        .unwrap();
    assert!(matches!(
        read,
        Err(StoreError::CrossContextMisuse { owner, accessor, .. })
            if owner == isolated.id() && accessor == coordinating.id()
    ));

    let adopted = coordinating
        .perform_and_wait(move |scope| scope.adopt(handle))
        .unwrap();
    assert!(matches!(adopted, Err(StoreError::CrossContextMisuse { .. })));

    let visible = coordinating
        .perform_and_wait(|scope| scope.fetch(&FetchRequest::<Company>::all()))
        .unwrap()
        .unwrap();
    assert!(visible.is_empty());

    assert!(isolated.save().unwrap().is_committed());
    assert_eq!(manager.owner_of(handle.key()), None);

    let adopted = coordinating
        .perform_and_wait(move |scope| -> StoreResult<_> {
            let local = scope.adopt(handle)?;
            scope.snapshot(local)
        })
        .unwrap()
        .unwrap();
    assert_eq!(adopted.id(), handle.id());
    assert_eq!(adopted.handle().context(), coordinating.id());
}

#[test]
fn saved_changes_merge_into_registered_objects() {
    let manager = manager();
    let id = seed_company(&manager, "Acme");
    let coordinating = manager.coordinating_context().unwrap();
    let handle = coordinating
        .perform_and_wait(move |scope| {
            scope
                .fetch_single::<Company>(Some(Predicate::id(id)), Vec::new())
                .map(|found| found.map(|company| company.handle()))
        })
        .unwrap()
        .unwrap()
        .unwrap();

    manager
        .new_isolated_context()
        .unwrap()
        .perform_and_wait(move |scope| -> StoreResult<CommitOutcome> {
            rename_in(scope, id, "Acme2")?;
            scope.save()
        })
        .unwrap()
        .unwrap();

    let fetches_before = manager.store().stats().fetches;
    let name = coordinating
        .perform_and_wait(move |scope| scope.get(handle).map(|company| company.name.clone()))
        .unwrap()
        .unwrap();
    assert_eq!(name.as_deref(), Some("Acme2"));
    assert_eq!(manager.store().stats().fetches, fetches_before);
}

#[test]
fn merges_skip_isolated_contexts_when_disabled() {
    let manager = manager_with(StoreConfig {
        merge_into_isolated: false,
        ..StoreConfig::in_memory()
    });
    let id = seed_company(&manager, "Acme");
    let reader = manager.new_isolated_context().unwrap();
    let handle = reader
        .perform_and_wait(move |scope| {
            scope
                .fetch_single::<Company>(Some(Predicate::id(id)), Vec::new())
                .map(|found| found.map(|company| company.handle()))
        })
        .unwrap()
        .unwrap()
        .unwrap();

    manager
        .new_isolated_context()
        .unwrap()
        .perform_and_wait(move |scope| -> StoreResult<CommitOutcome> {
            rename_in(scope, id, "Renamed")?;
            scope.save()
        })
        .unwrap()
        .unwrap();

    let name = reader
        .perform_and_wait(move |scope| scope.get(handle).map(|company| company.name.clone()))
        .unwrap()
        .unwrap();
    assert_eq!(name.as_deref(), Some("Acme"));
}

#[test]
fn concurrent_update_from_same_version_conflicts() {
    let manager = manager();
    let id = seed_company(&manager, "Acme");
    let first = manager.new_isolated_context().unwrap();
    let second = manager.new_isolated_context().unwrap();

    first
        .perform_and_wait(move |scope| rename_in(scope, id, "First"))
        .unwrap()
        .unwrap();
    second
        .perform_and_wait(move |scope| rename_in(scope, id, "Second"))
        .unwrap()
        .unwrap();

    first.save().unwrap();
    let err = second.save().unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(
        err,
        StoreError::Commit(CommitError::VersionConflict {
            expected: 1,
            found: 2,
            ..
        })
    ));
    assert!(second.has_changes().unwrap());

    second.rollback().unwrap();
    assert!(!second.has_changes().unwrap());
    second
        .perform_and_wait(move |scope| -> StoreResult<CommitOutcome> {
            rename_in(scope, id, "Second")?;
            scope.save()
        })
        .unwrap()
        .unwrap();

    let stored = manager
        .coordinating_context()
        .unwrap()
        .perform_and_wait(move |scope| {
            scope.fetch_single::<Company>(Some(Predicate::id(id)), Vec::new())
        })
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stored.name.as_deref(), Some("Second"));
}

#[test]
fn overwrite_policy_lets_last_writer_win() {
    let manager = manager_with(StoreConfig {
        conflict_policy: ConflictPolicy::Overwrite,
        ..StoreConfig::in_memory()
    });
    let id = seed_company(&manager, "Acme");
    let first = manager.new_isolated_context().unwrap();
    let second = manager.new_isolated_context().unwrap();

    first
        .perform_and_wait(move |scope| rename_in(scope, id, "First"))
        .unwrap()
        .unwrap();
    second
        .perform_and_wait(move |scope| rename_in(scope, id, "Second"))
        .unwrap()
        .unwrap();

    first.save().unwrap();
    second.save().unwrap();

    let names: Vec<Option<String>> = manager
        .coordinating_context()
        .unwrap()
        .perform_and_wait(|scope| scope.fetch(&FetchRequest::<Company>::all()))
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|company| company.name.clone())
        .collect();
    assert_eq!(names, vec![Some("Second".to_string())]);
}

#[test]
fn failed_validation_keeps_pending_changes() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    context
        .perform_and_wait(|scope| scope.create_with_id::<Company>(Uuid::nil()))
        .unwrap()
        .unwrap();

    let err = context.save().unwrap_err();
    assert!(matches!(
        err,
        StoreError::Commit(CommitError::Validation { .. })
    ));
    assert!(context.has_changes().unwrap());
    assert_eq!(manager.store().stats().commits, 0);

    context.rollback().unwrap();
    assert!(!context.has_changes().unwrap());
    assert_eq!(context.registered_count().unwrap(), 0);
}

#[test]
fn deleting_a_pending_insert_discards_it() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    let handle = context
        .perform_and_wait(|scope| -> StoreResult<_> {
            let handle = scope.create::<Person>()?;
            scope.delete(handle)?;
            Ok(handle)
        })
        .unwrap()
        .unwrap();

    assert!(!context.has_changes().unwrap());
    assert_eq!(manager.owner_of(handle.key()), None);
    assert_eq!(context.save().unwrap(), CommitOutcome::NoChanges);
}

#[test]
fn relationships_stay_consistent_across_delete() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    let (company_id, first, second) = context
        .perform_and_wait(|scope| -> StoreResult<_> {
            let company = scope.create::<Company>()?;
            let first = scope.create::<Person>()?;
            let second = scope.create::<Person>()?;
            scope.relate(company, second)?;
            scope.relate(company, first)?;
            scope.save()?;
            Ok((company.id(), first.id(), second.id()))
        })
        .unwrap()
        .unwrap();

    let reader = manager.new_isolated_context().unwrap();
    let related = reader
        .perform_and_wait(move |scope| {
            scope
                .fetch_single::<Company>(Some(Predicate::id(company_id)), Vec::new())
                .map(|found| found.map(|company| company.related_persons().to_vec()))
        })
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(related, vec![second, first]);

    context
        .perform_and_wait(move |scope| -> StoreResult<CommitOutcome> {
            let person = scope
                .fetch_single::<Person>(Some(Predicate::id(first)), Vec::new())?
                .ok_or(StoreError::UnknownObject(ObjectKey::of::<Person>(first)))?;
            scope.delete(person.handle())?;
            scope.save()
        })
        .unwrap()
        .unwrap();

    context
        .perform_and_wait(move |scope| -> StoreResult<CommitOutcome> {
            let company = scope
                .fetch_single::<Company>(Some(Predicate::id(company_id)), Vec::new())?
                .ok_or(StoreError::UnknownObject(ObjectKey::of::<Company>(company_id)))?;
            assert_eq!(company.related_persons(), &[second]);
            scope.delete(company.handle())?;
            scope.save()
        })
        .unwrap()
        .unwrap();

    let remaining = reader
        .perform_and_wait(|scope| scope.fetch(&FetchRequest::<Person>::all()))
        .unwrap()
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), second);
    assert_eq!(remaining[0].related_company(), None);
}

#[test]
fn relate_moves_person_between_companies() {
    let manager = manager();
    let context = manager.new_isolated_context().unwrap();
    let (old_company, new_company) = context
        .perform_and_wait(|scope| -> StoreResult<_> {
            let old_company = scope.create::<Company>()?;
            let new_company = scope.create::<Company>()?;
            let person = scope.create::<Person>()?;
            scope.relate(old_company, person)?;
            scope.relate(new_company, person)?;
            assert_eq!(scope.get(person)?.related_company(), Some(new_company.id()));
            scope.save()?;

            let old = scope.get(old_company)?.related_persons().to_vec();
            let new = scope.get(new_company)?.related_persons().to_vec();
            scope.unrelate(new_company, person)?;
            assert_eq!(scope.get(person)?.related_company(), None);
            scope.rollback();
            Ok((old, new))
        })
        .unwrap()
        .unwrap();

    assert!(old_company.is_empty());
    assert_eq!(new_company.len(), 1);
}

#[test]
fn subscribers_observe_each_commit() {
    let manager = manager();
    let notifications = manager.subscribe();

    let id = seed_company(&manager, "Acme");
    let notification = notifications.recv_timeout(WAIT).unwrap();
    assert_eq!(notification.domain, ExecutionDomain::Isolated);
    assert_eq!(
        notification.changes.inserted,
        vec![ObjectKey::of::<Company>(id)]
    );
    assert!(notification.changes.updated.is_empty());
}

#[test]
fn background_task_runs_on_a_discarded_context() {
    let manager = manager();
    let (sender, receiver) = mpsc::channel();

    manager
        .perform_background_task(move |scope| {
            let _ = sender.send((scope.domain(), create_company(scope, "Globex")));
        })
        .unwrap();

    let (domain, created) = receiver.recv_timeout(WAIT).unwrap();
    assert_eq!(domain, ExecutionDomain::Isolated);
    let id = created.unwrap();

    let stored = manager
        .coordinating_context()
        .unwrap()
        .perform_and_wait(move |scope| {
            scope.fetch_single::<Company>(Some(Predicate::id(id)), Vec::new())
        })
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stored.id(), id);
    assert_eq!(stored.name.as_deref(), Some("Globex"));
}

#[test]
fn evicting_clean_objects_keeps_pending_ones() {
    let manager = manager();
    let acme = seed_company(&manager, "Acme");
    seed_company(&manager, "Globex");
    let coordinator = manager.coordinating_context().unwrap();

    coordinator
        .perform_and_wait(move |scope| -> StoreResult<()> {
            scope.fetch(&FetchRequest::<Company>::all())?;
            rename_in(scope, acme, "Acme Draft")
        })
        .unwrap()
        .unwrap();
    assert_eq!(coordinator.registered_count().unwrap(), 2);

    assert_eq!(coordinator.evict_clean().unwrap(), 1);
    assert_eq!(coordinator.registered_count().unwrap(), 1);
    assert!(coordinator.has_changes().unwrap());

    let names = coordinator
        .perform_and_wait(|scope| -> StoreResult<Vec<Option<String>>> {
            let companies = scope.fetch(&FetchRequest::<Company>::all())?;
            Ok(companies
                .into_iter()
                .map(|company| company.name.clone())
                .collect())
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        names,
        vec![Some("Acme Draft".to_string()), Some("Globex".to_string())]
    );
    assert_eq!(coordinator.registered_count().unwrap(), 2);
}
