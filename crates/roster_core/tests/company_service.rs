use roster_core::{
    Company, CompanyService, ContextRepository, Entity, EntityRepository, ExecutionDomain,
    Predicate, StoreConfig,
};
use uuid::Uuid;

fn service() -> CompanyService<ContextRepository> {
    CompanyService::new(ContextRepository::open(&StoreConfig::in_memory()).unwrap())
}

fn names(service: &CompanyService<ContextRepository>) -> Vec<String> {
    service
        .list_companies()
        .unwrap()
        .into_iter()
        .filter_map(|company| company.name.clone())
        .collect()
}

#[test]
fn add_rename_and_remove_companies() {
    let service = service();
    let acme = service
        .add_company("Acme", Some("Tokyo".to_string()))
        .unwrap();
    service.add_company("Globex", None).unwrap();
    assert_eq!(names(&service), vec!["Acme", "Globex"]);

    let renamed = service.rename_company_at(1, "Globex Corp").unwrap();
    assert!(renamed.is_some());
    assert_eq!(names(&service), vec!["Acme", "Globex Corp"]);

    assert_eq!(service.rename_company_at(5, "Nobody").unwrap(), None);

    assert!(service.remove_company(acme).unwrap());
    assert!(!service.remove_company(acme).unwrap());
    assert_eq!(names(&service), vec!["Globex Corp"]);
}

#[test]
fn persons_attach_in_order_and_survive_company_removal() {
    let service = service();
    let acme = service.add_company("Acme", None).unwrap();

    let ada = service.add_person(acme, "Ada").unwrap().unwrap();
    let grace = service.add_person(acme, "Grace").unwrap().unwrap();
    assert_eq!(service.add_person(Uuid::new_v4(), "Nobody").unwrap(), None);

    let persons = service.list_persons(acme).unwrap();
    let ids: Vec<Uuid> = persons.iter().map(|person| person.id()).collect();
    assert_eq!(ids, vec![ada, grace]);
    assert!(persons
        .iter()
        .all(|person| person.related_company() == Some(acme)));

    let company = service
        .list_companies()
        .unwrap()
        .into_iter()
        .find(|company| company.id() == acme)
        .unwrap();
    assert_eq!(company.related_persons(), &[ada, grace]);

    assert!(service.remove_company(acme).unwrap());
    assert!(service.list_persons(acme).unwrap().is_empty());
}

#[test]
fn rename_conflict_does_not_block_later_writes() {
    let service = service();
    let acme = service.add_company("Acme", None).unwrap();

    let draft = service
        .repo()
        .fetch_single::<Company>(
            Some(Predicate::id(acme)),
            Vec::new(),
            ExecutionDomain::Isolated,
        )
        .unwrap()
        .unwrap();
    service
        .repo()
        .modify(draft.handle(), |company| company.name = Some("Draft".to_string()))
        .unwrap();

    let fork = service.repo().fork();
    let fresh = fork
        .fetch_single::<Company>(
            Some(Predicate::id(acme)),
            Vec::new(),
            ExecutionDomain::Isolated,
        )
        .unwrap()
        .unwrap();
    fork.modify(fresh.handle(), |company| company.name = Some("Acme Intl".to_string()))
        .unwrap();
    fork.update(ExecutionDomain::Isolated).unwrap();

    let err = service.rename_company_at(0, "Acme Renamed").unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(names(&service), vec!["Acme Intl"]);

    service.add_company("Globex", None).unwrap();
    assert_eq!(names(&service), vec!["Acme Intl", "Globex"]);

    assert!(service.remove_company(acme).unwrap());
    assert_eq!(names(&service), vec!["Globex"]);
}
