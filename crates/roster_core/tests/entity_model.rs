use roster_core::model::EntityRecord;
use roster_core::{Company, Entity, EntityKind, ObjectKey, Person, ValidationError};
use uuid::Uuid;

#[test]
fn new_entities_get_distinct_non_nil_ids() {
    let first = Company::new();
    let second = Company::new();

    assert!(!first.id().is_nil());
    assert_ne!(first.id(), second.id());
    assert!(first.validate().is_ok());
    assert!(first.related_persons().is_empty());
}

#[test]
fn nil_ids_fail_validation() {
    assert_eq!(
        Company::with_id(Uuid::nil()).validate(),
        Err(ValidationError::NilId(EntityKind::Company))
    );
    assert_eq!(
        Person::with_id(Uuid::nil()).validate(),
        Err(ValidationError::NilId(EntityKind::Person))
    );
}

#[test]
fn records_convert_only_to_their_own_kind() {
    let company = Company::new();
    let record = company.clone().into_record();

    assert_eq!(record.kind(), EntityKind::Company);
    assert_eq!(record.key(), ObjectKey::of::<Company>(company.id()));
    assert_eq!(Company::from_record_ref(&record), Some(&company));
    assert!(Person::from_record_ref(&record).is_none());
    assert_eq!(Company::from_record(record), Some(company));
}

#[test]
fn empty_record_matches_key() {
    let key = ObjectKey::new(EntityKind::Person, Uuid::new_v4());
    let record = EntityRecord::empty(key);

    assert_eq!(record.key(), key);
    let person = Person::from_record(record).unwrap();
    assert_eq!(person.name, None);
    assert_eq!(person.related_company(), None);
}

#[test]
fn object_key_display_is_kind_slash_id() {
    let id = Uuid::new_v4();
    assert_eq!(
        ObjectKey::of::<Person>(id).to_string(),
        format!("person/{id}")
    );
    assert_eq!(EntityKind::Company.table(), "companies");
    assert_eq!(EntityKind::Person.table(), "persons");
}

#[test]
fn company_serializes_fields_and_relationships() {
    let mut company = Company::new();
    company.name = Some("Acme".to_string());

    let json = serde_json::to_value(&company).unwrap();
    assert_eq!(json["name"], "Acme");
    assert!(json["location"].is_null());
    assert_eq!(json["related_persons"], serde_json::json!([]));

    let decoded: Company = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, company);
}
