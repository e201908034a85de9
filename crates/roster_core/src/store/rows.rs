//! Row mapping and write SQL for `companies` and `persons`.
//!
//! # Invariants
//! - Inserts store `version = 1`; every update increments `version`.
//! - Under `ConflictPolicy::Detect`, updates and deletes only touch rows
//!   whose `version` still equals the one the context loaded.
//! - `Company::related_persons` is never stored on the company row; it is
//!   derived from `persons.company_uuid` ordered by `company_position`.

use super::error::{CommitError, CommitResult, FetchError, FetchResult};
use crate::config::ConflictPolicy;
use crate::model::{Company, Entity, EntityId, EntityKind, EntityRecord, ObjectKey, Person};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

const COMPANY_SELECT_SQL: &str = "SELECT uuid, name, location, version FROM companies";
const PERSON_SELECT_SQL: &str = "SELECT uuid, name, company_uuid, version FROM persons";

/// One stored row mapped to its record plus the version stamp it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredRecord {
    pub record: EntityRecord,
    pub version: i64,
}

fn select_sql(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Company => COMPANY_SELECT_SQL,
        EntityKind::Person => PERSON_SELECT_SQL,
    }
}

/// Runs `SELECT ... <tail>` for `kind` and maps every row.
pub(crate) fn select_records(
    conn: &Connection,
    kind: EntityKind,
    tail: &str,
    binds: Vec<Value>,
) -> FetchResult<Vec<StoredRecord>> {
    let sql = format!("{}{tail}", select_sql(kind));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(binds))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(parse_row(kind, row)?);
    }

    if kind == EntityKind::Company {
        for stored in &mut records {
            if let EntityRecord::Company(company) = &mut stored.record {
                *company.related_persons_mut() = load_related_persons(conn, company.id())?;
            }
        }
    }

    Ok(records)
}

/// Loads one row by key.
pub(crate) fn select_record(conn: &Connection, key: ObjectKey) -> FetchResult<Option<StoredRecord>> {
    let mut records = select_records(
        conn,
        key.kind,
        " WHERE uuid = ?",
        vec![Value::Text(key.id.to_string())],
    )?;
    Ok(records.pop())
}

fn load_related_persons(conn: &Connection, company: EntityId) -> FetchResult<Vec<EntityId>> {
    let mut stmt = conn.prepare(
        "SELECT uuid
         FROM persons
         WHERE company_uuid = ?1
         ORDER BY company_position ASC, rowid ASC;",
    )?;
    let mut rows = stmt.query([company.to_string()])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let value: String = row.get(0)?;
        ids.push(parse_uuid(&value, "persons.uuid")?);
    }
    Ok(ids)
}

fn parse_row(kind: EntityKind, row: &Row<'_>) -> FetchResult<StoredRecord> {
    let uuid_text: String = row.get("uuid")?;
    let column = match kind {
        EntityKind::Company => "companies.uuid",
        EntityKind::Person => "persons.uuid",
    };
    let id = parse_uuid(&uuid_text, column)?;

    let version: i64 = row.get("version")?;
    if version < 1 {
        return Err(FetchError::InvalidData(format!(
            "invalid version `{version}` for {kind}/{id}"
        )));
    }

    let record = match kind {
        EntityKind::Company => EntityRecord::Company(Company::from_parts(
            id,
            row.get("name")?,
            row.get("location")?,
            Vec::new(),
        )),
        EntityKind::Person => {
            let company = row
                .get::<_, Option<String>>("company_uuid")?
                .map(|value| parse_uuid(&value, "persons.company_uuid"))
                .transpose()?;
            EntityRecord::Person(Person::from_parts(id, row.get("name")?, company))
        }
    };

    Ok(StoredRecord { record, version })
}

fn parse_uuid(value: &str, column: &'static str) -> FetchResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| FetchError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

/// Inserts a new row at version 1.
pub(crate) fn insert_record(conn: &Connection, record: &EntityRecord) -> CommitResult<()> {
    let key = record.key();
    if current_version(conn, key)?.is_some() {
        return Err(CommitError::DuplicateRow(key));
    }

    match record {
        EntityRecord::Company(company) => {
            conn.execute(
                "INSERT INTO companies (uuid, name, location, version)
                 VALUES (?1, ?2, ?3, 1);",
                params![
                    key.id.to_string(),
                    company.name.as_deref(),
                    company.location.as_deref(),
                ],
            )?;
        }
        EntityRecord::Person(person) => {
            conn.execute(
                "INSERT INTO persons (uuid, name, company_uuid, version)
                 VALUES (?1, ?2, ?3, 1);",
                params![
                    key.id.to_string(),
                    person.name.as_deref(),
                    person.related_company().map(|id| id.to_string()),
                ],
            )?;
        }
    }
    Ok(())
}

/// Updates an existing row and returns its new version.
pub(crate) fn update_record(
    conn: &Connection,
    record: &EntityRecord,
    expected_version: i64,
    policy: ConflictPolicy,
) -> CommitResult<i64> {
    let key = record.key();
    let (table, assignments, mut binds) = match record {
        EntityRecord::Company(company) => (
            "companies",
            "name = ?, location = ?",
            vec![
                optional_text(company.name.as_deref()),
                optional_text(company.location.as_deref()),
            ],
        ),
        EntityRecord::Person(person) => (
            "persons",
            "name = ?, company_uuid = ?",
            vec![
                optional_text(person.name.as_deref()),
                person
                    .related_company()
                    .map_or(Value::Null, |id| Value::Text(id.to_string())),
            ],
        ),
    };

    let mut sql = format!(
        "UPDATE {table}
         SET {assignments},
             version = version + 1,
             updated_at = (strftime('%s', 'now') * 1000)
         WHERE uuid = ?"
    );
    binds.push(Value::Text(key.id.to_string()));
    if policy == ConflictPolicy::Detect {
        sql.push_str(" AND version = ?");
        binds.push(Value::Integer(expected_version));
    }
    sql.push(';');

    let changed = conn.execute(&sql, params_from_iter(binds))?;

    if changed == 0 {
        return Err(diagnose_stale_write(conn, key, expected_version)?);
    }

    match current_version(conn, key)? {
        Some(version) => Ok(version),
        None => Err(CommitError::MissingRow(key)),
    }
}

/// Deletes a row. Under `Overwrite`, deleting an already missing row is a no-op.
pub(crate) fn delete_record(
    conn: &Connection,
    key: ObjectKey,
    expected_version: i64,
    policy: ConflictPolicy,
) -> CommitResult<()> {
    let table = key.kind.table();
    let changed = match policy {
        ConflictPolicy::Detect => conn.execute(
            &format!("DELETE FROM {table} WHERE uuid = ?1 AND version = ?2;"),
            params![key.id.to_string(), expected_version],
        )?,
        ConflictPolicy::Overwrite => {
            conn.execute(
                &format!("DELETE FROM {table} WHERE uuid = ?1;"),
                [key.id.to_string()],
            )?;
            return Ok(());
        }
    };

    if changed == 0 {
        return Err(diagnose_stale_write(conn, key, expected_version)?);
    }
    Ok(())
}

/// Persists the order of `related_persons` into `persons.company_position`.
pub(crate) fn write_company_positions(conn: &Connection, company: &Company) -> CommitResult<()> {
    let company_uuid = company.id().to_string();
    for (position, person) in company.related_persons().iter().enumerate() {
        conn.execute(
            "UPDATE persons
             SET company_position = ?3
             WHERE uuid = ?1
               AND company_uuid = ?2;",
            params![person.to_string(), company_uuid, position as i64],
        )?;
    }
    Ok(())
}

fn diagnose_stale_write(
    conn: &Connection,
    key: ObjectKey,
    expected: i64,
) -> CommitResult<CommitError> {
    Ok(match current_version(conn, key)? {
        None => CommitError::MissingRow(key),
        Some(found) => CommitError::VersionConflict {
            key,
            expected,
            found,
        },
    })
}

fn current_version(conn: &Connection, key: ObjectKey) -> CommitResult<Option<i64>> {
    let version = conn
        .query_row(
            &format!("SELECT version FROM {} WHERE uuid = ?1;", key.kind.table()),
            [key.id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db_in_memory;

    fn stored_company(conn: &Connection, name: &str) -> Company {
        let mut company = Company::new();
        company.name = Some(name.to_string());
        insert_record(conn, &company.clone().into_record()).unwrap();
        company
    }

    #[test]
    fn detect_policy_rejects_stale_version() {
        let conn = open_db_in_memory().unwrap();
        let mut company = stored_company(&conn, "Acme");
        let key = company.clone().into_record().key();

        company.name = Some("First".to_string());
        let record = company.clone().into_record();
        assert_eq!(
            update_record(&conn, &record, 1, ConflictPolicy::Detect).unwrap(),
            2
        );

        let err = update_record(&conn, &record, 1, ConflictPolicy::Detect).unwrap_err();
        assert!(matches!(
            err,
            CommitError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert_eq!(current_version(&conn, key).unwrap(), Some(2));
    }

    #[test]
    fn overwrite_policy_ignores_version_but_not_missing_rows() {
        let conn = open_db_in_memory().unwrap();
        let mut company = stored_company(&conn, "Acme");
        let key = company.clone().into_record().key();

        company.location = Some("Tokyo".to_string());
        let version =
            update_record(&conn, &company.clone().into_record(), 7, ConflictPolicy::Overwrite)
                .unwrap();
        assert_eq!(version, 2);
        let location: Option<String> = conn
            .query_row(
                "SELECT location FROM companies WHERE uuid = ?1;",
                [key.id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(location.as_deref(), Some("Tokyo"));

        let ghost = Company::new().into_record();
        let err = update_record(&conn, &ghost, 1, ConflictPolicy::Overwrite).unwrap_err();
        assert!(matches!(err, CommitError::MissingRow(missing) if missing == ghost.key()));
    }
}
