//! Company use-case service.
//!
//! # Responsibility
//! - Provide the add/rename/remove/list flows of the company roster.
//! - Attach persons to companies through context relationship operations.
//!
//! # Invariants
//! - Writes run on the isolated domain; listings read the coordinating one.
//! - A failed write leaves nothing pending on the isolated domain.
//! - Positions passed to `rename_company_at` index the insertion-ordered
//!   listing returned by `list_companies`.

use crate::context::{ExecutionDomain, Snapshot};
use log::warn;
use crate::model::{Company, CompanyId, Entity, Person, PersonField, PersonId};
use crate::repo::entity_repo::EntityRepository;
use crate::store::{FetchRequest, Predicate, StoreResult};

/// Use-case service wrapper for company roster operations.
pub struct CompanyService<R: EntityRepository> {
    repo: R,
}

impl<R: EntityRepository> CompanyService<R> {
    /// Creates a service using the provided repository implementation.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Creates and commits a company. Returns its stable id.
    pub fn add_company(
        &self,
        name: impl Into<String>,
        location: Option<String>,
    ) -> StoreResult<CompanyId> {
        let result = self.insert_company(name.into(), location);
        self.discard_on_error(result)
    }

    fn insert_company(&self, name: String, location: Option<String>) -> StoreResult<CompanyId> {
        let handle = self.repo.new_entity::<Company>(ExecutionDomain::Isolated)?;
        self.repo.modify(handle, move |company| {
            company.name = Some(name);
            company.location = location;
        })?;
        self.repo.insert(handle, ExecutionDomain::Isolated)?;
        Ok(handle.id())
    }

    /// Renames the company at `index` of the current listing.
    ///
    /// Returns `None` when `index` is out of range.
    pub fn rename_company_at(
        &self,
        index: usize,
        name: impl Into<String>,
    ) -> StoreResult<Option<CompanyId>> {
        let result = self.rename_at(index, name.into());
        self.discard_on_error(result)
    }

    fn rename_at(&self, index: usize, name: String) -> StoreResult<Option<CompanyId>> {
        let companies = self.repo.fetch_all::<Company>(ExecutionDomain::Isolated)?;
        let Some(target) = companies.get(index) else {
            return Ok(None);
        };

        self.repo.modify(target.handle(), move |company| {
            company.name = Some(name);
        })?;
        self.repo.update(ExecutionDomain::Isolated)?;
        Ok(Some(target.id()))
    }

    /// Deletes a company by id; its persons stay, detached.
    ///
    /// Returns `false` when no such company is stored.
    pub fn remove_company(&self, id: CompanyId) -> StoreResult<bool> {
        let result = self.delete_company(id);
        self.discard_on_error(result)
    }

    fn delete_company(&self, id: CompanyId) -> StoreResult<bool> {
        let found = self.repo.fetch_single::<Company>(
            Some(Predicate::id(id)),
            Vec::new(),
            ExecutionDomain::Isolated,
        )?;
        let Some(company) = found else {
            return Ok(false);
        };
        self.repo
            .delete(company.handle(), ExecutionDomain::Isolated)?;
        Ok(true)
    }

    /// Every stored company, in insertion order.
    pub fn list_companies(&self) -> StoreResult<Vec<Snapshot<Company>>> {
        self.repo.fetch_all::<Company>(ExecutionDomain::Coordinating)
    }

    /// Creates a person attached to `company_id` and commits both sides.
    ///
    /// Returns `None` when the company does not exist.
    pub fn add_person(
        &self,
        company_id: CompanyId,
        name: impl Into<String>,
    ) -> StoreResult<Option<PersonId>> {
        let name = name.into();
        self.repo
            .with_scope(ExecutionDomain::Isolated, move |scope| -> StoreResult<Option<PersonId>> {
                let company = scope
                    .fetch_single::<Company>(Some(Predicate::id(company_id)), Vec::new())?;
                let Some(company) = company else {
                    return Ok(None);
                };

                let person = scope.create::<Person>()?;
                scope.get_mut(person)?.name = Some(name);
                scope.relate(company.handle(), person)?;
                if let Err(err) = scope.save() {
                    scope.rollback();
                    return Err(err);
                }
                Ok(Some(person.id()))
            })?
    }

    /// Persons of `company_id`, in the company's relationship order.
    pub fn list_persons(&self, company_id: CompanyId) -> StoreResult<Vec<Snapshot<Person>>> {
        let mut persons = self.repo.fetch(
            FetchRequest::<Person>::filtered(Predicate::eq(
                PersonField::Company,
                company_id.to_string(),
            )),
            ExecutionDomain::Coordinating,
        )?;

        let company = self.repo.fetch_single::<Company>(
            Some(Predicate::id(company_id)),
            Vec::new(),
            ExecutionDomain::Coordinating,
        )?;
        if let Some(company) = company {
            let order = company.related_persons();
            persons.sort_by_key(|person| {
                order
                    .iter()
                    .position(|id| *id == person.id())
                    .unwrap_or(usize::MAX)
            });
        }
        Ok(persons)
    }

    /// Rolls the isolated domain back when `result` is an error.
    fn discard_on_error<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(err) = &result {
            if let Err(rollback_err) = self.repo.rollback(ExecutionDomain::Isolated) {
                warn!(
                    "event=service_rollback module=service status=error cause={} error={}",
                    err, rollback_err
                );
            }
        }
        result
    }
}
