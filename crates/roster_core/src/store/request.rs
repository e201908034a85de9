//! Typed fetch requests: filter, ordering and paging for one entity kind.
//!
//! # Invariants
//! - Values are always bound as parameters, never spliced into SQL text.
//! - Ordering is deterministic: explicit sort keys, then insertion order.

use crate::model::{Entity, EntityField, EntityId};
use rusqlite::types::Value;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;

/// Comparison operator for `Predicate::Compare`. Compares column text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    fn operator(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        }
    }
}

/// Filter over the columns of one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate<F: EntityField> {
    IdEquals(EntityId),
    IdIn(Vec<EntityId>),
    /// `None` matches SQL NULL.
    Equals(F, Option<String>),
    NotEquals(F, Option<String>),
    Compare(F, Comparison, String),
    /// Substring match, ASCII case-insensitive.
    Contains(F, String),
    And(Vec<Predicate<F>>),
    Or(Vec<Predicate<F>>),
    Not(Box<Predicate<F>>),
}

impl<F: EntityField> Predicate<F> {
    pub fn id(id: EntityId) -> Self {
        Self::IdEquals(id)
    }

    pub fn eq(field: F, value: impl Into<String>) -> Self {
        Self::Equals(field, Some(value.into()))
    }

    pub fn is_null(field: F) -> Self {
        Self::Equals(field, None)
    }

    pub fn contains(field: F, needle: impl Into<String>) -> Self {
        Self::Contains(field, needle.into())
    }

    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Self) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    fn write_sql(&self, sql: &mut String, binds: &mut Vec<Value>) {
        match self {
            Self::IdEquals(id) => {
                sql.push_str("uuid = ?");
                binds.push(Value::Text(id.to_string()));
            }
            Self::IdIn(ids) => {
                if ids.is_empty() {
                    sql.push_str("1 = 0");
                    return;
                }
                sql.push_str("uuid IN (");
                for (index, id) in ids.iter().enumerate() {
                    if index > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('?');
                    binds.push(Value::Text(id.to_string()));
                }
                sql.push(')');
            }
            Self::Equals(field, Some(value)) => {
                sql.push_str(&format!("{} = ?", field.column()));
                binds.push(Value::Text(value.clone()));
            }
            Self::Equals(field, None) => {
                sql.push_str(&format!("{} IS NULL", field.column()));
            }
            Self::NotEquals(field, Some(value)) => {
                let column = field.column();
                sql.push_str(&format!("({column} IS NULL OR {column} <> ?)"));
                binds.push(Value::Text(value.clone()));
            }
            Self::NotEquals(field, None) => {
                sql.push_str(&format!("{} IS NOT NULL", field.column()));
            }
            Self::Compare(field, comparison, value) => {
                sql.push_str(&format!("{} {} ?", field.column(), comparison.operator()));
                binds.push(Value::Text(value.clone()));
            }
            Self::Contains(field, needle) => {
                sql.push_str(&format!("{} LIKE ? ESCAPE '\\'", field.column()));
                binds.push(Value::Text(format!("%{}%", escape_like(needle))));
            }
            Self::And(parts) => write_joined(parts, " AND ", "1 = 1", sql, binds),
            Self::Or(parts) => write_joined(parts, " OR ", "1 = 0", sql, binds),
            Self::Not(inner) => {
                sql.push_str("NOT (");
                inner.write_sql(sql, binds);
                sql.push(')');
            }
        }
    }
}

fn write_joined<F: EntityField>(
    parts: &[Predicate<F>],
    separator: &str,
    empty: &str,
    sql: &mut String,
    binds: &mut Vec<Value>,
) {
    if parts.is_empty() {
        sql.push_str(empty);
        return;
    }
    sql.push('(');
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            sql.push_str(separator);
        }
        part.write_sql(sql, binds);
    }
    sql.push(')');
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Sort key: a column of the entity kind or one of the bookkeeping columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey<F: EntityField> {
    Id,
    CreatedAt,
    UpdatedAt,
    Field(F),
}

impl<F: EntityField> SortKey<F> {
    fn column(self) -> &'static str {
        match self {
            Self::Id => "uuid",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Field(field) => field.column(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortDescriptor<F: EntityField> {
    pub key: SortKey<F>,
    pub ascending: bool,
}

impl<F: EntityField> SortDescriptor<F> {
    pub fn ascending(key: SortKey<F>) -> Self {
        Self {
            key,
            ascending: true,
        }
    }

    pub fn descending(key: SortKey<F>) -> Self {
        Self {
            key,
            ascending: false,
        }
    }

    /// Ascending sort on an entity field.
    pub fn by(field: F) -> Self {
        Self::ascending(SortKey::Field(field))
    }
}

/// Fetch request for entity kind `T`.
pub struct FetchRequest<T: Entity> {
    pub predicate: Option<Predicate<T::Field>>,
    pub sort: Vec<SortDescriptor<T::Field>>,
    pub limit: Option<u32>,
    pub offset: u32,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> FetchRequest<T> {
    /// Every stored record of `T`, in insertion order.
    pub fn all() -> Self {
        Self {
            predicate: None,
            sort: Vec::new(),
            limit: None,
            offset: 0,
            _entity: PhantomData,
        }
    }

    pub fn filtered(predicate: Predicate<T::Field>) -> Self {
        Self::all().with_predicate(predicate)
    }

    pub fn with_predicate(mut self, predicate: Predicate<T::Field>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sorted_by(mut self, descriptor: SortDescriptor<T::Field>) -> Self {
        self.sort.push(descriptor);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Renders the `WHERE`/`ORDER BY`/`LIMIT` tail and its bind values.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut binds = Vec::new();

        if let Some(predicate) = self.predicate.as_ref() {
            sql.push_str(" WHERE ");
            predicate.write_sql(&mut sql, &mut binds);
        }

        sql.push_str(" ORDER BY ");
        for descriptor in &self.sort {
            sql.push_str(descriptor.key.column());
            sql.push_str(if descriptor.ascending {
                " ASC, "
            } else {
                " DESC, "
            });
        }
        sql.push_str("rowid ASC");

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Value::Integer(i64::from(limit)));
            if self.offset > 0 {
                sql.push_str(" OFFSET ?");
                binds.push(Value::Integer(i64::from(self.offset)));
            }
        } else if self.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            binds.push(Value::Integer(i64::from(self.offset)));
        }

        (sql, binds)
    }
}

impl<T: Entity> Default for FetchRequest<T> {
    fn default() -> Self {
        Self::all()
    }
}

impl<T: Entity> Clone for FetchRequest<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            sort: self.sort.clone(),
            limit: self.limit,
            offset: self.offset,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Debug for FetchRequest<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("kind", &T::KIND)
            .field("predicate", &self.predicate)
            .field("sort", &self.sort)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}
