//! Filter, ordering and pagination requests for record queries.
//!
//! # Responsibility
//! - Define the fixed predicate and ordering vocabulary per entity kind.
//! - Compile a request into a SQL `WHERE`/`ORDER BY` fragment with binds.
//!
//! # Invariants
//! - Filters unsupported by a kind are rejected, never silently dropped.
//! - Search terms are matched literally; LIKE wildcards are escaped.
//! - Results are always ordered deterministically (identity as tie-breaker).

use super::{StoreError, StoreResult};
use crate::model::EntityKind;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Named predicate. `R` is the reference type: domain handles at the session
/// level, record handles inside the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", content = "arg", rename_all = "snake_case")]
pub enum Filter<R> {
    IsDone(bool),
    IsDeleted(bool),
    /// Task parent; `None` selects top-level tasks.
    ParentIs(Option<R>),
    /// Note/attachment owner; `None` selects orphans.
    TaskIs(Option<R>),
    HasTag(R),
    HasUser(R),
    /// Tags, users, notes or attachments linked to a task.
    HasTask(R),
    IdIn(Vec<i64>),
    IdNotIn(Vec<i64>),
    /// Case-insensitive substring over the kind's two text fields.
    Search(String),
    OrderNumAbove(i64),
    OrderNumBelow(i64),
    DeadlineSet(bool),
    ValueIs(String),
    EmailIs(String),
    KeyIn(Vec<String>),
}

impl<R> Filter<R> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IsDone(_) => "is_done",
            Self::IsDeleted(_) => "is_deleted",
            Self::ParentIs(_) => "parent_is",
            Self::TaskIs(_) => "task_is",
            Self::HasTag(_) => "has_tag",
            Self::HasUser(_) => "has_user",
            Self::HasTask(_) => "has_task",
            Self::IdIn(_) => "id_in",
            Self::IdNotIn(_) => "id_not_in",
            Self::Search(_) => "search",
            Self::OrderNumAbove(_) => "order_num_above",
            Self::OrderNumBelow(_) => "order_num_below",
            Self::DeadlineSet(_) => "deadline_set",
            Self::ValueIs(_) => "value_is",
            Self::EmailIs(_) => "email_is",
            Self::KeyIn(_) => "key_in",
        }
    }

    /// Re-types the references of this filter. Returns `None` as soon as one
    /// reference cannot be translated.
    pub fn map_refs<S>(&self, mut translate: impl FnMut(&R) -> Option<S>) -> Option<Filter<S>> {
        let mapped = match self {
            Self::IsDone(value) => Filter::IsDone(*value),
            Self::IsDeleted(value) => Filter::IsDeleted(*value),
            Self::ParentIs(None) => Filter::ParentIs(None),
            Self::ParentIs(Some(parent)) => Filter::ParentIs(Some(translate(parent)?)),
            Self::TaskIs(None) => Filter::TaskIs(None),
            Self::TaskIs(Some(task)) => Filter::TaskIs(Some(translate(task)?)),
            Self::HasTag(tag) => Filter::HasTag(translate(tag)?),
            Self::HasUser(user) => Filter::HasUser(translate(user)?),
            Self::HasTask(task) => Filter::HasTask(translate(task)?),
            Self::IdIn(ids) => Filter::IdIn(ids.clone()),
            Self::IdNotIn(ids) => Filter::IdNotIn(ids.clone()),
            Self::Search(term) => Filter::Search(term.clone()),
            Self::OrderNumAbove(value) => Filter::OrderNumAbove(*value),
            Self::OrderNumBelow(value) => Filter::OrderNumBelow(*value),
            Self::DeadlineSet(value) => Filter::DeadlineSet(*value),
            Self::ValueIs(value) => Filter::ValueIs(value.clone()),
            Self::EmailIs(value) => Filter::EmailIs(value.clone()),
            Self::KeyIn(keys) => Filter::KeyIn(keys.clone()),
        };
        Some(mapped)
    }
}

/// Orderable fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Id,
    OrderNum,
    Deadline,
    Summary,
    Value,
    Timestamp,
    Email,
    Key,
}

impl SortField {
    pub fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::OrderNum => "order_num",
            Self::Deadline => "deadline",
            Self::Summary => "summary",
            Self::Value => "value",
            Self::Timestamp => "timestamp",
            Self::Email => "email",
            Self::Key => "key",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Query options for listing records of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query<R> {
    /// All filters must match.
    pub filters: Vec<Filter<R>>,
    pub order_by: Vec<(SortField, SortDirection)>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl<R> Default for Query<R> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }
}

impl<R> Query<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter<R>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: SortField, direction: SortDirection) -> Self {
        self.order_by.push((field, direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Re-types every filter reference; `None` when one cannot be translated.
    pub fn map_refs<S>(&self, mut translate: impl FnMut(&R) -> Option<S>) -> Option<Query<S>> {
        let filters = self
            .filters
            .iter()
            .map(|filter| filter.map_refs(&mut translate))
            .collect::<Option<Vec<_>>>()?;
        Some(Query {
            filters,
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// Compiled `WHERE` and `ORDER BY` clauses of one query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlClauses {
    pub where_sql: String,
    pub order_sql: String,
    pub binds: Vec<Value>,
}

/// Table name backing `kind`.
pub(crate) fn table_of(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => "tasks",
        EntityKind::Tag => "tags",
        EntityKind::Note => "notes",
        EntityKind::Attachment => "attachments",
        EntityKind::User => "users",
        EntityKind::AppOption => "options",
    }
}

/// Identity column of `kind`.
pub(crate) fn id_column_of(kind: EntityKind) -> &'static str {
    if kind.is_keyed() {
        "key"
    } else {
        "id"
    }
}

/// Compiles filters and ordering. `id_of` translates record references into
/// row ids.
pub(crate) fn compile<R>(
    kind: EntityKind,
    query: &Query<R>,
    mut id_of: impl FnMut(&R) -> StoreResult<i64>,
) -> StoreResult<SqlClauses> {
    let mut conditions: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    for filter in &query.filters {
        let unsupported = || StoreError::UnsupportedFilter {
            kind,
            filter: filter.name(),
        };
        match (kind, filter) {
            (EntityKind::Task, Filter::IsDone(value)) => {
                conditions.push("is_done = ?".to_string());
                binds.push(Value::Integer(i64::from(*value)));
            }
            (EntityKind::Task, Filter::IsDeleted(value)) => {
                conditions.push("is_deleted = ?".to_string());
                binds.push(Value::Integer(i64::from(*value)));
            }
            (EntityKind::Task, Filter::ParentIs(parent)) => {
                push_optional_ref(&mut conditions, &mut binds, "parent_id", parent, &mut id_of)?;
            }
            (EntityKind::Note | EntityKind::Attachment, Filter::TaskIs(task)) => {
                push_optional_ref(&mut conditions, &mut binds, "task_id", task, &mut id_of)?;
            }
            (EntityKind::Task, Filter::HasTag(tag)) => {
                conditions.push("id IN (SELECT task_id FROM task_tags WHERE tag_id = ?)".into());
                binds.push(Value::Integer(id_of(tag)?));
            }
            (EntityKind::Task, Filter::HasUser(user)) => {
                conditions.push("id IN (SELECT task_id FROM task_users WHERE user_id = ?)".into());
                binds.push(Value::Integer(id_of(user)?));
            }
            (EntityKind::Tag, Filter::HasTask(task)) => {
                conditions.push("id IN (SELECT tag_id FROM task_tags WHERE task_id = ?)".into());
                binds.push(Value::Integer(id_of(task)?));
            }
            (EntityKind::User, Filter::HasTask(task)) => {
                conditions.push("id IN (SELECT user_id FROM task_users WHERE task_id = ?)".into());
                binds.push(Value::Integer(id_of(task)?));
            }
            (EntityKind::Note | EntityKind::Attachment, Filter::HasTask(task)) => {
                conditions.push("task_id = ?".to_string());
                binds.push(Value::Integer(id_of(task)?));
            }
            (kind, Filter::IdIn(ids)) if !kind.is_keyed() => {
                if ids.is_empty() {
                    conditions.push("0".to_string());
                } else {
                    conditions.push(format!("id IN ({})", placeholders(ids.len())));
                    binds.extend(ids.iter().map(|id| Value::Integer(*id)));
                }
            }
            (kind, Filter::IdNotIn(ids)) if !kind.is_keyed() => {
                if !ids.is_empty() {
                    conditions.push(format!("id NOT IN ({})", placeholders(ids.len())));
                    binds.extend(ids.iter().map(|id| Value::Integer(*id)));
                }
            }
            (kind, Filter::Search(term)) => {
                let Some(pattern) = normalize_search_term(term).map(|term| like_pattern(&term))
                else {
                    continue;
                };
                let columns = search_columns(kind);
                let clause = columns
                    .iter()
                    .map(|column| format!("{column} LIKE ? ESCAPE '\\'"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                conditions.push(format!("({clause})"));
                binds.extend(columns.iter().map(|_| Value::Text(pattern.clone())));
            }
            (EntityKind::Task, Filter::OrderNumAbove(value)) => {
                conditions.push("order_num > ?".to_string());
                binds.push(Value::Integer(*value));
            }
            (EntityKind::Task, Filter::OrderNumBelow(value)) => {
                conditions.push("order_num < ?".to_string());
                binds.push(Value::Integer(*value));
            }
            (EntityKind::Task, Filter::DeadlineSet(true)) => {
                conditions.push("deadline IS NOT NULL".to_string());
            }
            (EntityKind::Task, Filter::DeadlineSet(false)) => {
                conditions.push("deadline IS NULL".to_string());
            }
            (EntityKind::Tag | EntityKind::AppOption, Filter::ValueIs(value)) => {
                conditions.push("value = ?".to_string());
                binds.push(Value::Text(value.clone()));
            }
            (EntityKind::User, Filter::EmailIs(email)) => {
                conditions.push("email = ?".to_string());
                binds.push(Value::Text(email.clone()));
            }
            (EntityKind::AppOption, Filter::KeyIn(keys)) => {
                if keys.is_empty() {
                    conditions.push("0".to_string());
                } else {
                    conditions.push(format!("key IN ({})", placeholders(keys.len())));
                    binds.extend(keys.iter().map(|key| Value::Text(key.clone())));
                }
            }
            _ => return Err(unsupported()),
        }
    }

    let mut order_terms = Vec::with_capacity(query.order_by.len() + 1);
    for (field, direction) in &query.order_by {
        let column = sort_column(kind, *field).ok_or(StoreError::UnsupportedSort {
            kind,
            field: field.name(),
        })?;
        order_terms.push(format!("{column} {}", direction.as_sql()));
    }
    let id_column = id_column_of(kind);
    if !query
        .order_by
        .iter()
        .any(|(field, _)| sort_column(kind, *field) == Some(id_column))
    {
        order_terms.push(format!("{id_column} ASC"));
    }

    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    Ok(SqlClauses {
        where_sql,
        order_sql: format!(" ORDER BY {}", order_terms.join(", ")),
        binds,
    })
}

/// Collapses whitespace runs and trims. Blank terms yield `None`.
pub fn normalize_search_term(term: &str) -> Option<String> {
    let collapsed = WHITESPACE_RUN.replace_all(term.trim(), " ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.into_owned())
    }
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn search_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Task => &["summary", "description"],
        EntityKind::Tag => &["value", "description"],
        EntityKind::Note => &["content"],
        EntityKind::Attachment => &["filename", "description"],
        EntityKind::User => &["email"],
        EntityKind::AppOption => &["key", "value"],
    }
}

fn sort_column(kind: EntityKind, field: SortField) -> Option<&'static str> {
    let column = match (kind, field) {
        (EntityKind::AppOption, SortField::Key) => "key",
        (EntityKind::AppOption, SortField::Value) => "value",
        (EntityKind::AppOption, _) => return None,
        (_, SortField::Id) => "id",
        (EntityKind::Task, SortField::OrderNum) => "order_num",
        (EntityKind::Task, SortField::Deadline) => "deadline",
        (EntityKind::Task, SortField::Summary) => "summary",
        (EntityKind::Tag, SortField::Value) => "value",
        (EntityKind::Note | EntityKind::Attachment, SortField::Timestamp) => "timestamp",
        (EntityKind::User, SortField::Email) => "email",
        _ => return None,
    };
    Some(column)
}

fn push_optional_ref<R>(
    conditions: &mut Vec<String>,
    binds: &mut Vec<Value>,
    column: &str,
    target: &Option<R>,
    id_of: &mut impl FnMut(&R) -> StoreResult<i64>,
) -> StoreResult<()> {
    match target {
        Some(target) => {
            conditions.push(format!("{column} = ?"));
            binds.push(Value::Integer(id_of(target)?));
        }
        None => conditions.push(format!("{column} IS NULL")),
    }
    Ok(())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::{compile, normalize_search_term, Filter, Query, SortDirection, SortField};
    use crate::model::EntityKind;
    use crate::store::StoreError;
    use rusqlite::types::Value;

    #[test]
    fn search_terms_are_collapsed_and_blank_terms_ignored() {
        assert_eq!(
            normalize_search_term("  buy \t  milk\n"),
            Some("buy milk".to_string())
        );
        assert_eq!(normalize_search_term(" \n "), None);
    }

    #[test]
    fn search_escapes_like_wildcards() {
        let query: Query<i64> = Query::new().filter(Filter::Search("50%_off".into()));
        let clauses = compile(EntityKind::Tag, &query, |id| Ok(*id)).unwrap();
        assert_eq!(
            clauses.binds[0],
            Value::Text("%50\\%\\_off%".to_string())
        );
        assert_eq!(clauses.binds.len(), 2);
    }

    #[test]
    fn ordering_appends_identity_tie_breaker() {
        let query: Query<i64> = Query::new().order_by(SortField::OrderNum, SortDirection::Desc);
        let clauses = compile(EntityKind::Task, &query, |id| Ok(*id)).unwrap();
        assert_eq!(clauses.order_sql, " ORDER BY order_num DESC, id ASC");
    }

    #[test]
    fn unsupported_filters_and_orderings_are_rejected() {
        let query: Query<i64> = Query::new().filter(Filter::EmailIs("a@b.c".into()));
        assert!(matches!(
            compile(EntityKind::Task, &query, |id| Ok(*id)),
            Err(StoreError::UnsupportedFilter { .. })
        ));
        let query: Query<i64> = Query::new().order_by(SortField::Deadline, SortDirection::Asc);
        assert!(matches!(
            compile(EntityKind::Tag, &query, |id| Ok(*id)),
            Err(StoreError::UnsupportedSort { .. })
        ));
    }

    #[test]
    fn map_refs_stops_on_untranslatable_reference() {
        let query: Query<u8> = Query::new()
            .filter(Filter::ParentIs(None))
            .filter(Filter::HasTag(3));
        assert!(query.map_refs(|_| None::<u8>).is_none());
        let mapped = query.map_refs(|value| Some(i64::from(*value) * 10)).unwrap();
        assert_eq!(mapped.filters[1], Filter::HasTag(30));
    }
}
