//! Record store contracts and the SQLite implementation.
//!
//! # Responsibility
//! - Define the storage-engine collaborator consumed by the bridge.
//! - Keep SQL details behind [`RecordStore`].
//!
//! # Invariants
//! - Records are addressed by [`RecordHandle`]s that stay valid for the
//!   lifetime of the store, including after the record is discarded.
//! - `flush` is atomic: either every pending write lands or none does.
//! - `rollback` discards everything written since the last `commit`.

use crate::db::DbError;
use crate::model::field::{Field, FieldValue};
use crate::model::{EntityId, EntityKind};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod query;
mod record;
pub mod sqlite;

pub use query::{Filter, Query, SortDirection, SortField};
pub use sqlite::SqliteRecordStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Stable handle of one storage-backed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordHandle(u32);

impl RecordHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for RecordHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "record#{}", self.0)
    }
}

/// Store-layer error.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    UnknownRecord(RecordHandle),
    /// The record was deleted and committed, or rolled back before it was
    /// ever committed.
    DiscardedRecord(RecordHandle),
    /// Identity and derived fields cannot be written once stored.
    ReadOnlyField {
        kind: EntityKind,
        field: Field,
    },
    UnknownField {
        kind: EntityKind,
        field: Field,
    },
    UnsupportedFilter {
        kind: EntityKind,
        filter: &'static str,
    },
    UnsupportedSort {
        kind: EntityKind,
        field: &'static str,
    },
    InvalidData(String),
}

impl StoreError {
    /// Whether the underlying database rejected a write on a constraint,
    /// such as a duplicate identity.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_constraint_violation())
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::UnknownRecord(handle) => write!(f, "unknown {handle}"),
            Self::DiscardedRecord(handle) => write!(f, "{handle} has been discarded"),
            Self::ReadOnlyField { kind, field } => {
                write!(f, "{kind} field `{}` is read-only in storage", field.name())
            }
            Self::UnknownField { kind, field } => {
                write!(f, "{kind} record has no field `{}`", field.name())
            }
            Self::UnsupportedFilter { kind, filter } => {
                write!(f, "filter `{filter}` is not supported for {kind}")
            }
            Self::UnsupportedSort { kind, field } => {
                write!(f, "ordering by `{field}` is not supported for {kind}")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Storage engine consumed by the bridge.
///
/// Relationship fields may be addressed from either side; implementations
/// keep both sides consistent on their own.
pub trait RecordStore {
    /// Creates a pending record. Its identity is assigned no later than the
    /// next flush.
    fn create(&mut self, kind: EntityKind) -> StoreResult<RecordHandle>;

    /// Looks up a stored record by identity. Records created since the last
    /// flush are not found.
    fn find(&mut self, kind: EntityKind, id: &EntityId) -> StoreResult<Option<RecordHandle>>;

    fn kind(&self, handle: RecordHandle) -> StoreResult<EntityKind>;

    /// Whether the record is neither deleted nor discarded.
    fn is_live(&self, handle: RecordHandle) -> bool;

    fn get(&mut self, handle: RecordHandle, field: Field)
        -> StoreResult<FieldValue<RecordHandle>>;

    /// Writes a scalar or single-reference field.
    fn set(
        &mut self,
        handle: RecordHandle,
        field: Field,
        value: FieldValue<RecordHandle>,
    ) -> StoreResult<()>;

    /// Adds `member` to a relationship collection. Existing members are
    /// ignored.
    fn link(&mut self, handle: RecordHandle, field: Field, member: RecordHandle)
        -> StoreResult<()>;

    /// Removes `member` from a relationship collection if present.
    fn unlink(
        &mut self,
        handle: RecordHandle,
        field: Field,
        member: RecordHandle,
    ) -> StoreResult<()>;

    /// Marks the record deleted. Links to it are dropped immediately.
    fn delete(&mut self, handle: RecordHandle) -> StoreResult<()>;

    /// Writes every pending change inside the open transaction.
    fn flush(&mut self) -> StoreResult<()>;

    /// Flushes and makes all writes durable.
    fn commit(&mut self) -> StoreResult<()>;

    /// Discards every write since the last commit.
    fn rollback(&mut self) -> StoreResult<()>;

    fn query(
        &mut self,
        kind: EntityKind,
        query: &Query<RecordHandle>,
    ) -> StoreResult<Vec<RecordHandle>>;

    /// Number of matches, ignoring `limit` and `offset`.
    fn count(&mut self, kind: EntityKind, query: &Query<RecordHandle>) -> StoreResult<u64>;
}
