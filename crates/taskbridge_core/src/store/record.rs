//! In-memory image of stored rows and the field-to-table mapping.
//!
//! # Invariants
//! - Only owning sides are held on a record: scalar columns, the `parent` /
//!   `task` reference and the task link sets. Inverse collections and
//!   foreign-key mirrors are derived on read.

use super::RecordHandle;
use crate::model::field::{Field, FieldShape, FieldValue};
use crate::model::{EntityId, EntityKind};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordState {
    /// Created since the last flush; no row yet.
    New,
    Persistent,
    /// Marked for deletion; the row disappears at the next flush.
    Deleted,
    /// Gone for good: deleted and committed, or rolled back before commit.
    Discarded,
}

#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub kind: EntityKind,
    pub state: RecordState,
    pub id: Option<EntityId>,
    /// Scalar columns and owned single references.
    pub values: BTreeMap<Field, FieldValue<RecordHandle>>,
    /// Owned link sets, loaded on first use.
    pub links: BTreeMap<Field, BTreeSet<RecordHandle>>,
    pub dirty: bool,
    pub dirty_links: BTreeSet<Field>,
    /// Row still has to be removed by the next flush.
    pub pending_delete: bool,
    /// Row exists in committed state.
    pub durable: bool,
}

impl Record {
    /// Fresh record with the default values of `kind`.
    pub fn new(kind: EntityKind) -> Self {
        let blank = crate::model::entity::Entity::blank(kind);
        let values = stored_fields(kind)
            .into_iter()
            .map(|field| {
                let value = blank
                    .scalar(field)
                    .and_then(|value| value.scalar_cast())
                    .unwrap_or(FieldValue::Null);
                (field, value)
            })
            .collect();
        Self {
            kind,
            state: RecordState::New,
            id: None,
            values,
            links: BTreeMap::new(),
            dirty: true,
            dirty_links: BTreeSet::new(),
            pending_delete: false,
            durable: false,
        }
    }

    /// Record for a row that was just read from the database.
    pub fn loaded(kind: EntityKind, id: EntityId) -> Self {
        Self {
            state: RecordState::Persistent,
            id: Some(id),
            dirty: false,
            durable: true,
            ..Self::new(kind)
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, RecordState::New | RecordState::Persistent)
    }

    pub fn needs_flush(&self) -> bool {
        match self.state {
            RecordState::New => true,
            RecordState::Persistent => self.dirty || !self.dirty_links.is_empty(),
            RecordState::Deleted => self.pending_delete,
            RecordState::Discarded => false,
        }
    }

    /// Drops every owned reference to `target`. Returns whether anything
    /// changed.
    pub fn forget_target(&mut self, target: RecordHandle) -> bool {
        let mut changed = false;
        for value in self.values.values_mut() {
            if *value == FieldValue::Ref(target) {
                *value = FieldValue::Null;
                self.dirty = true;
                changed = true;
            }
        }
        for (field, members) in self.links.iter_mut() {
            if members.remove(&target) {
                self.dirty_links.insert(*field);
                changed = true;
            }
        }
        changed
    }
}

/// Link table of one owned N:N relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkTable {
    pub table: &'static str,
    pub owner_column: &'static str,
    pub member_column: &'static str,
}

const TASK_DEPENDENCIES: LinkTable = LinkTable {
    table: "task_dependencies",
    owner_column: "dependant_id",
    member_column: "dependee_id",
};
const TASK_PRIORITIZATIONS: LinkTable = LinkTable {
    table: "task_prioritizations",
    owner_column: "task_id",
    member_column: "before_id",
};
const TASK_TAGS: LinkTable = LinkTable {
    table: "task_tags",
    owner_column: "task_id",
    member_column: "tag_id",
};
const TASK_USERS: LinkTable = LinkTable {
    table: "task_users",
    owner_column: "task_id",
    member_column: "user_id",
};

/// Where one field lives in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldStorage {
    /// Row id, or the option key.
    Identity,
    Column(&'static str),
    /// Owned single reference held as a foreign-key column.
    OwnedRef(&'static str),
    /// Foreign-key mirror computed from the owned reference.
    DerivedKey { single: Field },
    OwnedLinks(LinkTable),
    /// Reverse side of another kind's link set.
    InverseLinks { owner_field: Field, table: LinkTable },
    /// Rows whose owned reference points here.
    InverseRefs {
        owner_field: Field,
        table: &'static str,
        column: &'static str,
    },
}

pub(crate) fn storage_of(kind: EntityKind, field: Field) -> Option<FieldStorage> {
    let shape = kind.shape_of(field)?;
    let storage = match (kind, field, shape) {
        (_, Field::Id, _) | (EntityKind::AppOption, Field::Key, _) => FieldStorage::Identity,
        (EntityKind::Task, Field::Parent, _) => FieldStorage::OwnedRef("parent_id"),
        (_, Field::Task, _) => FieldStorage::OwnedRef("task_id"),
        (EntityKind::Task, Field::ParentId, _) => FieldStorage::DerivedKey {
            single: Field::Parent,
        },
        (_, Field::TaskId, _) => FieldStorage::DerivedKey { single: Field::Task },
        (_, field, FieldShape::Scalar) => FieldStorage::Column(field.name()),
        (EntityKind::Task, Field::Dependees, _) => FieldStorage::OwnedLinks(TASK_DEPENDENCIES),
        (EntityKind::Task, Field::PrioritizeBefore, _) => {
            FieldStorage::OwnedLinks(TASK_PRIORITIZATIONS)
        }
        (EntityKind::Task, Field::Tags, _) => FieldStorage::OwnedLinks(TASK_TAGS),
        (EntityKind::Task, Field::Users, _) => FieldStorage::OwnedLinks(TASK_USERS),
        (EntityKind::Task, Field::Dependants, _) => FieldStorage::InverseLinks {
            owner_field: Field::Dependees,
            table: TASK_DEPENDENCIES,
        },
        (EntityKind::Task, Field::PrioritizeAfter, _) => FieldStorage::InverseLinks {
            owner_field: Field::PrioritizeBefore,
            table: TASK_PRIORITIZATIONS,
        },
        (EntityKind::Tag, Field::Tasks, _) => FieldStorage::InverseLinks {
            owner_field: Field::Tags,
            table: TASK_TAGS,
        },
        (EntityKind::User, Field::Tasks, _) => FieldStorage::InverseLinks {
            owner_field: Field::Users,
            table: TASK_USERS,
        },
        (EntityKind::Task, Field::Children, _) => FieldStorage::InverseRefs {
            owner_field: Field::Parent,
            table: "tasks",
            column: "parent_id",
        },
        (EntityKind::Task, Field::Notes, _) => FieldStorage::InverseRefs {
            owner_field: Field::Task,
            table: "notes",
            column: "task_id",
        },
        (EntityKind::Task, Field::Attachments, _) => FieldStorage::InverseRefs {
            owner_field: Field::Task,
            table: "attachments",
            column: "task_id",
        },
        _ => return None,
    };
    Some(storage)
}

/// Fields held in [`Record::values`], in column order.
pub(crate) fn stored_fields(kind: EntityKind) -> Vec<Field> {
    kind.fields()
        .iter()
        .copied()
        .filter(|field| {
            matches!(
                storage_of(kind, *field),
                Some(FieldStorage::Column(_) | FieldStorage::OwnedRef(_))
            )
        })
        .collect()
}

/// Column name of a stored field.
pub(crate) fn column_of(kind: EntityKind, field: Field) -> Option<&'static str> {
    match storage_of(kind, field)? {
        FieldStorage::Column(column) | FieldStorage::OwnedRef(column) => Some(column),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{column_of, storage_of, stored_fields, FieldStorage, Record, RecordState};
    use crate::model::field::{Field, FieldValue};
    use crate::model::EntityKind;
    use crate::store::RecordHandle;

    #[test]
    fn every_field_has_a_storage_mapping() {
        for kind in EntityKind::ALL {
            for field in kind.fields() {
                assert!(storage_of(kind, *field).is_some(), "{kind} {field:?}");
            }
        }
    }

    #[test]
    fn stored_fields_exclude_identity_and_derived_keys() {
        let fields = stored_fields(EntityKind::Note);
        assert_eq!(fields, vec![Field::Content, Field::Timestamp, Field::Task]);
        assert_eq!(column_of(EntityKind::Note, Field::Task), Some("task_id"));
        assert!(matches!(
            storage_of(EntityKind::Note, Field::TaskId),
            Some(FieldStorage::DerivedKey { single: Field::Task })
        ));
    }

    #[test]
    fn new_records_carry_entity_defaults() {
        let record = Record::new(EntityKind::Task);
        assert_eq!(record.state, RecordState::New);
        assert_eq!(
            record.values.get(&Field::IsDone),
            Some(&FieldValue::Bool(false))
        );
        assert_eq!(record.values.get(&Field::Parent), Some(&FieldValue::Null));
    }

    #[test]
    fn forgetting_a_target_marks_record_dirty() {
        let target = RecordHandle::new(4);
        let mut record = Record::new(EntityKind::Note);
        record.dirty = false;
        record.values.insert(Field::Task, FieldValue::Ref(target));
        assert!(record.forget_target(target));
        assert!(record.dirty);
        assert_eq!(record.values.get(&Field::Task), Some(&FieldValue::Null));
    }
}
