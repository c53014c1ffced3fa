//! Field catalogue shared by the entity graph, the record store and the
//! unit of work.
//!
//! # Responsibility
//! - Name every field of the six entity kinds.
//! - Describe each field's shape (scalar, single reference, ordered or set
//!   collection), its value type and its mirrored inverse.
//!
//! # Invariants
//! - Every relationship field has exactly one inverse on the target kind.
//! - Foreign-key fields (`parent_id`, `task_id`) are derived from their
//!   single-valued relationship and never mirrored on their own.

use super::{EntityKind, EntityRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named field of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    Summary,
    Description,
    IsDone,
    IsDeleted,
    Deadline,
    ExpectedDuration,
    ExpectedCost,
    OrderNum,
    Parent,
    ParentId,
    Children,
    Dependees,
    Dependants,
    PrioritizeBefore,
    PrioritizeAfter,
    Tags,
    Users,
    Notes,
    Attachments,
    Value,
    Tasks,
    Content,
    Timestamp,
    Task,
    TaskId,
    Path,
    Filename,
    Email,
    HashedPassword,
    IsAdmin,
    Key,
}

/// Storage shape of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Plain value; only `SET` applies.
    Scalar,
    /// Single-valued relationship (`parent`, note/attachment `task`).
    Single,
    /// Ordered relationship sequence (`children`).
    Ordered,
    /// Unique-membership relationship set.
    Set,
}

impl FieldShape {
    pub fn is_collection(self) -> bool {
        matches!(self, Self::Ordered | Self::Set)
    }

    pub fn is_relationship(self) -> bool {
        !matches!(self, Self::Scalar)
    }
}

/// Value type accepted by a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    OptionalInt,
    OptionalFloat,
    Text,
    OptionalText,
}

/// Target kind and inverse field of one relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub target: EntityKind,
    pub inverse: Field,
}

const TASK_FIELDS: &[Field] = &[
    Field::Id,
    Field::Summary,
    Field::Description,
    Field::IsDone,
    Field::IsDeleted,
    Field::Deadline,
    Field::ExpectedDuration,
    Field::ExpectedCost,
    Field::OrderNum,
    Field::Parent,
    Field::ParentId,
    Field::Children,
    Field::Dependees,
    Field::Dependants,
    Field::PrioritizeBefore,
    Field::PrioritizeAfter,
    Field::Tags,
    Field::Users,
    Field::Notes,
    Field::Attachments,
];
const TAG_FIELDS: &[Field] = &[Field::Id, Field::Value, Field::Description, Field::Tasks];
const NOTE_FIELDS: &[Field] = &[
    Field::Id,
    Field::Content,
    Field::Timestamp,
    Field::Task,
    Field::TaskId,
];
const ATTACHMENT_FIELDS: &[Field] = &[
    Field::Id,
    Field::Path,
    Field::Filename,
    Field::Description,
    Field::Timestamp,
    Field::Task,
    Field::TaskId,
];
const USER_FIELDS: &[Field] = &[
    Field::Id,
    Field::Email,
    Field::HashedPassword,
    Field::IsAdmin,
    Field::Tasks,
];
const OPTION_FIELDS: &[Field] = &[Field::Key, Field::Value];

const ID_ONLY: &[Field] = &[Field::Id];

impl EntityKind {
    /// Returns the full field list of this kind in canonical order.
    pub fn fields(self) -> &'static [Field] {
        match self {
            Self::Task => TASK_FIELDS,
            Self::Tag => TAG_FIELDS,
            Self::Note => NOTE_FIELDS,
            Self::Attachment => ATTACHMENT_FIELDS,
            Self::User => USER_FIELDS,
            Self::AppOption => OPTION_FIELDS,
        }
    }

    pub fn has_field(self, field: Field) -> bool {
        self.fields().contains(&field)
    }

    /// Fields whose authoritative value is assigned by the store and must be
    /// pulled back after commit.
    pub fn autochange_fields(self) -> &'static [Field] {
        match self {
            Self::AppOption => &[],
            _ => ID_ONLY,
        }
    }

    /// Field carrying the identity of this kind.
    pub fn identity_field(self) -> Field {
        match self {
            Self::AppOption => Field::Key,
            _ => Field::Id,
        }
    }

    /// Returns the shape of `field` for this kind, or `None` when the kind
    /// does not define the field.
    pub fn shape_of(self, field: Field) -> Option<FieldShape> {
        if !self.has_field(field) {
            return None;
        }
        let shape = match field {
            Field::Parent | Field::Task => FieldShape::Single,
            Field::Children => FieldShape::Ordered,
            Field::Dependees
            | Field::Dependants
            | Field::PrioritizeBefore
            | Field::PrioritizeAfter
            | Field::Tags
            | Field::Users
            | Field::Notes
            | Field::Attachments
            | Field::Tasks => FieldShape::Set,
            _ => FieldShape::Scalar,
        };
        Some(shape)
    }

    /// Returns the accepted value type of a scalar field.
    pub fn value_type_of(self, field: Field) -> Option<ValueType> {
        if self.shape_of(field)? != FieldShape::Scalar {
            return None;
        }
        let value_type = match (self, field) {
            (Self::AppOption, Field::Key) => ValueType::Text,
            (Self::AppOption, Field::Value) => ValueType::OptionalText,
            (_, Field::Id) | (_, Field::ParentId) | (_, Field::TaskId) => ValueType::OptionalInt,
            (_, Field::Deadline) | (_, Field::ExpectedDuration) | (_, Field::Timestamp) => {
                ValueType::OptionalInt
            }
            (_, Field::OrderNum) => ValueType::Int,
            (_, Field::ExpectedCost) => ValueType::OptionalFloat,
            (_, Field::IsDone) | (_, Field::IsDeleted) | (_, Field::IsAdmin) => ValueType::Bool,
            (Self::Tag, Field::Description) | (_, Field::HashedPassword) => ValueType::OptionalText,
            _ => ValueType::Text,
        };
        Some(value_type)
    }

    /// Returns the mirrored partner of a relationship field.
    pub fn relation_of(self, field: Field) -> Option<Relation> {
        let (target, inverse) = match (self, field) {
            (Self::Task, Field::Parent) => (Self::Task, Field::Children),
            (Self::Task, Field::Children) => (Self::Task, Field::Parent),
            (Self::Task, Field::Dependees) => (Self::Task, Field::Dependants),
            (Self::Task, Field::Dependants) => (Self::Task, Field::Dependees),
            (Self::Task, Field::PrioritizeBefore) => (Self::Task, Field::PrioritizeAfter),
            (Self::Task, Field::PrioritizeAfter) => (Self::Task, Field::PrioritizeBefore),
            (Self::Task, Field::Tags) => (Self::Tag, Field::Tasks),
            (Self::Task, Field::Users) => (Self::User, Field::Tasks),
            (Self::Task, Field::Notes) => (Self::Note, Field::Task),
            (Self::Task, Field::Attachments) => (Self::Attachment, Field::Task),
            (Self::Tag, Field::Tasks) => (Self::Task, Field::Tags),
            (Self::User, Field::Tasks) => (Self::Task, Field::Users),
            (Self::Note, Field::Task) => (Self::Task, Field::Notes),
            (Self::Attachment, Field::Task) => (Self::Task, Field::Attachments),
            _ => return None,
        };
        Some(Relation { target, inverse })
    }

    /// Returns the foreign-key field kept in step with a single relationship.
    pub fn foreign_key_of(self, field: Field) -> Option<Field> {
        match (self, field) {
            (Self::Task, Field::Parent) => Some(Field::ParentId),
            (Self::Note, Field::Task) | (Self::Attachment, Field::Task) => Some(Field::TaskId),
            _ => None,
        }
    }

    /// Fields that must be refreshed from the store after `field` changes.
    pub fn dependents_of(self, field: Field) -> &'static [Field] {
        match (self, field) {
            (Self::Task, Field::Parent) => &[Field::ParentId],
            (Self::Note, Field::Task) | (Self::Attachment, Field::Task) => &[Field::TaskId],
            _ => &[],
        }
    }
}

impl Field {
    /// Stable snake_case name used in logs and field maps.
    pub fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Summary => "summary",
            Self::Description => "description",
            Self::IsDone => "is_done",
            Self::IsDeleted => "is_deleted",
            Self::Deadline => "deadline",
            Self::ExpectedDuration => "expected_duration_minutes",
            Self::ExpectedCost => "expected_cost",
            Self::OrderNum => "order_num",
            Self::Parent => "parent",
            Self::ParentId => "parent_id",
            Self::Children => "children",
            Self::Dependees => "dependees",
            Self::Dependants => "dependants",
            Self::PrioritizeBefore => "prioritize_before",
            Self::PrioritizeAfter => "prioritize_after",
            Self::Tags => "tags",
            Self::Users => "users",
            Self::Notes => "notes",
            Self::Attachments => "attachments",
            Self::Value => "value",
            Self::Tasks => "tasks",
            Self::Content => "content",
            Self::Timestamp => "timestamp",
            Self::Task => "task",
            Self::TaskId => "task_id",
            Self::Path => "path",
            Self::Filename => "filename",
            Self::Email => "email",
            Self::HashedPassword => "hashed_password",
            Self::IsAdmin => "is_admin",
            Self::Key => "key",
        }
    }

    /// Parses a field name produced by [`Field::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_FIELDS
            .iter()
            .copied()
            .find(|field| field.name() == name)
    }

    pub fn is_foreign_key(self) -> bool {
        matches!(self, Self::ParentId | Self::TaskId)
    }
}

const ALL_FIELDS: &[Field] = &[
    Field::Id,
    Field::Summary,
    Field::Description,
    Field::IsDone,
    Field::IsDeleted,
    Field::Deadline,
    Field::ExpectedDuration,
    Field::ExpectedCost,
    Field::OrderNum,
    Field::Parent,
    Field::ParentId,
    Field::Children,
    Field::Dependees,
    Field::Dependants,
    Field::PrioritizeBefore,
    Field::PrioritizeAfter,
    Field::Tags,
    Field::Users,
    Field::Notes,
    Field::Attachments,
    Field::Value,
    Field::Tasks,
    Field::Content,
    Field::Timestamp,
    Field::Task,
    Field::TaskId,
    Field::Path,
    Field::Filename,
    Field::Email,
    Field::HashedPassword,
    Field::IsAdmin,
    Field::Key,
];

/// Value carried by one field.
///
/// `R` is the reference type: domain handles in the graph, record handles in
/// the store. Scalars never carry references, so they convert between the
/// two sides with [`FieldValue::scalar_cast`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue<R = EntityRef> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ref(R),
    Refs(Vec<R>),
}

/// Full named field dictionary of one entity.
pub type FieldMap = BTreeMap<Field, FieldValue>;

impl<R> FieldValue<R> {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&R> {
        match self {
            Self::Ref(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_refs(&self) -> Option<&[R]> {
        match self {
            Self::Refs(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Re-types a reference-free value. Returns `None` for `Ref`/`Refs`.
    pub fn scalar_cast<S>(self) -> Option<FieldValue<S>> {
        match self {
            Self::Null => Some(FieldValue::Null),
            Self::Bool(value) => Some(FieldValue::Bool(value)),
            Self::Int(value) => Some(FieldValue::Int(value)),
            Self::Float(value) => Some(FieldValue::Float(value)),
            Self::Text(value) => Some(FieldValue::Text(value)),
            Self::Ref(_) | Self::Refs(_) => None,
        }
    }

    /// Returns whether this value is acceptable for `value_type`.
    pub fn fits(&self, value_type: ValueType) -> bool {
        match (value_type, self) {
            (ValueType::Bool, Self::Bool(_)) => true,
            (ValueType::Int, Self::Int(_)) => true,
            (ValueType::OptionalInt, Self::Int(_) | Self::Null) => true,
            (ValueType::OptionalFloat, Self::Float(_) | Self::Int(_) | Self::Null) => true,
            (ValueType::Text, Self::Text(_)) => true,
            (ValueType::OptionalText, Self::Text(_) | Self::Null) => true,
            _ => false,
        }
    }
}

impl<R> From<bool> for FieldValue<R> {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<R> From<i64> for FieldValue<R> {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl<R> From<f64> for FieldValue<R> {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<R> From<&str> for FieldValue<R> {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl<R> From<String> for FieldValue<R> {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<EntityRef> for FieldValue {
    fn from(value: EntityRef) -> Self {
        Self::Ref(value)
    }
}

impl<R, T: Into<FieldValue<R>>> From<Option<T>> for FieldValue<R> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::{Field, FieldShape, FieldValue, ValueType};
    use crate::model::EntityKind;

    #[test]
    fn every_relationship_has_a_symmetric_inverse() {
        for kind in EntityKind::ALL {
            for field in kind.fields() {
                let shape = kind.shape_of(*field).unwrap();
                if !shape.is_relationship() {
                    assert!(kind.relation_of(*field).is_none());
                    continue;
                }
                let relation = kind.relation_of(*field).unwrap();
                let back = relation.target.relation_of(relation.inverse).unwrap();
                assert_eq!(back.target, kind);
                assert_eq!(back.inverse, *field);
            }
        }
    }

    #[test]
    fn field_names_roundtrip() {
        for kind in EntityKind::ALL {
            for field in kind.fields() {
                assert_eq!(Field::from_name(field.name()), Some(*field));
            }
        }
        assert_eq!(Field::from_name("nope"), None);
    }

    #[test]
    fn shared_field_names_resolve_per_kind() {
        assert_eq!(
            EntityKind::Tag.value_type_of(Field::Description),
            Some(ValueType::OptionalText)
        );
        assert_eq!(
            EntityKind::Task.value_type_of(Field::Description),
            Some(ValueType::Text)
        );
        assert_eq!(EntityKind::Tag.shape_of(Field::Summary), None);
        assert_eq!(
            EntityKind::Task.shape_of(Field::Children),
            Some(FieldShape::Ordered)
        );
    }

    #[test]
    fn scalar_cast_rejects_references() {
        let scalar: FieldValue<u32> = FieldValue::Int(3);
        assert_eq!(scalar.scalar_cast::<u8>(), Some(FieldValue::Int(3)));
        let reference: FieldValue<u32> = FieldValue::Ref(7);
        assert_eq!(reference.scalar_cast::<u8>(), None);
    }
}
