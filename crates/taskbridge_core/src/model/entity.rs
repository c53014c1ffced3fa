//! Typed domain entities.
//!
//! # Responsibility
//! - Hold the field values of the six entity kinds.
//! - Expose read accessors and field-addressed access for the graph.
//!
//! # Invariants
//! - Entities never mutate relationship partners themselves; only
//!   [`crate::model::graph::Graph`] links two entities.
//! - `parent_id` / `task_id` mirror the identity of the linked entity.

use super::collection::{LazyRef, Members, Membership, OrderedRefs, RefSet};
use super::field::{Field, FieldValue};
use super::{EntityId, EntityKind, EntityRef};
use serde::{Deserialize, Serialize};

/// Task: the central entity of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub(crate) id: Option<i64>,
    pub(crate) summary: String,
    pub(crate) description: String,
    pub(crate) is_done: bool,
    pub(crate) is_deleted: bool,
    /// Unix epoch milliseconds.
    pub(crate) deadline: Option<i64>,
    pub(crate) expected_duration_minutes: Option<i64>,
    pub(crate) expected_cost: Option<f64>,
    pub(crate) order_num: i64,
    pub(crate) parent: LazyRef,
    pub(crate) parent_id: Option<i64>,
    pub(crate) children: OrderedRefs,
    pub(crate) dependees: RefSet,
    pub(crate) dependants: RefSet,
    pub(crate) prioritize_before: RefSet,
    pub(crate) prioritize_after: RefSet,
    pub(crate) tags: RefSet,
    pub(crate) users: RefSet,
    pub(crate) notes: RefSet,
    pub(crate) attachments: RefSet,
}

impl Task {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            id: None,
            summary: summary.into(),
            description: String::new(),
            is_done: false,
            is_deleted: false,
            deadline: None,
            expected_duration_minutes: None,
            expected_cost: None,
            order_num: 0,
            parent: LazyRef::Empty,
            parent_id: None,
            children: OrderedRefs::default(),
            dependees: RefSet::default(),
            dependants: RefSet::default(),
            prioritize_before: RefSet::default(),
            prioritize_after: RefSet::default(),
            tags: RefSet::default(),
            users: RefSet::default(),
            notes: RefSet::default(),
            attachments: RefSet::default(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    pub fn expected_duration_minutes(&self) -> Option<i64> {
        self.expected_duration_minutes
    }

    pub fn expected_cost(&self) -> Option<f64> {
        self.expected_cost
    }

    pub fn order_num(&self) -> i64 {
        self.order_num
    }

    /// Parent link; may still be unresolved for tasks loaded from the store.
    pub fn parent(&self) -> LazyRef {
        self.parent
    }

    pub fn parent_id(&self) -> Option<i64> {
        self.parent_id
    }

    pub fn children(&self) -> &[EntityRef] {
        self.children.as_slice()
    }

    pub fn dependees(&self) -> &RefSet {
        &self.dependees
    }

    pub fn dependants(&self) -> &RefSet {
        &self.dependants
    }

    pub fn prioritize_before(&self) -> &RefSet {
        &self.prioritize_before
    }

    pub fn prioritize_after(&self) -> &RefSet {
        &self.prioritize_after
    }

    pub fn tags(&self) -> &RefSet {
        &self.tags
    }

    pub fn users(&self) -> &RefSet {
        &self.users
    }

    pub fn notes(&self) -> &RefSet {
        &self.notes
    }

    pub fn attachments(&self) -> &RefSet {
        &self.attachments
    }

    fn scalar(&self, field: Field) -> Option<FieldValue> {
        let value = match field {
            Field::Id => self.id.into(),
            Field::Summary => self.summary.clone().into(),
            Field::Description => self.description.clone().into(),
            Field::IsDone => self.is_done.into(),
            Field::IsDeleted => self.is_deleted.into(),
            Field::Deadline => self.deadline.into(),
            Field::ExpectedDuration => self.expected_duration_minutes.into(),
            Field::ExpectedCost => self.expected_cost.into(),
            Field::OrderNum => self.order_num.into(),
            Field::ParentId => self.parent_id.into(),
            _ => return None,
        };
        Some(value)
    }

    fn set_scalar(&mut self, field: Field, value: FieldValue) -> Option<()> {
        match field {
            Field::Id => self.id = optional_int(value)?,
            Field::Summary => self.summary = text(value)?,
            Field::Description => self.description = text(value)?,
            Field::IsDone => self.is_done = boolean(value)?,
            Field::IsDeleted => self.is_deleted = boolean(value)?,
            Field::Deadline => self.deadline = optional_int(value)?,
            Field::ExpectedDuration => self.expected_duration_minutes = optional_int(value)?,
            Field::ExpectedCost => self.expected_cost = optional_float(value)?,
            Field::OrderNum => self.order_num = int(value)?,
            Field::ParentId => self.parent_id = optional_int(value)?,
            _ => return None,
        }
        Some(())
    }

    fn members_mut(&mut self, field: Field) -> Option<Members<'_>> {
        let members = match field {
            Field::Children => Members::Ordered(&mut self.children),
            Field::Dependees => Members::Set(&mut self.dependees),
            Field::Dependants => Members::Set(&mut self.dependants),
            Field::PrioritizeBefore => Members::Set(&mut self.prioritize_before),
            Field::PrioritizeAfter => Members::Set(&mut self.prioritize_after),
            Field::Tags => Members::Set(&mut self.tags),
            Field::Users => Members::Set(&mut self.users),
            Field::Notes => Members::Set(&mut self.notes),
            Field::Attachments => Members::Set(&mut self.attachments),
            _ => return None,
        };
        Some(members)
    }

    fn members(&self, field: Field) -> Option<Vec<EntityRef>> {
        let members = match field {
            Field::Children => self.children.to_vec(),
            Field::Dependees => self.dependees.to_vec(),
            Field::Dependants => self.dependants.to_vec(),
            Field::PrioritizeBefore => self.prioritize_before.to_vec(),
            Field::PrioritizeAfter => self.prioritize_after.to_vec(),
            Field::Tags => self.tags.to_vec(),
            Field::Users => self.users.to_vec(),
            Field::Notes => self.notes.to_vec(),
            Field::Attachments => self.attachments.to_vec(),
            _ => return None,
        };
        Some(members)
    }
}

/// Tag attached to many tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub(crate) id: Option<i64>,
    pub(crate) value: String,
    pub(crate) description: Option<String>,
    pub(crate) tasks: RefSet,
}

impl Tag {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            id: None,
            value: value.into(),
            description: None,
            tasks: RefSet::default(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tasks(&self) -> &RefSet {
        &self.tasks
    }
}

/// Free-form note owned by at most one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub(crate) id: Option<i64>,
    pub(crate) content: String,
    /// Unix epoch milliseconds.
    pub(crate) timestamp: Option<i64>,
    pub(crate) task: LazyRef,
    pub(crate) task_id: Option<i64>,
}

impl Note {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            timestamp: None,
            task: LazyRef::Empty,
            task_id: None,
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn task(&self) -> LazyRef {
        self.task
    }

    pub fn task_id(&self) -> Option<i64> {
        self.task_id
    }
}

/// File reference owned by at most one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub(crate) id: Option<i64>,
    pub(crate) path: String,
    pub(crate) filename: String,
    pub(crate) description: String,
    pub(crate) timestamp: Option<i64>,
    pub(crate) task: LazyRef,
    pub(crate) task_id: Option<i64>,
}

impl Attachment {
    /// Creates an attachment; `filename` defaults to the last path segment.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let filename = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id: None,
            path,
            filename,
            description: String::new(),
            timestamp: None,
            task: LazyRef::Empty,
            task_id: None,
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn task(&self) -> LazyRef {
        self.task
    }

    pub fn task_id(&self) -> Option<i64> {
        self.task_id
    }
}

/// Account that tasks can be assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub(crate) id: Option<i64>,
    pub(crate) email: String,
    pub(crate) hashed_password: Option<String>,
    pub(crate) is_admin: bool,
    pub(crate) tasks: RefSet,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: None,
            email: email.into(),
            hashed_password: None,
            is_admin: false,
            tasks: RefSet::default(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn hashed_password(&self) -> Option<&str> {
        self.hashed_password.as_deref()
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn tasks(&self) -> &RefSet {
        &self.tasks
    }
}

/// Key/value setting. The key is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppOption {
    pub(crate) key: String,
    pub(crate) value: Option<String>,
}

impl AppOption {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

/// One entity of any kind. Also used as the full-field snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Task(Task),
    Tag(Tag),
    Note(Note),
    Attachment(Attachment),
    User(User),
    AppOption(AppOption),
}

impl Entity {
    /// Creates an entity of `kind` with default field values.
    pub fn blank(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Task => Self::Task(Task::new("")),
            EntityKind::Tag => Self::Tag(Tag::new("")),
            EntityKind::Note => Self::Note(Note::new("")),
            EntityKind::Attachment => Self::Attachment(Attachment::new("")),
            EntityKind::User => Self::User(User::new("")),
            EntityKind::AppOption => Self::AppOption(AppOption::new("", None)),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Tag(_) => EntityKind::Tag,
            Self::Note(_) => EntityKind::Note,
            Self::Attachment(_) => EntityKind::Attachment,
            Self::User(_) => EntityKind::User,
            Self::AppOption(_) => EntityKind::AppOption,
        }
    }

    /// Returns the storage identity, or `None` while unassigned.
    pub fn identity(&self) -> Option<EntityId> {
        match self {
            Self::Task(task) => task.id.map(EntityId::Int),
            Self::Tag(tag) => tag.id.map(EntityId::Int),
            Self::Note(note) => note.id.map(EntityId::Int),
            Self::Attachment(attachment) => attachment.id.map(EntityId::Int),
            Self::User(user) => user.id.map(EntityId::Int),
            Self::AppOption(option) => Some(EntityId::Key(option.key.clone())),
        }
    }

    /// Integer identity, used for foreign-key fields.
    pub fn int_id(&self) -> Option<i64> {
        self.identity().and_then(|id| id.as_int())
    }

    /// Reads a scalar field. `None` when `field` is not a scalar of this kind.
    pub(crate) fn scalar(&self, field: Field) -> Option<FieldValue> {
        let value = match self {
            Self::Task(task) => return task.scalar(field),
            Self::Tag(tag) => match field {
                Field::Id => tag.id.into(),
                Field::Value => tag.value.clone().into(),
                Field::Description => tag.description.clone().into(),
                _ => return None,
            },
            Self::Note(note) => match field {
                Field::Id => note.id.into(),
                Field::Content => note.content.clone().into(),
                Field::Timestamp => note.timestamp.into(),
                Field::TaskId => note.task_id.into(),
                _ => return None,
            },
            Self::Attachment(attachment) => match field {
                Field::Id => attachment.id.into(),
                Field::Path => attachment.path.clone().into(),
                Field::Filename => attachment.filename.clone().into(),
                Field::Description => attachment.description.clone().into(),
                Field::Timestamp => attachment.timestamp.into(),
                Field::TaskId => attachment.task_id.into(),
                _ => return None,
            },
            Self::User(user) => match field {
                Field::Id => user.id.into(),
                Field::Email => user.email.clone().into(),
                Field::HashedPassword => user.hashed_password.clone().into(),
                Field::IsAdmin => user.is_admin.into(),
                _ => return None,
            },
            Self::AppOption(option) => match field {
                Field::Key => option.key.clone().into(),
                Field::Value => option.value.clone().into(),
                _ => return None,
            },
        };
        Some(value)
    }

    /// Writes a scalar field. `None` when the field is unknown or the value
    /// has the wrong type; the entity is left unchanged in that case.
    pub(crate) fn set_scalar(&mut self, field: Field, value: FieldValue) -> Option<()> {
        match self {
            Self::Task(task) => return task.set_scalar(field, value),
            Self::Tag(tag) => match field {
                Field::Id => tag.id = optional_int(value)?,
                Field::Value => tag.value = text(value)?,
                Field::Description => tag.description = optional_text(value)?,
                _ => return None,
            },
            Self::Note(note) => match field {
                Field::Id => note.id = optional_int(value)?,
                Field::Content => note.content = text(value)?,
                Field::Timestamp => note.timestamp = optional_int(value)?,
                Field::TaskId => note.task_id = optional_int(value)?,
                _ => return None,
            },
            Self::Attachment(attachment) => match field {
                Field::Id => attachment.id = optional_int(value)?,
                Field::Path => attachment.path = text(value)?,
                Field::Filename => attachment.filename = text(value)?,
                Field::Description => attachment.description = text(value)?,
                Field::Timestamp => attachment.timestamp = optional_int(value)?,
                Field::TaskId => attachment.task_id = optional_int(value)?,
                _ => return None,
            },
            Self::User(user) => match field {
                Field::Id => user.id = optional_int(value)?,
                Field::Email => user.email = text(value)?,
                Field::HashedPassword => user.hashed_password = optional_text(value)?,
                Field::IsAdmin => user.is_admin = boolean(value)?,
                _ => return None,
            },
            Self::AppOption(option) => match field {
                Field::Key => option.key = text(value)?,
                Field::Value => option.value = optional_text(value)?,
                _ => return None,
            },
        }
        Some(())
    }

    pub(crate) fn single(&self, field: Field) -> Option<LazyRef> {
        match (self, field) {
            (Self::Task(task), Field::Parent) => Some(task.parent),
            (Self::Note(note), Field::Task) => Some(note.task),
            (Self::Attachment(attachment), Field::Task) => Some(attachment.task),
            _ => None,
        }
    }

    pub(crate) fn single_mut(&mut self, field: Field) -> Option<&mut LazyRef> {
        match (self, field) {
            (Self::Task(task), Field::Parent) => Some(&mut task.parent),
            (Self::Note(note), Field::Task) => Some(&mut note.task),
            (Self::Attachment(attachment), Field::Task) => Some(&mut attachment.task),
            _ => None,
        }
    }

    pub(crate) fn members(&self, field: Field) -> Option<Vec<EntityRef>> {
        match (self, field) {
            (Self::Task(task), _) => task.members(field),
            (Self::Tag(tag), Field::Tasks) => Some(tag.tasks.to_vec()),
            (Self::User(user), Field::Tasks) => Some(user.tasks.to_vec()),
            _ => None,
        }
    }

    pub(crate) fn members_mut(&mut self, field: Field) -> Option<Members<'_>> {
        match (self, field) {
            (Self::Task(task), _) => task.members_mut(field),
            (Self::Tag(tag), Field::Tasks) => Some(Members::Set(&mut tag.tasks)),
            (Self::User(user), Field::Tasks) => Some(Members::Set(&mut user.tasks)),
            _ => None,
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut OrderedRefs> {
        match self {
            Self::Task(task) => Some(&mut task.children),
            _ => None,
        }
    }
}

fn text(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(value) => Some(value),
        _ => None,
    }
}

fn optional_text(value: FieldValue) -> Option<Option<String>> {
    match value {
        FieldValue::Text(value) => Some(Some(value)),
        FieldValue::Null => Some(None),
        _ => None,
    }
}

fn int(value: FieldValue) -> Option<i64> {
    value.as_int()
}

fn optional_int(value: FieldValue) -> Option<Option<i64>> {
    match value {
        FieldValue::Int(value) => Some(Some(value)),
        FieldValue::Null => Some(None),
        _ => None,
    }
}

fn optional_float(value: FieldValue) -> Option<Option<f64>> {
    match value {
        FieldValue::Float(value) => Some(Some(value)),
        FieldValue::Int(value) => Some(Some(value as f64)),
        FieldValue::Null => Some(None),
        _ => None,
    }
}

fn boolean(value: FieldValue) -> Option<bool> {
    value.as_bool()
}

#[cfg(test)]
mod tests {
    use super::{Attachment, Entity, Task};
    use crate::model::field::{Field, FieldValue};
    use crate::model::{EntityId, EntityKind};

    #[test]
    fn attachment_filename_defaults_to_last_segment() {
        assert_eq!(Attachment::new("a/b/report.pdf").filename(), "report.pdf");
        assert_eq!(Attachment::new("plain.txt").filename(), "plain.txt");
    }

    #[test]
    fn set_scalar_rejects_wrong_type_without_mutating() {
        let mut entity = Entity::Task(Task::new("keep"));
        assert!(entity
            .set_scalar(Field::Summary, FieldValue::Int(3))
            .is_none());
        assert_eq!(
            entity.scalar(Field::Summary),
            Some(FieldValue::Text("keep".to_string()))
        );
    }

    #[test]
    fn option_identity_is_its_key() {
        let entity = Entity::blank(EntityKind::AppOption);
        assert_eq!(entity.identity(), Some(EntityId::Key(String::new())));
        assert_eq!(Entity::blank(EntityKind::Tag).identity(), None);
    }
}
