//! Arena of domain entities with mirrored relationships.
//!
//! # Responsibility
//! - Own every domain entity of one session behind stable [`EntityRef`]s.
//! - Apply field mutations and keep both sides of each relationship in step.
//! - Drive the change notification protocol for registered entities.
//!
//! # Invariants
//! - For every relationship pair, `b in a.rel` iff `a in b.inverse`, after
//!   every public call returns.
//! - Assigning a single reference severs the previous inverse link first, so
//!   the last assignment wins.
//! - Foreign-key fields always hold the integer identity of the linked entity
//!   as currently known in memory.
//!
//! # See also
//! - `crate::notify` for the listener contract.

use super::collection::{LazyRef, Membership, OrderedRefs};
use super::entity::{Attachment, AppOption, Entity, Note, Tag, Task, User};
use super::field::{Field, FieldMap, FieldShape, FieldValue, Relation};
use super::{EntityKind, EntityRef};
use crate::logging::LogContext;
use crate::notify::{validate_change, ChangeListener, FieldChange, ListenerId, Operation};
use crate::store::RecordHandle;
use log::{debug, trace};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised by graph reads and mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownEntity(EntityRef),
    UnknownField {
        kind: EntityKind,
        field: Field,
    },
    InvalidOperation {
        field: Field,
        operation: Operation,
    },
    /// Value has the wrong type for the field.
    InvalidValue {
        kind: EntityKind,
        field: Field,
    },
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },
    /// Strict removal from the ordered children list of a non-member.
    NotAMember {
        entity: EntityRef,
        field: Field,
        member: EntityRef,
    },
    /// A different listener is already registered on the entity.
    ListenerConflict(EntityRef),
    /// Single reference still waiting on the store; resolve it first.
    Unresolved {
        entity: EntityRef,
        field: Field,
    },
    IndexOutOfRange {
        entity: EntityRef,
        index: usize,
        len: usize,
    },
}

impl Display for GraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(entity) => write!(f, "unknown entity {entity}"),
            Self::UnknownField { kind, field } => {
                write!(f, "{kind} has no field `{}`", field.name())
            }
            Self::InvalidOperation { field, operation } => {
                write!(f, "operation {operation} is not valid for field `{}`", field.name())
            }
            Self::InvalidValue { kind, field } => {
                write!(f, "invalid value for {kind} field `{}`", field.name())
            }
            Self::KindMismatch { expected, actual } => {
                write!(f, "expected {expected} entity, got {actual}")
            }
            Self::NotAMember {
                entity,
                field,
                member,
            } => write!(f, "{member} is not in `{}` of {entity}", field.name()),
            Self::ListenerConflict(entity) => {
                write!(f, "{entity} already has a different change listener")
            }
            Self::Unresolved { entity, field } => {
                write!(f, "field `{}` of {entity} is not resolved", field.name())
            }
            Self::IndexOutOfRange { entity, index, len } => {
                write!(f, "index {index} out of range for {entity} (len {len})")
            }
        }
    }
}

impl Error for GraphError {}

#[derive(Debug)]
struct Slot {
    entity: Entity,
    listener: Option<ListenerId>,
}

/// Entity arena of one session.
#[derive(Debug)]
pub struct Graph {
    slots: Vec<Slot>,
    log: LogContext,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(LogContext::new("graph"))
    }
}

impl Graph {
    pub fn new(log: LogContext) -> Self {
        Self {
            slots: Vec::new(),
            log,
        }
    }

    /// Moves `entity` into the arena. Relationship fields are reset; links are
    /// only ever made through the mirrored mutators.
    pub fn create(&mut self, mut entity: Entity) -> EntityRef {
        let kind = entity.kind();
        for &field in kind.fields() {
            match kind.shape_of(field) {
                Some(FieldShape::Single) => {
                    if let Some(single) = entity.single_mut(field) {
                        *single = LazyRef::Empty;
                    }
                }
                Some(FieldShape::Ordered | FieldShape::Set) => {
                    let members = entity.members(field).unwrap_or_default();
                    if let Some(mut current) = entity.members_mut(field) {
                        for member in members {
                            current.remove(member);
                        }
                    }
                }
                _ => {}
            }
            if field.is_foreign_key() {
                entity.set_scalar(field, FieldValue::Null);
            }
        }

        let handle = EntityRef::new(kind, self.slots.len() as u32);
        self.slots.push(Slot {
            entity,
            listener: None,
        });
        debug!("event=graph_create {} entity={handle}", self.log);
        handle
    }

    pub fn create_task(&mut self, task: Task) -> EntityRef {
        self.create(Entity::Task(task))
    }

    pub fn create_tag(&mut self, tag: Tag) -> EntityRef {
        self.create(Entity::Tag(tag))
    }

    pub fn create_note(&mut self, note: Note) -> EntityRef {
        self.create(Entity::Note(note))
    }

    pub fn create_attachment(&mut self, attachment: Attachment) -> EntityRef {
        self.create(Entity::Attachment(attachment))
    }

    pub fn create_user(&mut self, user: User) -> EntityRef {
        self.create(Entity::User(user))
    }

    pub fn create_option(&mut self, option: AppOption) -> EntityRef {
        self.create(Entity::AppOption(option))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, entity: EntityRef) -> bool {
        self.slot(entity).is_ok()
    }

    pub fn entity(&self, entity: EntityRef) -> GraphResult<&Entity> {
        self.slot(entity).map(|slot| &slot.entity)
    }

    pub fn task(&self, entity: EntityRef) -> GraphResult<&Task> {
        match self.entity(entity)? {
            Entity::Task(task) => Ok(task),
            other => Err(mismatch(EntityKind::Task, other)),
        }
    }

    pub fn tag(&self, entity: EntityRef) -> GraphResult<&Tag> {
        match self.entity(entity)? {
            Entity::Tag(tag) => Ok(tag),
            other => Err(mismatch(EntityKind::Tag, other)),
        }
    }

    pub fn note(&self, entity: EntityRef) -> GraphResult<&Note> {
        match self.entity(entity)? {
            Entity::Note(note) => Ok(note),
            other => Err(mismatch(EntityKind::Note, other)),
        }
    }

    pub fn attachment(&self, entity: EntityRef) -> GraphResult<&Attachment> {
        match self.entity(entity)? {
            Entity::Attachment(attachment) => Ok(attachment),
            other => Err(mismatch(EntityKind::Attachment, other)),
        }
    }

    pub fn user(&self, entity: EntityRef) -> GraphResult<&User> {
        match self.entity(entity)? {
            Entity::User(user) => Ok(user),
            other => Err(mismatch(EntityKind::User, other)),
        }
    }

    pub fn option(&self, entity: EntityRef) -> GraphResult<&AppOption> {
        match self.entity(entity)? {
            Entity::AppOption(option) => Ok(option),
            other => Err(mismatch(EntityKind::AppOption, other)),
        }
    }

    /// Reads one field.
    ///
    /// # Errors
    /// - [`GraphError::Unresolved`] for a single reference that has not been
    ///   resolved yet.
    pub fn get(&self, entity: EntityRef, field: Field) -> GraphResult<FieldValue> {
        let current = self.entity(entity)?;
        let unknown = GraphError::UnknownField {
            kind: entity.kind(),
            field,
        };
        match entity.kind().shape_of(field) {
            Some(FieldShape::Scalar) => current.scalar(field).ok_or(unknown),
            Some(FieldShape::Single) => match current.single(field).ok_or(unknown)? {
                LazyRef::Empty => Ok(FieldValue::Null),
                LazyRef::Resolved(target) => Ok(FieldValue::Ref(target)),
                LazyRef::Unresolved(_) => Err(GraphError::Unresolved { entity, field }),
            },
            Some(FieldShape::Ordered | FieldShape::Set) => {
                current.members(field).map(FieldValue::Refs).ok_or(unknown)
            }
            None => Err(unknown),
        }
    }

    /// Raw state of a single reference, without resolving it.
    pub fn lazy_ref(&self, entity: EntityRef, field: Field) -> GraphResult<LazyRef> {
        self.entity(entity)?
            .single(field)
            .ok_or(GraphError::UnknownField {
                kind: entity.kind(),
                field,
            })
    }

    pub fn members(&self, entity: EntityRef, field: Field) -> GraphResult<Vec<EntityRef>> {
        self.entity(entity)?
            .members(field)
            .ok_or(GraphError::UnknownField {
                kind: entity.kind(),
                field,
            })
    }

    pub fn has_member(&self, entity: EntityRef, field: Field, member: EntityRef) -> GraphResult<bool> {
        Ok(self.members(entity, field)?.contains(&member))
    }

    /// Child of `parent` at `index` in list order.
    pub fn child_at(&self, parent: EntityRef, index: usize) -> GraphResult<EntityRef> {
        let children = self.task(parent)?.children();
        children
            .get(index)
            .copied()
            .ok_or(GraphError::IndexOutOfRange {
                entity: parent,
                index,
                len: children.len(),
            })
    }

    /// Full named field map of one entity.
    ///
    /// # Errors
    /// - [`GraphError::Unresolved`] while any single reference is unresolved.
    pub fn field_map(&self, entity: EntityRef) -> GraphResult<FieldMap> {
        entity
            .kind()
            .fields()
            .iter()
            .map(|&field| Ok((field, self.get(entity, field)?)))
            .collect()
    }

    /// Single references of `entity` still waiting on the store.
    pub fn unresolved_fields(&self, entity: EntityRef) -> GraphResult<Vec<(Field, RecordHandle)>> {
        let current = self.entity(entity)?;
        Ok(entity
            .kind()
            .fields()
            .iter()
            .filter_map(|&field| match current.single(field) {
                Some(LazyRef::Unresolved(handle)) => Some((field, handle)),
                _ => None,
            })
            .collect())
    }

    /// Registers `listener` on `entity`.
    ///
    /// Registering the same id again is a no-op.
    ///
    /// # Errors
    /// - [`GraphError::ListenerConflict`] when a different id is registered.
    pub fn register_change_listener(
        &mut self,
        entity: EntityRef,
        listener: ListenerId,
    ) -> GraphResult<()> {
        let slot = self.slot_mut(entity)?;
        match slot.listener {
            Some(current) if current != listener => Err(GraphError::ListenerConflict(entity)),
            _ => {
                slot.listener = Some(listener);
                Ok(())
            }
        }
    }

    /// Removes the listener of `entity` and returns it.
    pub fn unregister_change_listener(
        &mut self,
        entity: EntityRef,
    ) -> GraphResult<Option<ListenerId>> {
        Ok(self.slot_mut(entity)?.listener.take())
    }

    pub fn listener_of(&self, entity: EntityRef) -> GraphResult<Option<ListenerId>> {
        Ok(self.slot(entity)?.listener)
    }

    /// Assigns a scalar or single-reference field.
    ///
    /// Assigning the current value is a no-op without notification. For a
    /// single reference, `value` is `FieldValue::Ref(target)` or
    /// `FieldValue::Null`; the old inverse link is severed before the new one
    /// is made.
    pub fn set<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        field: Field,
        value: FieldValue,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        let kind = entity.kind();
        let shape = validate_change(kind, field, Operation::Set)?;
        self.entity(entity)?;

        if shape == FieldShape::Single {
            return self.set_single(entity, field, value, listener);
        }

        let fits = kind
            .value_type_of(field)
            .is_some_and(|value_type| value.fits(value_type));
        if !fits {
            return Err(GraphError::InvalidValue { kind, field }.into());
        }
        if self.entity(entity)?.scalar(field).as_ref() == Some(&value) {
            return Ok(());
        }

        self.notify_changing(entity, field, listener)?;
        self.write_scalar(entity, field, value.clone())?;
        self.notify_changed(entity, field, Operation::Set, value, listener)
    }

    /// Adds `member` to a relationship collection and mirrors it.
    ///
    /// Adding an existing member is a silent no-op. When the inverse side is a
    /// single reference, the member is first detached from its previous owner.
    pub fn add<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        validate_change(entity.kind(), field, Operation::Add)?;
        let relation = self.relation(entity, field, member)?;
        if self.has_member(entity, field, member)? {
            return Ok(());
        }

        let previous_owner = if self.inverse_is_single(relation) {
            match self.lazy_ref(member, relation.inverse)? {
                LazyRef::Unresolved(_) => {
                    return Err(GraphError::Unresolved {
                        entity: member,
                        field: relation.inverse,
                    }
                    .into())
                }
                current => current.resolved(),
            }
        } else {
            None
        };

        self.notify_changing(entity, field, listener)?;
        self.notify_changing(member, relation.inverse, listener)?;
        if let Some(owner) = previous_owner.filter(|owner| *owner != entity) {
            self.notify_changing(owner, field, listener)?;
        }
        self.attach(entity, field, relation, member)?;
        self.notify_changed(entity, field, Operation::Add, FieldValue::Ref(member), listener)
    }

    /// Removes `member` from a relationship collection and mirrors it.
    ///
    /// # Errors
    /// - [`GraphError::NotAMember`] when removing an absent child from the
    ///   ordered `children` list. Set collections ignore absent members.
    pub fn remove<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        self.unlink(entity, field, member, true, listener)
    }

    /// Removes `member` if present; never fails on absence.
    pub fn discard<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        self.unlink(entity, field, member, false, listener)
    }

    /// Inserts `child` at `index` of `parent`'s children.
    ///
    /// A child already in the list is moved; the target index is adjusted for
    /// its removal. A child of another parent is re-homed. The index is
    /// clamped to the list length.
    pub fn insert_child<L: ChangeListener>(
        &mut self,
        parent: EntityRef,
        index: usize,
        child: EntityRef,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        self.task(parent)?;
        self.task(child)?;
        let children = self.task(parent)?.children();

        if let Some(position) = children.iter().position(|current| *current == child) {
            let target = if position < index { index - 1 } else { index };
            let target = target.min(children.len() - 1);
            if target == position {
                return Ok(());
            }
            self.notify_changing(parent, Field::Children, listener)?;
            let list = self.children_mut(parent)?;
            let moved = list.remove_at(position);
            list.insert_at(target, moved);
        } else {
            let previous = match self.lazy_ref(child, Field::Parent)? {
                LazyRef::Unresolved(_) => {
                    return Err(GraphError::Unresolved {
                        entity: child,
                        field: Field::Parent,
                    }
                    .into())
                }
                current => current.resolved(),
            };
            self.notify_changing(parent, Field::Children, listener)?;
            self.notify_changing(child, Field::Parent, listener)?;
            if let Some(previous) = previous {
                self.notify_changing(previous, Field::Children, listener)?;
                self.remove_member(previous, Field::Children, child)?;
            }
            self.children_mut(parent)?.insert_at(index, child);
            self.write_single(child, Field::Parent, LazyRef::Resolved(parent))?;
        }

        self.notify_changed(
            parent,
            Field::Children,
            Operation::Add,
            FieldValue::Ref(child),
            listener,
        )
    }

    /// Severs every relationship of `entity` through the notifying mutators.
    pub fn clear_relationships<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        let kind = entity.kind();
        for &field in kind.fields() {
            match kind.shape_of(field) {
                Some(FieldShape::Single) => {
                    if self.lazy_ref(entity, field)? != LazyRef::Empty {
                        self.set(entity, field, FieldValue::Null, listener)?;
                    }
                }
                Some(FieldShape::Ordered | FieldShape::Set) => {
                    for member in self.members(entity, field)? {
                        self.discard(entity, field, member, listener)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Puts `entity` back into the state captured in `snapshot` without
    /// notifying anyone. Relationship changes are mirrored onto partners.
    ///
    /// Unresolved references in the snapshot leave the field untouched.
    pub fn restore(&mut self, entity: EntityRef, snapshot: &Entity) -> GraphResult<()> {
        let kind = entity.kind();
        if snapshot.kind() != kind {
            return Err(mismatch(kind, snapshot));
        }

        for &field in kind.fields() {
            let Some(shape) = kind.shape_of(field) else {
                continue;
            };
            let Some(relation) = kind.relation_of(field) else {
                continue;
            };
            match shape {
                FieldShape::Scalar => {}
                FieldShape::Single => {
                    let wanted = match snapshot.single(field) {
                        Some(LazyRef::Unresolved(_)) => continue,
                        Some(wanted) => wanted.resolved().filter(|target| self.contains(*target)),
                        None => None,
                    };
                    let current = self.lazy_ref(entity, field)?;
                    if current == LazyRef::from_target(wanted) {
                        continue;
                    }
                    self.relink_single(entity, field, relation, current.resolved(), wanted)?;
                }
                FieldShape::Ordered | FieldShape::Set => {
                    let wanted = snapshot.members(field).unwrap_or_default();
                    let current = self.members(entity, field)?;
                    for member in current.iter().filter(|member| !wanted.contains(member)) {
                        self.detach(entity, field, relation, *member)?;
                    }
                    for member in wanted.iter() {
                        if self.contains(*member) && !self.has_member(entity, field, *member)? {
                            self.attach(entity, field, relation, *member)?;
                        }
                    }
                    if shape == FieldShape::Ordered {
                        self.reorder_children(entity, &wanted)?;
                    }
                }
            }
        }

        for &field in kind.fields() {
            if kind.shape_of(field) == Some(FieldShape::Scalar) {
                if let Some(value) = snapshot.scalar(field) {
                    self.write_scalar(entity, field, value)?;
                }
            }
        }
        trace!("event=graph_restore {} entity={entity}", self.log);
        Ok(())
    }

    /// Writes a scalar without notification.
    pub(crate) fn set_raw(
        &mut self,
        entity: EntityRef,
        field: Field,
        value: FieldValue,
    ) -> GraphResult<()> {
        let kind = entity.kind();
        if kind.shape_of(field) != Some(FieldShape::Scalar) {
            return Err(GraphError::InvalidOperation {
                field,
                operation: Operation::Set,
            });
        }
        self.write_scalar(entity, field, value)
    }

    /// Points a single reference at a record that is not loaded yet.
    pub(crate) fn set_unresolved(
        &mut self,
        entity: EntityRef,
        field: Field,
        handle: RecordHandle,
    ) -> GraphResult<()> {
        let single = self
            .slot_mut(entity)?
            .entity
            .single_mut(field)
            .ok_or(GraphError::UnknownField {
                kind: entity.kind(),
                field,
            })?;
        *single = LazyRef::Unresolved(handle);
        Ok(())
    }

    /// Replaces an unresolved reference with its target and makes the
    /// inverse link. Already resolved references are left alone.
    pub(crate) fn resolve_lazy(
        &mut self,
        entity: EntityRef,
        field: Field,
        target: Option<EntityRef>,
    ) -> GraphResult<()> {
        if !self.lazy_ref(entity, field)?.is_unresolved() {
            return Ok(());
        }
        let relation = match target {
            Some(target) => self.relation(entity, field, target)?,
            None => self.relation_of(entity, field)?,
        };
        self.write_single(entity, field, LazyRef::from_target(target))?;
        if let Some(target) = target {
            self.insert_member(target, relation.inverse, entity)?;
        }
        trace!(
            "event=graph_resolve {} entity={entity} field={}",
            self.log,
            field.name()
        );
        Ok(())
    }

    /// Mirrored link made while loading from storage; no notification.
    pub(crate) fn link_loaded(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
    ) -> GraphResult<()> {
        let relation = self.relation(entity, field, member)?;
        if self.has_member(entity, field, member)? {
            return Ok(());
        }
        self.attach(entity, field, relation, member)
    }

    fn set_single<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        field: Field,
        value: FieldValue,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        let target = match value {
            FieldValue::Null => None,
            FieldValue::Ref(target) => Some(target),
            _ => {
                return Err(GraphError::InvalidValue {
                    kind: entity.kind(),
                    field,
                }
                .into())
            }
        };
        let relation = match target {
            Some(target) => self.relation(entity, field, target)?,
            None => self.relation_of(entity, field)?,
        };

        let current = self.lazy_ref(entity, field)?;
        if current.is_unresolved() {
            return Err(GraphError::Unresolved { entity, field }.into());
        }
        let previous = current.resolved();
        if previous == target {
            return Ok(());
        }

        self.notify_changing(entity, field, listener)?;
        if let Some(previous) = previous {
            self.notify_changing(previous, relation.inverse, listener)?;
        }
        if let Some(target) = target {
            self.notify_changing(target, relation.inverse, listener)?;
        }
        self.relink_single(entity, field, relation, previous, target)?;
        self.notify_changed(entity, field, Operation::Set, value, listener)
    }

    fn unlink<L: ChangeListener>(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
        strict: bool,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        let shape = validate_change(entity.kind(), field, Operation::Remove)?;
        let relation = self.relation(entity, field, member)?;
        if !self.has_member(entity, field, member)? {
            if strict && shape == FieldShape::Ordered {
                return Err(GraphError::NotAMember {
                    entity,
                    field,
                    member,
                }
                .into());
            }
            return Ok(());
        }

        self.notify_changing(entity, field, listener)?;
        self.notify_changing(member, relation.inverse, listener)?;
        self.detach(entity, field, relation, member)?;
        self.notify_changed(
            entity,
            field,
            Operation::Remove,
            FieldValue::Ref(member),
            listener,
        )
    }

    fn relink_single(
        &mut self,
        entity: EntityRef,
        field: Field,
        relation: Relation,
        previous: Option<EntityRef>,
        target: Option<EntityRef>,
    ) -> GraphResult<()> {
        if let Some(previous) = previous {
            self.remove_member(previous, relation.inverse, entity)?;
        }
        self.write_single(entity, field, LazyRef::from_target(target))?;
        if let Some(target) = target {
            self.insert_member(target, relation.inverse, entity)?;
        }
        Ok(())
    }

    /// Links `member` into `field` of `entity` on both sides. When the inverse
    /// is a single reference, the member's previous owner loses it.
    fn attach(
        &mut self,
        entity: EntityRef,
        field: Field,
        relation: Relation,
        member: EntityRef,
    ) -> GraphResult<()> {
        if self.inverse_is_single(relation) {
            let previous = self.lazy_ref(member, relation.inverse)?.resolved();
            if let Some(previous) = previous.filter(|previous| *previous != entity) {
                self.remove_member(previous, field, member)?;
            }
            self.write_single(member, relation.inverse, LazyRef::Resolved(entity))?;
        } else {
            self.insert_member(member, relation.inverse, entity)?;
        }
        self.insert_member(entity, field, member)?;
        Ok(())
    }

    fn detach(
        &mut self,
        entity: EntityRef,
        field: Field,
        relation: Relation,
        member: EntityRef,
    ) -> GraphResult<()> {
        self.remove_member(entity, field, member)?;
        if self.inverse_is_single(relation) {
            if self.lazy_ref(member, relation.inverse)?.resolved() == Some(entity) {
                self.write_single(member, relation.inverse, LazyRef::Empty)?;
            }
        } else {
            self.remove_member(member, relation.inverse, entity)?;
        }
        Ok(())
    }

    fn reorder_children(&mut self, parent: EntityRef, wanted: &[EntityRef]) -> GraphResult<()> {
        let list = self.children_mut(parent)?;
        let current = list.to_vec();
        let mut ordered: Vec<EntityRef> = wanted
            .iter()
            .copied()
            .filter(|child| current.contains(child))
            .collect();
        ordered.extend(current.iter().copied().filter(|child| !wanted.contains(child)));
        list.replace_order(ordered);
        Ok(())
    }

    fn insert_member(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
    ) -> GraphResult<bool> {
        let kind = entity.kind();
        let mut members = self
            .slot_mut(entity)?
            .entity
            .members_mut(field)
            .ok_or(GraphError::UnknownField { kind, field })?;
        Ok(members.insert(member))
    }

    fn remove_member(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
    ) -> GraphResult<bool> {
        let kind = entity.kind();
        let mut members = self
            .slot_mut(entity)?
            .entity
            .members_mut(field)
            .ok_or(GraphError::UnknownField { kind, field })?;
        Ok(members.remove(member))
    }

    /// Writes a single reference and keeps its foreign key in step.
    /// Unresolved references keep the foreign key loaded from storage.
    fn write_single(&mut self, entity: EntityRef, field: Field, value: LazyRef) -> GraphResult<()> {
        let foreign_key = match value {
            LazyRef::Empty => Some(FieldValue::Null),
            LazyRef::Resolved(target) => Some(self.entity(target)?.int_id().into()),
            LazyRef::Unresolved(_) => None,
        };
        let kind = entity.kind();
        let slot = self.slot_mut(entity)?;
        let single = slot
            .entity
            .single_mut(field)
            .ok_or(GraphError::UnknownField { kind, field })?;
        *single = value;
        if let (Some(key_field), Some(key)) = (kind.foreign_key_of(field), foreign_key) {
            slot.entity.set_scalar(key_field, key);
        }
        Ok(())
    }

    fn write_scalar(&mut self, entity: EntityRef, field: Field, value: FieldValue) -> GraphResult<()> {
        let kind = entity.kind();
        self.slot_mut(entity)?
            .entity
            .set_scalar(field, value)
            .ok_or(GraphError::InvalidValue { kind, field })
    }

    fn children_mut(&mut self, parent: EntityRef) -> GraphResult<&mut OrderedRefs> {
        let kind = parent.kind();
        self.slot_mut(parent)?
            .entity
            .children_mut()
            .ok_or(GraphError::KindMismatch {
                expected: EntityKind::Task,
                actual: kind,
            })
    }

    fn relation_of(&self, entity: EntityRef, field: Field) -> GraphResult<Relation> {
        entity
            .kind()
            .relation_of(field)
            .ok_or(GraphError::UnknownField {
                kind: entity.kind(),
                field,
            })
    }

    /// Relation of `field`, checking that `member` exists and has the target
    /// kind.
    fn relation(&self, entity: EntityRef, field: Field, member: EntityRef) -> GraphResult<Relation> {
        let relation = self.relation_of(entity, field)?;
        if member.kind() != relation.target {
            return Err(GraphError::KindMismatch {
                expected: relation.target,
                actual: member.kind(),
            });
        }
        self.entity(member)?;
        Ok(relation)
    }

    fn inverse_is_single(&self, relation: Relation) -> bool {
        relation.target.shape_of(relation.inverse) == Some(FieldShape::Single)
    }

    fn observes<L: ChangeListener>(&self, entity: EntityRef, listener: &L) -> bool {
        match (self.slot(entity), listener.listener_id()) {
            (Ok(slot), Some(id)) => slot.listener == Some(id),
            _ => false,
        }
    }

    fn notify_changing<L: ChangeListener>(
        &self,
        entity: EntityRef,
        field: Field,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        if self.observes(entity, listener) {
            listener.field_changing(self, entity, field)?;
        }
        Ok(())
    }

    fn notify_changed<L: ChangeListener>(
        &self,
        entity: EntityRef,
        field: Field,
        operation: Operation,
        value: FieldValue,
        listener: &mut L,
    ) -> Result<(), L::Error> {
        trace!(
            "event=graph_mutation {} entity={entity} field={} op={operation}",
            self.log,
            field.name()
        );
        if !self.observes(entity, listener) {
            return Ok(());
        }
        let change = FieldChange {
            entity,
            field,
            operation,
            value,
        };
        listener.field_changed(self, &change)
    }

    fn slot(&self, entity: EntityRef) -> GraphResult<&Slot> {
        self.slots
            .get(entity.index())
            .filter(|slot| slot.entity.kind() == entity.kind())
            .ok_or(GraphError::UnknownEntity(entity))
    }

    fn slot_mut(&mut self, entity: EntityRef) -> GraphResult<&mut Slot> {
        self.slots
            .get_mut(entity.index())
            .filter(|slot| slot.entity.kind() == entity.kind())
            .ok_or(GraphError::UnknownEntity(entity))
    }
}

fn mismatch(expected: EntityKind, actual: &Entity) -> GraphError {
    GraphError::KindMismatch {
        expected,
        actual: actual.kind(),
    }
}
