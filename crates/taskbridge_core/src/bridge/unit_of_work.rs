//! Pending additions, deletions and changes of one session.
//!
//! # Responsibility
//! - Snapshot tracked entities on their first change.
//! - Mirror every tracked mutation onto storage records as it happens.
//! - Commit pending work atomically, or roll it back to the snapshots.
//!
//! # Invariants
//! - An entity is never pending addition and pending deletion at once.
//! - A failed commit leaves every tracking set as it was, so `rollback` can
//!   still undo the work.
//! - After `commit` or `rollback` returns `Ok`, nothing is tracked.
//! - Entities without this session's listener are neither snapshotted nor
//!   reverted.
//! - A mutation whose storage mirror fails leaves the graph, the tracking
//!   sets and the identity map as they were before the call.

use super::error::{BridgeError, BridgeResult};
use super::identity_map::IdentityMap;
use super::session::Session;
use crate::logging::LogContext;
use crate::model::collection::LazyRef;
use crate::model::entity::Entity;
use crate::model::field::{Field, FieldShape, FieldValue};
use crate::model::graph::Graph;
use crate::model::EntityRef;
use crate::notify::{ChangeListener, FieldChange, ListenerId, Operation};
use crate::store::RecordStore;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Tracking state of one session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    added: BTreeSet<EntityRef>,
    deleted: BTreeSet<EntityRef>,
    changed: BTreeSet<EntityRef>,
    snapshots: BTreeMap<EntityRef, Entity>,
    refresh: BTreeMap<EntityRef, BTreeSet<Field>>,
}

/// Sizes of the tracking sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedCounts {
    pub added: usize,
    pub deleted: usize,
    pub changed: usize,
    pub snapshots: usize,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_added(&self, entity: EntityRef) -> bool {
        self.added.contains(&entity)
    }

    pub fn is_deleted(&self, entity: EntityRef) -> bool {
        self.deleted.contains(&entity)
    }

    pub fn is_changed(&self, entity: EntityRef) -> bool {
        self.changed.contains(&entity)
    }

    pub fn snapshot(&self, entity: EntityRef) -> Option<&Entity> {
        self.snapshots.get(&entity)
    }

    pub fn counts(&self) -> TrackedCounts {
        TrackedCounts {
            added: self.added.len(),
            deleted: self.deleted.len(),
            changed: self.changed.len(),
            snapshots: self.snapshots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.deleted.is_empty()
            && self.changed.is_empty()
            && self.snapshots.is_empty()
            && self.refresh.is_empty()
    }

    fn take_snapshot(&mut self, graph: &Graph, entity: EntityRef) -> BridgeResult<()> {
        if !self.snapshots.contains_key(&entity) {
            self.snapshots.insert(entity, graph.entity(entity)?.clone());
        }
        Ok(())
    }

    fn mark_refresh(&mut self, entity: EntityRef, fields: impl IntoIterator<Item = Field>) {
        self.refresh.entry(entity).or_default().extend(fields);
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Graph state of an entity ahead of the first notification it received
/// during one mutation.
pub(crate) struct Touched {
    entity: EntityRef,
    before: Entity,
    had_snapshot: bool,
    was_changed: bool,
}

/// Change listener that feeds tracked mutations into the unit of work and
/// the store.
pub(crate) struct Tracker<'a, S: RecordStore> {
    pub work: &'a mut UnitOfWork,
    pub identity: &'a mut IdentityMap,
    pub store: &'a mut S,
    pub listener: ListenerId,
    pub log: &'a LogContext,
    pub touched: Vec<Touched>,
}

impl<S: RecordStore> ChangeListener for Tracker<'_, S> {
    type Error = BridgeError;

    fn listener_id(&self) -> Option<ListenerId> {
        Some(self.listener)
    }

    fn field_changing(
        &mut self,
        graph: &Graph,
        entity: EntityRef,
        _field: Field,
    ) -> BridgeResult<()> {
        if !self.touched.iter().any(|touch| touch.entity == entity) {
            self.touched.push(Touched {
                entity,
                before: graph.entity(entity)?.clone(),
                had_snapshot: self.work.snapshots.contains_key(&entity),
                was_changed: self.work.changed.contains(&entity),
            });
        }
        self.work.take_snapshot(graph, entity)?;
        self.work.changed.insert(entity);
        Ok(())
    }

    fn field_changed(&mut self, graph: &Graph, change: &FieldChange) -> BridgeResult<()> {
        let entity = change.entity;
        let kind = entity.kind();
        let record = self.identity.storage_for(graph, self.store, entity)?;
        debug!(
            "event=uow_mirror {} entity={entity} field={} op={}",
            self.log,
            change.field.name(),
            change.operation
        );

        match (kind.shape_of(change.field), change.operation) {
            (Some(FieldShape::Scalar), Operation::Set) => {
                if change.field.is_foreign_key() {
                    self.work.mark_refresh(entity, [change.field]);
                } else if let Some(value) = change.value.clone().scalar_cast() {
                    self.store.set(record, change.field, value)?;
                }
            }
            (Some(FieldShape::Single), Operation::Set) => {
                let value = match change.value {
                    FieldValue::Ref(target) => {
                        FieldValue::Ref(self.identity.storage_for(graph, self.store, target)?)
                    }
                    _ => FieldValue::Null,
                };
                self.store.set(record, change.field, value)?;
                self.work
                    .mark_refresh(entity, kind.dependents_of(change.field).iter().copied());
            }
            (Some(FieldShape::Ordered | FieldShape::Set), Operation::Add) => {
                if let FieldValue::Ref(member) = change.value {
                    let member_record = self.identity.storage_for(graph, self.store, member)?;
                    self.store.link(record, change.field, member_record)?;
                    self.refresh_inverse_key(entity, change.field, member);
                }
            }
            (Some(FieldShape::Ordered | FieldShape::Set), Operation::Remove) => {
                if let FieldValue::Ref(member) = change.value {
                    if let Some(member_record) = self.identity.get(member) {
                        self.store.unlink(record, change.field, member_record)?;
                    }
                    self.refresh_inverse_key(entity, change.field, member);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl<S: RecordStore> Tracker<'_, S> {
    /// Queues the foreign key of `member` when the inverse side of `field` is
    /// a single reference.
    fn refresh_inverse_key(&mut self, entity: EntityRef, field: Field, member: EntityRef) {
        let Some(relation) = entity.kind().relation_of(field) else {
            return;
        };
        self.work.mark_refresh(
            member,
            relation
                .target
                .dependents_of(relation.inverse)
                .iter()
                .copied(),
        );
    }
}

impl<S: RecordStore> Session<S> {
    /// Starts tracking `entity` for insertion, along with any untracked
    /// entities reachable through its relationships.
    ///
    /// Adding an entity that is already pending addition or changed is a
    /// no-op.
    ///
    /// # Errors
    /// - [`BridgeError::PendingDeletion`] when `entity` is pending deletion.
    pub fn add(&mut self, entity: EntityRef) -> BridgeResult<()> {
        self.graph.entity(entity)?;
        if self.work.is_deleted(entity) {
            return Err(BridgeError::PendingDeletion(entity));
        }
        if self.work.is_added(entity) || self.work.is_changed(entity) {
            return Ok(());
        }
        self.resolve_singles(entity)?;

        let record = self
            .identity
            .storage_for(&self.graph, &mut self.store, entity)?;
        self.identity
            .copy_fields_to_storage(&self.graph, &mut self.store, entity, record)?;
        self.graph.register_change_listener(entity, self.listener)?;
        self.track_added(entity);
        self.adopt_created()?;
        info!(
            "event=uow_add {} status=ok entity={entity} record={record}",
            self.log
        );
        Ok(())
    }

    /// Marks `entity` for deletion and severs all of its relationships now.
    ///
    /// Deleting an entity that is already pending deletion is a no-op.
    ///
    /// # Errors
    /// - [`BridgeError::PendingAddition`] when `entity` is pending addition.
    /// - [`BridgeError::UntrackedDelete`] when `entity` has neither a cached
    ///   record nor a stored identity.
    pub fn delete(&mut self, entity: EntityRef) -> BridgeResult<()> {
        self.graph.entity(entity)?;
        if self.work.is_added(entity) {
            return Err(BridgeError::PendingAddition(entity));
        }
        if self.work.is_deleted(entity) {
            return Ok(());
        }
        let record = self
            .identity
            .find_storage(&self.graph, &mut self.store, entity)?
            .ok_or(BridgeError::UntrackedDelete(entity))?;

        self.resolve_singles(entity)?;
        let registered = self.graph.listener_of(entity)?.is_none();
        if registered {
            self.graph.register_change_listener(entity, self.listener)?;
        }
        if let Err(err) = self.mirror(|graph, tracker| graph.clear_relationships(entity, tracker)) {
            if registered {
                self.graph.unregister_change_listener(entity)?;
            }
            return Err(err);
        }

        self.work.take_snapshot(&self.graph, entity)?;
        self.work.deleted.insert(entity);
        self.store.delete(record)?;
        info!(
            "event=uow_delete {} status=ok entity={entity} record={record}",
            self.log
        );
        Ok(())
    }

    /// Flushes every pending write in one transaction and pulls
    /// store-generated fields back into the graph.
    ///
    /// # Errors
    /// - Store failures, including identity conflicts. Tracking state is left
    ///   untouched; call [`Session::rollback`] to discard the work.
    pub fn commit(&mut self) -> BridgeResult<()> {
        let started_at = Instant::now();
        let added = std::mem::take(&mut self.work.added);
        let deleted = std::mem::take(&mut self.work.deleted);
        let refresh = std::mem::take(&mut self.work.refresh);

        if let Err(err) = self.store.commit() {
            self.work.added.extend(added);
            self.work.deleted.extend(deleted);
            for (entity, fields) in refresh {
                self.work.mark_refresh(entity, fields);
            }
            error!(
                "event=uow_commit {} status=error duration_ms={} error={err}",
                self.log,
                started_at.elapsed().as_millis()
            );
            return Err(err.into());
        }

        for &entity in &added {
            let fields = entity.kind().autochange_fields().iter().copied();
            self.identity
                .pull_fields(&mut self.graph, &mut self.store, entity, fields)?;
        }
        for (&entity, fields) in &refresh {
            self.identity.pull_fields(
                &mut self.graph,
                &mut self.store,
                entity,
                fields.iter().copied(),
            )?;
        }
        for &entity in &deleted {
            self.identity.forget(entity);
            self.graph.unregister_change_listener(entity)?;
        }

        let changed = self.work.changed.len();
        self.work.clear();
        info!(
            "event=uow_commit {} status=ok added={} deleted={} changed={changed} duration_ms={}",
            self.log,
            added.len(),
            deleted.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Discards all uncommitted work: the store drops its pending writes,
    /// tracked entities get their snapshots back and pending deletions are
    /// undone.
    pub fn rollback(&mut self) -> BridgeResult<()> {
        let started_at = Instant::now();
        self.store.rollback()?;
        let pruned = self.identity.prune(&self.store);

        let snapshots = std::mem::take(&mut self.work.snapshots);
        for (entity, snapshot) in &snapshots {
            let snapshot = self.resolve_snapshot(snapshot)?;
            self.graph.restore(*entity, &snapshot)?;
        }
        let deleted = std::mem::take(&mut self.work.deleted);
        for &entity in &deleted {
            self.identity
                .sync_from_storage(&mut self.graph, &mut self.store, entity, self.listener)?;
        }
        for &entity in &pruned {
            self.graph.unregister_change_listener(entity)?;
        }

        self.work.clear();
        info!(
            "event=uow_rollback {} status=ok restored={} undeleted={} pruned={} duration_ms={}",
            self.log,
            snapshots.len(),
            deleted.len(),
            pruned.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Runs one graph mutation with this session's tracker.
    ///
    /// When the mutation fails part way, every entity it touched gets its
    /// prior graph state back, tracking entries it introduced are dropped
    /// and records it created are discarded.
    pub(super) fn mirror(
        &mut self,
        mutation: impl FnOnce(&mut Graph, &mut Tracker<'_, S>) -> BridgeResult<()>,
    ) -> BridgeResult<()> {
        let refresh = self.work.refresh.clone();
        let (graph, mut tracker) = self.split();
        let outcome = mutation(graph, &mut tracker);
        let touched = std::mem::take(&mut tracker.touched);
        match outcome {
            Ok(()) => self.adopt_created(),
            Err(err) => {
                self.revert(touched, refresh)?;
                warn!("event=uow_mirror {} status=reverted error={err}", self.log);
                Err(err)
            }
        }
    }

    fn revert(
        &mut self,
        touched: Vec<Touched>,
        refresh: BTreeMap<EntityRef, BTreeSet<Field>>,
    ) -> BridgeResult<()> {
        for touch in touched.iter().rev() {
            self.graph.restore(touch.entity, &touch.before)?;
            if !touch.had_snapshot {
                self.work.snapshots.remove(&touch.entity);
            }
            if !touch.was_changed {
                self.work.changed.remove(&touch.entity);
            }
        }
        self.work.refresh = refresh;
        for entity in self.identity.take_created() {
            if let Some(record) = self.identity.forget(entity) {
                self.store.delete(record)?;
            }
        }
        Ok(())
    }

    /// Registers entities whose records were created as a side effect of a
    /// mirrored mutation and tracks them as pending additions.
    pub(super) fn adopt_created(&mut self) -> BridgeResult<()> {
        for entity in self.identity.take_created() {
            if self.graph.listener_of(entity)?.is_none() {
                self.graph.register_change_listener(entity, self.listener)?;
            }
            self.track_added(entity);
            debug!("event=uow_adopt {} entity={entity}", self.log);
        }
        Ok(())
    }

    /// Foreign keys are refreshed too: a target added in the same cycle has
    /// no id until the flush.
    fn track_added(&mut self, entity: EntityRef) {
        let kind = entity.kind();
        self.work.added.insert(entity);
        self.work.changed.insert(entity);
        self.work
            .mark_refresh(entity, kind.autochange_fields().iter().copied());
        self.work.mark_refresh(
            entity,
            kind.fields().iter().copied().filter(|field| field.is_foreign_key()),
        );
    }

    /// Copy of `snapshot` with unresolved references translated, so that
    /// restoring it relinks them.
    fn resolve_snapshot(&mut self, snapshot: &Entity) -> BridgeResult<Entity> {
        let mut resolved = snapshot.clone();
        let kind = snapshot.kind();
        for &field in kind.fields() {
            if kind.shape_of(field) != Some(FieldShape::Single) {
                continue;
            }
            let Some(LazyRef::Unresolved(record)) = snapshot.single(field) else {
                continue;
            };
            let target = if self.store.is_live(record) {
                Some(self.identity.domain_for(
                    &mut self.graph,
                    &mut self.store,
                    record,
                    self.listener,
                )?)
            } else {
                None
            };
            if let Some(single) = resolved.single_mut(field) {
                *single = LazyRef::from_target(target);
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::UnitOfWork;
    use crate::model::entity::Task;
    use crate::model::graph::Graph;

    #[test]
    fn first_snapshot_wins() {
        let mut graph = Graph::default();
        let task = graph.create_task(Task::new("before"));
        let mut work = UnitOfWork::new();

        work.take_snapshot(&graph, task).unwrap();
        work.take_snapshot(&graph, task).unwrap();

        assert_eq!(work.counts().snapshots, 1);
        assert_eq!(work.snapshot(task), Some(graph.entity(task).unwrap()));
    }

    #[test]
    fn empty_work_reports_empty() {
        let work = UnitOfWork::new();
        assert!(work.is_empty());
        assert_eq!(work.counts().added, 0);
    }
}
