//! Session façade over the entity graph, identity map, unit of work and
//! record store.
//!
//! # Responsibility
//! - Construct entities and route every field mutation through the tracker.
//! - Resolve lazy single references before they are read or replaced.
//!
//! # Invariants
//! - Every entity the session loads or tracks is registered under the
//!   session's listener id.
//! - Mutations made through the session are mirrored to storage before the
//!   call returns.

use super::error::{BridgeError, BridgeResult};
use super::identity_map::IdentityMap;
use super::unit_of_work::{TrackedCounts, Tracker, UnitOfWork};
use crate::config::BridgeConfig;
use crate::db::open_db_with;
use crate::logging::{init_logging, LogContext};
use crate::model::collection::LazyRef;
use crate::model::entity::{AppOption, Attachment, Entity, Note, Tag, Task, User};
use crate::model::field::{Field, FieldMap, FieldShape, FieldValue};
use crate::model::graph::{Graph, GraphError};
use crate::model::EntityRef;
use crate::notify::{ListenerId, Operation};
use crate::store::{RecordStore, SqliteRecordStore, StoreError};
use log::info;

/// One unit-of-work scope over a record store.
pub struct Session<S: RecordStore> {
    pub(super) graph: Graph,
    pub(super) identity: IdentityMap,
    pub(super) work: UnitOfWork,
    pub(super) store: S,
    pub(super) listener: ListenerId,
    pub(super) config: BridgeConfig,
    pub(super) log: LogContext,
}

impl Session<SqliteRecordStore> {
    /// Opens the configured database, applies migrations and starts a
    /// session. File logging is initialized when the config names both a
    /// level and a directory.
    pub fn open(config: &BridgeConfig) -> BridgeResult<Self> {
        if let (Some(level), Some(dir)) = (config.log_level.as_deref(), config.log_dir.as_deref()) {
            init_logging(level, dir).map_err(BridgeError::Logging)?;
        }
        let log = LogContext::new("session");
        let conn = open_db_with(&config.database, config.busy_timeout).map_err(StoreError::from)?;
        let store = SqliteRecordStore::with_log(conn, log.child("store"));
        info!(
            "event=session_open {} status=ok mode={}",
            log,
            config.database.mode()
        );
        Ok(Self::with_store(store, config.clone(), log))
    }

    /// Session over a fresh in-memory database.
    pub fn in_memory() -> BridgeResult<Self> {
        Self::open(&BridgeConfig::default())
    }
}

impl<S: RecordStore> Session<S> {
    pub fn with_store(store: S, config: BridgeConfig, log: LogContext) -> Self {
        Self {
            graph: Graph::new(log.child("graph")),
            identity: IdentityMap::new(),
            work: UnitOfWork::new(),
            store,
            listener: ListenerId::new(),
            config,
            log: log.child("uow"),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    pub fn new_task(&mut self, task: Task) -> EntityRef {
        self.graph.create_task(task)
    }

    pub fn new_tag(&mut self, tag: Tag) -> EntityRef {
        self.graph.create_tag(tag)
    }

    pub fn new_note(&mut self, note: Note) -> EntityRef {
        self.graph.create_note(note)
    }

    pub fn new_attachment(&mut self, attachment: Attachment) -> EntityRef {
        self.graph.create_attachment(attachment)
    }

    pub fn new_user(&mut self, user: User) -> EntityRef {
        self.graph.create_user(user)
    }

    pub fn new_option(&mut self, option: AppOption) -> EntityRef {
        self.graph.create_option(option)
    }

    pub fn entity(&self, entity: EntityRef) -> BridgeResult<&Entity> {
        Ok(self.graph.entity(entity)?)
    }

    /// Reads one field, resolving a lazy single reference first.
    pub fn get(&mut self, entity: EntityRef, field: Field) -> BridgeResult<FieldValue> {
        if entity.kind().shape_of(field) == Some(FieldShape::Single) {
            self.resolve(entity, field)?;
        }
        Ok(self.graph.get(entity, field)?)
    }

    pub fn members(&self, entity: EntityRef, field: Field) -> BridgeResult<Vec<EntityRef>> {
        Ok(self.graph.members(entity, field)?)
    }

    /// Resolves a single reference through the identity map and returns its
    /// target.
    pub fn resolve(&mut self, entity: EntityRef, field: Field) -> BridgeResult<Option<EntityRef>> {
        if let LazyRef::Unresolved(record) = self.graph.lazy_ref(entity, field)? {
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
            self.graph.resolve_lazy(entity, field, target)?;
        }
        Ok(self.graph.lazy_ref(entity, field)?.resolved())
    }

    /// Assigns a scalar or single-reference field.
    pub fn set(
        &mut self,
        entity: EntityRef,
        field: Field,
        value: impl Into<FieldValue>,
    ) -> BridgeResult<()> {
        let value = value.into();
        let target = match &value {
            FieldValue::Ref(target) => Some(*target),
            _ => None,
        };
        self.reject_deleted(entity, target)?;
        self.prepare(entity, field, target)?;
        self.mirror(|graph, tracker| graph.set(entity, field, value, tracker))
    }

    /// Adds `member` to a relationship collection of `entity`.
    pub fn add_to(&mut self, entity: EntityRef, field: Field, member: EntityRef) -> BridgeResult<()> {
        self.reject_deleted(entity, Some(member))?;
        self.prepare(entity, field, Some(member))?;
        self.mirror(|graph, tracker| graph.add(entity, field, member, tracker))
    }

    /// Removes `member`; absent members are an error for `children` only.
    pub fn remove_from(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
    ) -> BridgeResult<()> {
        self.prepare(entity, field, Some(member))?;
        self.mirror(|graph, tracker| graph.remove(entity, field, member, tracker))
    }

    /// Removes `member` if present.
    pub fn discard_from(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: EntityRef,
    ) -> BridgeResult<()> {
        self.prepare(entity, field, Some(member))?;
        self.mirror(|graph, tracker| graph.discard(entity, field, member, tracker))
    }

    /// Inserts `child` at `index` of `parent`'s children.
    pub fn insert_child(
        &mut self,
        parent: EntityRef,
        index: usize,
        child: EntityRef,
    ) -> BridgeResult<()> {
        self.reject_deleted(parent, Some(child))?;
        self.prepare(parent, Field::Children, Some(child))?;
        self.mirror(|graph, tracker| graph.insert_child(parent, index, child, tracker))
    }

    /// Full named field map with every single reference resolved.
    pub fn field_map(&mut self, entity: EntityRef) -> BridgeResult<FieldMap> {
        self.resolve_singles(entity)?;
        Ok(self.graph.field_map(entity)?)
    }

    /// Applies a partial field map. Present keys are assigned; a null single
    /// reference clears it.
    ///
    /// # Errors
    /// - `InvalidOperation` for collection fields, before anything is written.
    pub fn update_fields(&mut self, entity: EntityRef, fields: &FieldMap) -> BridgeResult<()> {
        let kind = entity.kind();
        for field in fields.keys() {
            match kind.shape_of(*field) {
                Some(shape) if shape.is_collection() => {
                    return Err(GraphError::InvalidOperation {
                        field: *field,
                        operation: Operation::Set,
                    }
                    .into())
                }
                Some(_) => {}
                None => {
                    return Err(GraphError::UnknownField {
                        kind,
                        field: *field,
                    }
                    .into())
                }
            }
        }
        for (field, value) in fields {
            self.set(entity, *field, value.clone())?;
        }
        Ok(())
    }

    pub fn is_pending_add(&self, entity: EntityRef) -> bool {
        self.work.is_added(entity)
    }

    pub fn is_pending_delete(&self, entity: EntityRef) -> bool {
        self.work.is_deleted(entity)
    }

    pub fn is_changed(&self, entity: EntityRef) -> bool {
        self.work.is_changed(entity)
    }

    pub fn tracked_counts(&self) -> TrackedCounts {
        self.work.counts()
    }

    /// Resolves every single reference of `entity`.
    pub(super) fn resolve_singles(&mut self, entity: EntityRef) -> BridgeResult<()> {
        for (field, _) in self.graph.unresolved_fields(entity)? {
            self.resolve(entity, field)?;
        }
        Ok(())
    }

    /// Writes and new links must not reach entities pending deletion.
    fn reject_deleted(&self, entity: EntityRef, target: Option<EntityRef>) -> BridgeResult<()> {
        match std::iter::once(entity)
            .chain(target)
            .find(|candidate| self.work.is_deleted(*candidate))
        {
            Some(deleted) => Err(BridgeError::PendingDeletion(deleted)),
            None => Ok(()),
        }
    }

    /// Resolves the single references a mutation of `field` may touch: the
    /// field itself and, for collections, the member's inverse.
    fn prepare(
        &mut self,
        entity: EntityRef,
        field: Field,
        member: Option<EntityRef>,
    ) -> BridgeResult<()> {
        let kind = entity.kind();
        if kind.shape_of(field) == Some(FieldShape::Single) {
            self.resolve(entity, field)?;
        }
        if let (Some(member), Some(relation)) = (member, kind.relation_of(field)) {
            if member.kind() == relation.target
                && relation.target.shape_of(relation.inverse) == Some(FieldShape::Single)
            {
                self.resolve(member, relation.inverse)?;
            }
        }
        Ok(())
    }

    /// Borrows the graph and a tracker over the remaining session state.
    pub(super) fn split(&mut self) -> (&mut Graph, Tracker<'_, S>) {
        (
            &mut self.graph,
            Tracker {
                work: &mut self.work,
                identity: &mut self.identity,
                store: &mut self.store,
                listener: self.listener,
                log: &self.log,
                touched: Vec::new(),
            },
        )
    }
}
