//! Bidirectional cache between domain entities and storage records.
//!
//! # Responsibility
//! - Translate entity handles to record handles and back in O(1).
//! - Create missing counterparts on demand, in either direction.
//!
//! # Invariants
//! - Both directions always hold the same pairs.
//! - A mapping is inserted before relationship fields are copied, so cyclic
//!   graphs translate without recursing forever.
//! - Records created here are reported through [`IdentityMap::take_created`]
//!   so the unit of work can track them.

use super::error::{BridgeError, BridgeResult};
use crate::model::collection::LazyRef;
use crate::model::entity::Entity;
use crate::model::field::{Field, FieldShape, FieldValue};
use crate::model::graph::Graph;
use crate::model::{EntityId, EntityKind, EntityRef};
use crate::notify::ListenerId;
use crate::store::{RecordHandle, RecordStore, StoreError};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct IdentityMap {
    to_storage: HashMap<EntityRef, RecordHandle>,
    to_domain: HashMap<RecordHandle, EntityRef>,
    created: Vec<EntityRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.to_storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_storage.is_empty()
    }

    /// Cached record of `entity`.
    pub fn get(&self, entity: EntityRef) -> Option<RecordHandle> {
        self.to_storage.get(&entity).copied()
    }

    /// Cached entity of `record`.
    pub fn entity_of(&self, record: RecordHandle) -> Option<EntityRef> {
        self.to_domain.get(&record).copied()
    }

    pub fn contains(&self, entity: EntityRef) -> bool {
        self.to_storage.contains_key(&entity)
    }

    /// Entities whose records were created since the last call.
    pub fn take_created(&mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.created)
    }

    /// Record of `entity` by cache or by identity. Never creates one.
    ///
    /// # Errors
    /// - [`BridgeError::IdentityInUse`] when the stored record already belongs
    ///   to another entity.
    pub fn find_storage<S: RecordStore>(
        &mut self,
        graph: &Graph,
        store: &mut S,
        entity: EntityRef,
    ) -> BridgeResult<Option<RecordHandle>> {
        if let Some(record) = self.get(entity) {
            return Ok(Some(record));
        }
        let Some(id) = graph.entity(entity)?.identity() else {
            return Ok(None);
        };
        let Some(record) = store.find(entity.kind(), &id)? else {
            return Ok(None);
        };
        match self.entity_of(record) {
            Some(owner) if owner != entity => Err(BridgeError::IdentityInUse {
                kind: entity.kind(),
                id,
            }),
            _ => {
                self.cache(entity, record);
                Ok(Some(record))
            }
        }
    }

    /// Record of `entity`, creating and populating one when the store has
    /// none.
    pub fn storage_for<S: RecordStore>(
        &mut self,
        graph: &Graph,
        store: &mut S,
        entity: EntityRef,
    ) -> BridgeResult<RecordHandle> {
        if let Some(record) = self.find_storage(graph, store, entity)? {
            return Ok(record);
        }
        let record = store.create(entity.kind())?;
        self.cache(entity, record);
        self.created.push(entity);
        self.copy_fields_to_storage(graph, store, entity, record)?;
        Ok(record)
    }

    /// Copies every field of `entity` onto `record`. Foreign keys are derived
    /// by the store and skipped; collection members missing from the entity
    /// are unlinked.
    pub fn copy_fields_to_storage<S: RecordStore>(
        &mut self,
        graph: &Graph,
        store: &mut S,
        entity: EntityRef,
        record: RecordHandle,
    ) -> BridgeResult<()> {
        let kind = entity.kind();
        let fresh = self.created.contains(&entity);
        for &field in kind.fields() {
            match kind.shape_of(field) {
                Some(FieldShape::Scalar) => {
                    if field.is_foreign_key() {
                        continue;
                    }
                    let value = graph.get(entity, field)?;
                    if value.is_null() && field == kind.identity_field() {
                        continue;
                    }
                    if let Some(value) = value.scalar_cast() {
                        store.set(record, field, value)?;
                    }
                }
                Some(FieldShape::Single) => match graph.lazy_ref(entity, field)? {
                    LazyRef::Unresolved(_) => {}
                    LazyRef::Empty => store.set(record, field, FieldValue::Null)?,
                    LazyRef::Resolved(target) => {
                        let target = self.storage_for(graph, store, target)?;
                        store.set(record, field, FieldValue::Ref(target))?;
                    }
                },
                Some(FieldShape::Ordered | FieldShape::Set) => {
                    let mut wanted = BTreeSet::new();
                    for member in graph.members(entity, field)? {
                        wanted.insert(self.storage_for(graph, store, member)?);
                    }
                    if !fresh {
                        let current = store.get(record, field)?;
                        for stale in current.as_refs().unwrap_or_default() {
                            if !wanted.contains(stale) {
                                store.unlink(record, field, *stale)?;
                            }
                        }
                    }
                    for member in wanted {
                        store.link(record, field, member)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Entity of `record`, building one from its stored fields when it is not
    /// cached. New entities are registered under `listener`.
    ///
    /// Single references are left unresolved; collections are loaded through
    /// this map, which also resolves the inverse single references.
    pub fn domain_for<S: RecordStore>(
        &mut self,
        graph: &mut Graph,
        store: &mut S,
        record: RecordHandle,
        listener: ListenerId,
    ) -> BridgeResult<EntityRef> {
        if let Some(entity) = self.entity_of(record) {
            return Ok(entity);
        }
        if !store.is_live(record) {
            return Err(StoreError::DiscardedRecord(record).into());
        }
        let kind = store.kind(record)?;
        let entity = graph.create(Entity::blank(kind));
        self.cache(entity, record);
        graph.register_change_listener(entity, listener)?;

        for &field in kind.fields() {
            match kind.shape_of(field) {
                Some(FieldShape::Scalar) => {
                    let value = scalar_value(store.get(record, field)?)?;
                    graph.set_raw(entity, field, value)?;
                }
                Some(FieldShape::Single) => {
                    if let FieldValue::Ref(target) = store.get(record, field)? {
                        graph.set_unresolved(entity, field, target)?;
                    }
                }
                Some(FieldShape::Ordered | FieldShape::Set) => {
                    let members = store.get(record, field)?;
                    for member in members.as_refs().unwrap_or_default().to_vec() {
                        let member = self.domain_for(graph, store, member, listener)?;
                        graph.link_loaded(entity, field, member)?;
                    }
                }
                None => {}
            }
        }
        Ok(entity)
    }

    /// Like [`IdentityMap::domain_for`], rejecting records of another kind.
    pub fn domain_for_kind<S: RecordStore>(
        &mut self,
        graph: &mut Graph,
        store: &mut S,
        kind: EntityKind,
        record: RecordHandle,
        listener: ListenerId,
    ) -> BridgeResult<EntityRef> {
        let actual = store.kind(record)?;
        if actual != kind {
            return Err(BridgeError::KindMismatch {
                expected: kind,
                record,
                actual,
            });
        }
        self.domain_for(graph, store, record, listener)
    }

    /// Copies `fields` from the record of `entity` back into the graph.
    /// Only scalar fields are pulled; entities without a live record are
    /// skipped.
    pub fn pull_fields<S: RecordStore>(
        &self,
        graph: &mut Graph,
        store: &mut S,
        entity: EntityRef,
        fields: impl IntoIterator<Item = Field>,
    ) -> BridgeResult<()> {
        let Some(record) = self.get(entity) else {
            return Ok(());
        };
        if !store.is_live(record) {
            return Ok(());
        }
        for field in fields {
            if entity.kind().shape_of(field) != Some(FieldShape::Scalar) {
                continue;
            }
            let value = scalar_value(store.get(record, field)?)?;
            graph.set_raw(entity, field, value)?;
        }
        Ok(())
    }

    /// Rebuilds `entity` from its record, mirroring relationship differences
    /// onto partners without notification.
    pub fn sync_from_storage<S: RecordStore>(
        &mut self,
        graph: &mut Graph,
        store: &mut S,
        entity: EntityRef,
        listener: ListenerId,
    ) -> BridgeResult<()> {
        let Some(record) = self.get(entity) else {
            return Ok(());
        };
        if !store.is_live(record) {
            return Ok(());
        }
        let kind = entity.kind();
        let mut image = Entity::blank(kind);
        for &field in kind.fields() {
            match kind.shape_of(field) {
                Some(FieldShape::Scalar) => {
                    let value = scalar_value(store.get(record, field)?)?;
                    image.set_scalar(field, value);
                }
                Some(FieldShape::Single) => {
                    let target = match store.get(record, field)? {
                        FieldValue::Ref(target) => {
                            Some(self.domain_for(graph, store, target, listener)?)
                        }
                        _ => None,
                    };
                    if let Some(single) = image.single_mut(field) {
                        *single = LazyRef::from_target(target);
                    }
                }
                Some(FieldShape::Ordered | FieldShape::Set) => {
                    let members = store.get(record, field)?;
                    let mut loaded = Vec::new();
                    for member in members.as_refs().unwrap_or_default().to_vec() {
                        loaded.push(self.domain_for(graph, store, member, listener)?);
                    }
                    if let Some(mut current) = image.members_mut(field) {
                        for member in loaded {
                            current.insert(member);
                        }
                    }
                }
                None => {}
            }
        }
        graph.restore(entity, &image)?;
        Ok(())
    }

    /// Drops every mapping whose record is no longer live and returns the
    /// affected entities.
    pub fn prune<S: RecordStore>(&mut self, store: &S) -> Vec<EntityRef> {
        let dead = self
            .to_storage
            .iter()
            .filter(|(_, record)| !store.is_live(**record))
            .map(|(entity, _)| *entity)
            .collect::<BTreeSet<_>>();
        for entity in &dead {
            self.forget(*entity);
        }
        self.created.retain(|entity| !dead.contains(entity));
        dead.into_iter().collect()
    }

    /// Removes the mapping of `entity` in both directions.
    pub fn forget(&mut self, entity: EntityRef) -> Option<RecordHandle> {
        let record = self.to_storage.remove(&entity)?;
        self.to_domain.remove(&record);
        Some(record)
    }

    fn cache(&mut self, entity: EntityRef, record: RecordHandle) {
        self.to_storage.insert(entity, record);
        self.to_domain.insert(record, entity);
    }
}

/// Identity shape check used by lookups by id.
pub(crate) fn check_identity(kind: EntityKind, id: &EntityId) -> BridgeResult<()> {
    if id.fits(kind) {
        Ok(())
    } else {
        Err(BridgeError::InvalidIdentity {
            kind,
            id: id.clone(),
        })
    }
}

fn scalar_value(value: FieldValue<RecordHandle>) -> BridgeResult<FieldValue> {
    value.scalar_cast().ok_or_else(|| {
        StoreError::InvalidData("reference returned for a scalar field".to_string()).into()
    })
}
