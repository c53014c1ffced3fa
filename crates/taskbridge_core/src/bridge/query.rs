//! Query façade: domain-level lookups translated into record store queries.
//!
//! # Invariants
//! - Results go through the identity map, so one row always yields the same
//!   entity handle within a session.
//! - A filter referring to an entity the store does not know matches
//!   nothing.

use super::error::{BridgeError, BridgeResult};
use super::identity_map::check_identity;
use super::session::Session;
use crate::model::{EntityId, EntityKind, EntityRef};
use crate::store::{Query, RecordHandle, RecordStore};
use log::debug;
use serde::Serialize;

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paged {
    pub items: Vec<EntityRef>,
    /// Matches across all pages.
    pub total: u64,
    /// 1-based page number actually served.
    pub page: u32,
    pub per_page: u32,
    pub num_pages: u32,
}

impl<S: RecordStore> Session<S> {
    /// Entity with identity `id`, loading it from storage when needed.
    ///
    /// # Errors
    /// - [`BridgeError::InvalidIdentity`] when `id` has the wrong shape for
    ///   `kind`.
    pub fn get_by_id(
        &mut self,
        kind: EntityKind,
        id: impl Into<EntityId>,
    ) -> BridgeResult<Option<EntityRef>> {
        let id = id.into();
        check_identity(kind, &id)?;
        let Some(record) = self.store.find(kind, &id)? else {
            return Ok(None);
        };
        let entity = self.identity.domain_for_kind(
            &mut self.graph,
            &mut self.store,
            kind,
            record,
            self.listener,
        )?;
        Ok(Some(entity))
    }

    /// Entities of `kind` matching `query`, in query order.
    pub fn find(&mut self, kind: EntityKind, query: &Query<EntityRef>) -> BridgeResult<Vec<EntityRef>> {
        let Some(query) = self.translate(query)? else {
            debug!(
                "event=query {} kind={kind} status=empty reason=unknown_reference",
                self.log
            );
            return Ok(Vec::new());
        };
        let records = self.store.query(kind, &query)?;
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            entities.push(self.identity.domain_for_kind(
                &mut self.graph,
                &mut self.store,
                kind,
                record,
                self.listener,
            )?);
        }
        Ok(entities)
    }

    /// Number of entities matching `query`, ignoring limit and offset.
    pub fn count(&mut self, kind: EntityKind, query: &Query<EntityRef>) -> BridgeResult<u64> {
        match self.translate(query)? {
            Some(query) => Ok(self.store.count(kind, &query)?),
            None => Ok(0),
        }
    }

    /// One page of `query` results. `page` is 1-based (0 is treated as 1);
    /// `per_page` is normalized by the session config. The query's own limit
    /// and offset are replaced.
    pub fn paginate(
        &mut self,
        kind: EntityKind,
        query: &Query<EntityRef>,
        page: u32,
        per_page: u32,
    ) -> BridgeResult<Paged> {
        let per_page = self.config.page_size(per_page);
        let page = page.max(1);
        let total = self.count(kind, query)?;
        let num_pages = u32::try_from(total.div_ceil(u64::from(per_page))).unwrap_or(u32::MAX);

        let mut window = query.clone();
        window.limit = Some(per_page);
        window.offset = (page - 1).saturating_mul(per_page);
        let items = self.find(kind, &window)?;
        Ok(Paged {
            items,
            total,
            page,
            per_page,
            num_pages,
        })
    }

    /// Translates entity references in `query` into records. `None` when one
    /// of them has no record.
    fn translate(&mut self, query: &Query<EntityRef>) -> BridgeResult<Option<Query<RecordHandle>>> {
        let mut failure: Option<BridgeError> = None;
        let graph = &self.graph;
        let identity = &mut self.identity;
        let store = &mut self.store;
        let translated = query.map_refs(|entity| {
            match identity.find_storage(graph, store, *entity) {
                Ok(record) => record,
                Err(err) => {
                    failure.get_or_insert(err);
                    None
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(translated),
        }
    }
}
