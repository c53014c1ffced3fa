//! SQLite-backed record store.
//!
//! # Responsibility
//! - Keep loaded and pending records in an arena addressed by
//!   [`RecordHandle`].
//! - Write pending records to SQLite atomically on flush.
//! - Answer filtered, ordered and paginated queries.
//!
//! # Invariants
//! - A transaction is opened lazily by the first flush and closed by
//!   `commit` or `rollback`; every flush runs inside a savepoint.
//! - A failed flush leaves both the database and the arena as they were.
//! - Reads of derived fields and queries flush first, so SQL sees every
//!   pending write.
//! - One row maps to at most one record handle.

use super::query::{compile, id_column_of, table_of, Query};
use super::record::{column_of, storage_of, stored_fields, FieldStorage, LinkTable, Record, RecordState};
use super::{RecordHandle, RecordStore, StoreError, StoreResult};
use crate::logging::LogContext;
use crate::model::field::{Field, FieldValue, ValueType};
use crate::model::{EntityId, EntityKind};
use log::{debug, error, info};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

const FLUSH_SAVEPOINT: &str = "store_flush";

/// Row read from the database before its references are resolved.
struct RowImage {
    values: Vec<(Field, FieldValue<RecordHandle>)>,
    refs: Vec<(Field, Option<i64>)>,
}

#[derive(Debug, Default)]
struct FlushStats {
    inserted: usize,
    updated: usize,
    links: usize,
    deleted: usize,
}

/// Record store over one SQLite connection with migrations applied.
pub struct SqliteRecordStore {
    conn: Connection,
    records: Vec<Record>,
    by_id: HashMap<(EntityKind, EntityId), RecordHandle>,
    in_transaction: bool,
    log: LogContext,
}

impl SqliteRecordStore {
    pub fn new(conn: Connection) -> Self {
        Self::with_log(conn, LogContext::new("store"))
    }

    pub fn with_log(conn: Connection, log: LogContext) -> Self {
        Self {
            conn,
            records: Vec::new(),
            by_id: HashMap::new(),
            in_transaction: false,
            log,
        }
    }

    /// Underlying connection, for inspection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Number of records with writes not yet flushed.
    pub fn pending_writes(&self) -> usize {
        self.records.iter().filter(|record| record.needs_flush()).count()
    }

    fn record(&self, handle: RecordHandle) -> StoreResult<&Record> {
        self.records
            .get(handle.index())
            .ok_or(StoreError::UnknownRecord(handle))
    }

    fn record_mut(&mut self, handle: RecordHandle) -> StoreResult<&mut Record> {
        self.records
            .get_mut(handle.index())
            .ok_or(StoreError::UnknownRecord(handle))
    }

    fn live_record_mut(&mut self, handle: RecordHandle) -> StoreResult<&mut Record> {
        let record = self.record_mut(handle)?;
        if !record.is_live() {
            return Err(StoreError::DiscardedRecord(handle));
        }
        Ok(record)
    }

    fn push_record(&mut self, record: Record) -> RecordHandle {
        let handle = RecordHandle::new(self.records.len());
        self.records.push(record);
        handle
    }

    fn row_id(&self, handle: RecordHandle) -> StoreResult<i64> {
        self.record(handle)?
            .id
            .as_ref()
            .and_then(EntityId::as_int)
            .ok_or_else(|| StoreError::InvalidData(format!("{handle} has no row id")))
    }

    fn begin_if_needed(&mut self) -> StoreResult<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Checks that `member` is a live record of the kind `field` links to.
    fn check_member(
        &self,
        kind: EntityKind,
        field: Field,
        member: RecordHandle,
    ) -> StoreResult<()> {
        let relation = kind
            .relation_of(field)
            .ok_or(StoreError::UnknownField { kind, field })?;
        let record = self.record(member)?;
        if !record.is_live() {
            return Err(StoreError::DiscardedRecord(member));
        }
        if record.kind != relation.target {
            return Err(StoreError::InvalidData(format!(
                "{member} is a {} record, expected {}",
                record.kind, relation.target
            )));
        }
        Ok(())
    }

    fn read_row(&self, kind: EntityKind, id: &EntityId) -> StoreResult<Option<RowImage>> {
        let fields = stored_fields(kind);
        let columns = fields
            .iter()
            .filter_map(|field| column_of(kind, *field))
            .collect::<Vec<_>>();
        let select = if columns.is_empty() {
            id_column_of(kind).to_string()
        } else {
            columns.join(", ")
        };
        let sql = format!(
            "SELECT {select} FROM {} WHERE {} = ?1",
            table_of(kind),
            id_column_of(kind)
        );

        let raw = self
            .conn
            .query_row(&sql, [id_value(id)], |row| {
                (0..fields.len())
                    .map(|index| row.get::<_, Value>(index))
                    .collect::<Result<Vec<_>, _>>()
            })
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut image = RowImage {
            values: Vec::new(),
            refs: Vec::new(),
        };
        for (field, value) in fields.into_iter().zip(raw) {
            match storage_of(kind, field) {
                Some(FieldStorage::OwnedRef(_)) => match value {
                    Value::Null => image.refs.push((field, None)),
                    Value::Integer(target) => image.refs.push((field, Some(target))),
                    other => {
                        return Err(StoreError::InvalidData(format!(
                            "{kind} {} holds {other:?}",
                            field.name()
                        )))
                    }
                },
                _ => image.values.push((field, decode(kind, field, value)?)),
            }
        }
        Ok(Some(image))
    }

    /// Loads a row into a new record. The handle is cached before references
    /// are resolved, so reference cycles terminate.
    fn load(&mut self, kind: EntityKind, id: &EntityId) -> StoreResult<Option<RecordHandle>> {
        let Some(image) = self.read_row(kind, id)? else {
            return Ok(None);
        };
        let handle = self.push_record(Record::loaded(kind, id.clone()));
        self.by_id.insert((kind, id.clone()), handle);
        self.apply_image(handle, image)?;
        Ok(Some(handle))
    }

    fn apply_image(&mut self, handle: RecordHandle, image: RowImage) -> StoreResult<()> {
        let kind = self.record(handle)?.kind;
        let mut values = image.values;
        for (field, target) in image.refs {
            let resolved = match (target, kind.relation_of(field)) {
                (Some(target), Some(relation)) => self
                    .find(relation.target, &EntityId::Int(target))?
                    .map_or(FieldValue::Null, FieldValue::Ref),
                _ => FieldValue::Null,
            };
            values.push((field, resolved));
        }
        let record = self.record_mut(handle)?;
        record.values.extend(values);
        Ok(())
    }

    fn ensure_links(&mut self, handle: RecordHandle, field: Field, table: LinkTable) -> StoreResult<()> {
        let record = self.record(handle)?;
        if record.links.contains_key(&field) {
            return Ok(());
        }
        let owner = match (record.state, record.id.as_ref().and_then(EntityId::as_int)) {
            (RecordState::New, _) | (_, None) => None,
            (_, Some(owner)) => Some(owner),
        };
        let target_kind = record
            .kind
            .relation_of(field)
            .map(|relation| relation.target)
            .ok_or(StoreError::UnknownField {
                kind: record.kind,
                field,
            })?;

        let mut members = BTreeSet::new();
        if let Some(owner) = owner {
            let ids = self.select_ids(
                &format!(
                    "SELECT {} FROM {} WHERE {} = ?1 ORDER BY {}",
                    table.member_column, table.table, table.owner_column, table.member_column
                ),
                owner,
            )?;
            for id in ids {
                if let Some(member) = self.find(target_kind, &EntityId::Int(id))? {
                    members.insert(member);
                }
            }
        }
        self.record_mut(handle)?.links.insert(field, members);
        Ok(())
    }

    fn select_ids(&self, sql: &str, bind: i64) -> StoreResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([bind], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Records whose owning side points at `handle`, read through SQL.
    fn derived_members(
        &mut self,
        handle: RecordHandle,
        target_kind: EntityKind,
        sql: String,
    ) -> StoreResult<FieldValue<RecordHandle>> {
        self.flush()?;
        let record = self.record(handle)?;
        let Some(id) = record.id.as_ref().and_then(EntityId::as_int) else {
            return Ok(FieldValue::Refs(Vec::new()));
        };
        if !record.is_live() {
            return Ok(FieldValue::Refs(Vec::new()));
        }
        let mut members = Vec::new();
        for member_id in self.select_ids(&sql, id)? {
            if let Some(member) = self.find(target_kind, &EntityId::Int(member_id))? {
                members.push(member);
            }
        }
        Ok(FieldValue::Refs(members))
    }

    fn encode(&self, value: &FieldValue<RecordHandle>) -> StoreResult<Value> {
        let encoded = match value {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(value) => Value::Integer(i64::from(*value)),
            FieldValue::Int(value) => Value::Integer(*value),
            FieldValue::Float(value) => Value::Real(*value),
            FieldValue::Text(value) => Value::Text(value.clone()),
            FieldValue::Ref(target) => Value::Integer(self.row_id(*target)?),
            FieldValue::Refs(_) => {
                return Err(StoreError::InvalidData(
                    "collections cannot be stored in a column".to_string(),
                ))
            }
        };
        Ok(encoded)
    }

    fn write_pending(&mut self, inserted: &mut Vec<(RecordHandle, bool)>) -> StoreResult<FlushStats> {
        let mut stats = FlushStats::default();

        for index in 0..self.records.len() {
            let handle = RecordHandle::new(index);
            let record = &self.records[index];
            if record.state != RecordState::New {
                continue;
            }
            let kind = record.kind;
            let assigned_id = record.id.clone();
            if assigned_id.is_none() && kind.is_keyed() {
                return Err(StoreError::InvalidData(format!("{kind} {handle} has no key")));
            }

            // References are written by the update pass, once every row exists.
            let mut columns = Vec::new();
            let mut binds = Vec::new();
            if let Some(id) = &assigned_id {
                columns.push(id_column_of(kind));
                binds.push(id_value(id));
            }
            for (field, value) in &record.values {
                if let Some(FieldStorage::Column(column)) = storage_of(kind, *field) {
                    columns.push(column);
                    binds.push(self.encode(value)?);
                }
            }
            let sql = if columns.is_empty() {
                format!("INSERT INTO {} DEFAULT VALUES", table_of(kind))
            } else {
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table_of(kind),
                    columns.join(", "),
                    vec!["?"; columns.len()].join(", ")
                )
            };
            self.conn.execute(&sql, params_from_iter(binds))?;
            if assigned_id.is_none() {
                let row_id = self.conn.last_insert_rowid();
                self.records[index].id = Some(EntityId::Int(row_id));
            }
            inserted.push((handle, assigned_id.is_some()));
            stats.inserted += 1;
        }

        let inserted_handles: BTreeSet<RecordHandle> =
            inserted.iter().map(|(handle, _)| *handle).collect();
        for index in 0..self.records.len() {
            let handle = RecordHandle::new(index);
            let record = &self.records[index];
            let is_new = inserted_handles.contains(&handle);
            if !(is_new || (record.state == RecordState::Persistent && record.dirty)) {
                continue;
            }
            let kind = record.kind;
            let mut assignments = Vec::new();
            let mut binds = Vec::new();
            for (field, value) in &record.values {
                if let Some(column) = column_of(kind, *field) {
                    assignments.push(format!("{column} = ?"));
                    binds.push(self.encode(value)?);
                }
            }
            if assignments.is_empty() {
                continue;
            }
            let id = record
                .id
                .as_ref()
                .ok_or_else(|| StoreError::InvalidData(format!("{handle} has no identity")))?;
            binds.push(id_value(id));
            self.conn.execute(
                &format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    table_of(kind),
                    assignments.join(", "),
                    id_column_of(kind)
                ),
                params_from_iter(binds),
            )?;
            stats.updated += 1;
        }

        for index in 0..self.records.len() {
            let record = &self.records[index];
            if !record.is_live() || record.dirty_links.is_empty() {
                continue;
            }
            let owner = self.row_id(RecordHandle::new(index))?;
            for field in record.dirty_links.iter() {
                let Some(FieldStorage::OwnedLinks(table)) = storage_of(record.kind, *field) else {
                    continue;
                };
                self.conn.execute(
                    &format!("DELETE FROM {} WHERE {} = ?1", table.table, table.owner_column),
                    [owner],
                )?;
                let members = record.links.get(field).cloned().unwrap_or_default();
                for member in members {
                    if !self.record(member)?.is_live() {
                        continue;
                    }
                    self.conn.execute(
                        &format!(
                            "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
                            table.table, table.owner_column, table.member_column
                        ),
                        [owner, self.row_id(member)?],
                    )?;
                    stats.links += 1;
                }
            }
        }

        for record in self.records.iter() {
            if record.state != RecordState::Deleted || !record.pending_delete {
                continue;
            }
            if let Some(id) = &record.id {
                self.conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE {} = ?1",
                        table_of(record.kind),
                        id_column_of(record.kind)
                    ),
                    [id_value(id)],
                )?;
                stats.deleted += 1;
            }
        }

        Ok(stats)
    }

    fn finish_flush(&mut self, inserted: &[(RecordHandle, bool)]) {
        for (handle, _) in inserted {
            let index = handle.index();
            let record = &mut self.records[index];
            record.state = RecordState::Persistent;
            if let Some(id) = record.id.clone() {
                self.by_id.insert((record.kind, id), *handle);
            }
        }
        for record in self.records.iter_mut() {
            record.dirty = false;
            record.dirty_links.clear();
            record.pending_delete = false;
        }
    }

    fn revert_flush(&mut self, inserted: &[(RecordHandle, bool)]) {
        if let Err(err) = self.conn.execute_batch(&format!(
            "ROLLBACK TO {FLUSH_SAVEPOINT}; RELEASE {FLUSH_SAVEPOINT};"
        )) {
            error!(
                "event=store_flush {} status=error error_code=savepoint_rollback_failed error={err}",
                self.log
            );
        }
        for (handle, caller_assigned) in inserted {
            if !caller_assigned {
                self.records[handle.index()].id = None;
            }
        }
    }
}

impl RecordStore for SqliteRecordStore {
    fn create(&mut self, kind: EntityKind) -> StoreResult<RecordHandle> {
        Ok(self.push_record(Record::new(kind)))
    }

    fn find(&mut self, kind: EntityKind, id: &EntityId) -> StoreResult<Option<RecordHandle>> {
        if !id.fits(kind) {
            return Ok(None);
        }
        if let Some(handle) = self.by_id.get(&(kind, id.clone())).copied() {
            let state = self.record(handle)?.state;
            return Ok((state == RecordState::Persistent).then_some(handle));
        }
        self.load(kind, id)
    }

    fn kind(&self, handle: RecordHandle) -> StoreResult<EntityKind> {
        Ok(self.record(handle)?.kind)
    }

    fn is_live(&self, handle: RecordHandle) -> bool {
        self.record(handle).is_ok_and(Record::is_live)
    }

    fn get(&mut self, handle: RecordHandle, field: Field) -> StoreResult<FieldValue<RecordHandle>> {
        let record = self.record(handle)?;
        if record.state == RecordState::Discarded {
            return Err(StoreError::DiscardedRecord(handle));
        }
        let kind = record.kind;
        let storage = storage_of(kind, field).ok_or(StoreError::UnknownField { kind, field })?;
        match storage {
            FieldStorage::Identity => Ok(match &record.id {
                Some(EntityId::Int(id)) => FieldValue::Int(*id),
                Some(EntityId::Key(key)) => FieldValue::Text(key.clone()),
                None => FieldValue::Null,
            }),
            FieldStorage::Column(_) | FieldStorage::OwnedRef(_) => {
                Ok(record.values.get(&field).cloned().unwrap_or(FieldValue::Null))
            }
            FieldStorage::DerivedKey { single } => match record.values.get(&single) {
                Some(FieldValue::Ref(target)) => Ok(self
                    .record(*target)?
                    .id
                    .as_ref()
                    .and_then(EntityId::as_int)
                    .map_or(FieldValue::Null, FieldValue::Int)),
                _ => Ok(FieldValue::Null),
            },
            FieldStorage::OwnedLinks(table) => {
                self.ensure_links(handle, field, table)?;
                let members = self
                    .record(handle)?
                    .links
                    .get(&field)
                    .map(|members| members.iter().copied().collect())
                    .unwrap_or_default();
                Ok(FieldValue::Refs(members))
            }
            FieldStorage::InverseLinks { table, .. } => {
                let target = kind.relation_of(field).map(|relation| relation.target);
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?1 ORDER BY {}",
                    table.owner_column, table.table, table.member_column, table.owner_column
                );
                self.derived_members(handle, target.unwrap_or(kind), sql)
            }
            FieldStorage::InverseRefs { table, column, .. } => {
                let target = kind.relation_of(field).map(|relation| relation.target);
                let sql = format!("SELECT id FROM {table} WHERE {column} = ?1 ORDER BY id");
                self.derived_members(handle, target.unwrap_or(kind), sql)
            }
        }
    }

    fn set(
        &mut self,
        handle: RecordHandle,
        field: Field,
        value: FieldValue<RecordHandle>,
    ) -> StoreResult<()> {
        let kind = self.live_record_mut(handle)?.kind;
        let storage = storage_of(kind, field).ok_or(StoreError::UnknownField { kind, field })?;
        match storage {
            FieldStorage::Identity => {
                let wanted = match (&value, kind.is_keyed()) {
                    (FieldValue::Null, _) => None,
                    (FieldValue::Int(id), false) => Some(EntityId::Int(*id)),
                    (FieldValue::Text(key), true) => Some(EntityId::Key(key.clone())),
                    _ => return Err(StoreError::InvalidData(format!("bad identity for {kind}"))),
                };
                let record = self.live_record_mut(handle)?;
                if record.id == wanted {
                    return Ok(());
                }
                if record.state != RecordState::New {
                    return Err(StoreError::ReadOnlyField { kind, field });
                }
                record.id = wanted;
                Ok(())
            }
            FieldStorage::Column(_) => {
                let fits = kind
                    .value_type_of(field)
                    .is_some_and(|value_type| value.fits(value_type));
                if !fits {
                    return Err(StoreError::InvalidData(format!(
                        "value {value:?} does not fit {kind} {}",
                        field.name()
                    )));
                }
                let record = self.live_record_mut(handle)?;
                if record.values.get(&field) != Some(&value) {
                    record.values.insert(field, value);
                    record.dirty = true;
                }
                Ok(())
            }
            FieldStorage::OwnedRef(_) => {
                match value {
                    FieldValue::Null => {}
                    FieldValue::Ref(target) => self.check_member(kind, field, target)?,
                    other => {
                        return Err(StoreError::InvalidData(format!(
                            "{kind} {} cannot hold {other:?}",
                            field.name()
                        )))
                    }
                }
                let record = self.live_record_mut(handle)?;
                if record.values.get(&field) != Some(&value) {
                    record.values.insert(field, value);
                    record.dirty = true;
                }
                Ok(())
            }
            FieldStorage::DerivedKey { .. }
            | FieldStorage::OwnedLinks(_)
            | FieldStorage::InverseLinks { .. }
            | FieldStorage::InverseRefs { .. } => Err(StoreError::ReadOnlyField { kind, field }),
        }
    }

    fn link(&mut self, handle: RecordHandle, field: Field, member: RecordHandle) -> StoreResult<()> {
        let kind = self.live_record_mut(handle)?.kind;
        self.check_member(kind, field, member)?;
        match storage_of(kind, field) {
            Some(FieldStorage::OwnedLinks(table)) => {
                self.ensure_links(handle, field, table)?;
                let record = self.live_record_mut(handle)?;
                let inserted = record
                    .links
                    .get_mut(&field)
                    .is_some_and(|members| members.insert(member));
                if inserted {
                    record.dirty_links.insert(field);
                }
                Ok(())
            }
            Some(FieldStorage::InverseLinks { owner_field, .. }) => {
                self.link(member, owner_field, handle)
            }
            Some(FieldStorage::InverseRefs { owner_field, .. }) => {
                self.set(member, owner_field, FieldValue::Ref(handle))
            }
            _ => Err(StoreError::UnknownField { kind, field }),
        }
    }

    fn unlink(
        &mut self,
        handle: RecordHandle,
        field: Field,
        member: RecordHandle,
    ) -> StoreResult<()> {
        let kind = self.live_record_mut(handle)?.kind;
        if !self.is_live(member) {
            return Ok(());
        }
        match storage_of(kind, field) {
            Some(FieldStorage::OwnedLinks(table)) => {
                self.ensure_links(handle, field, table)?;
                let record = self.live_record_mut(handle)?;
                let removed = record
                    .links
                    .get_mut(&field)
                    .is_some_and(|members| members.remove(&member));
                if removed {
                    record.dirty_links.insert(field);
                }
                Ok(())
            }
            Some(FieldStorage::InverseLinks { owner_field, .. }) => {
                self.unlink(member, owner_field, handle)
            }
            Some(FieldStorage::InverseRefs { owner_field, .. }) => {
                let owned = self.record(member)?.values.get(&owner_field).cloned();
                if owned == Some(FieldValue::Ref(handle)) {
                    self.set(member, owner_field, FieldValue::Null)?;
                }
                Ok(())
            }
            _ => Err(StoreError::UnknownField { kind, field }),
        }
    }

    fn delete(&mut self, handle: RecordHandle) -> StoreResult<()> {
        let record = self.record_mut(handle)?;
        match record.state {
            RecordState::Deleted => return Ok(()),
            RecordState::Discarded => return Err(StoreError::DiscardedRecord(handle)),
            RecordState::New => record.state = RecordState::Discarded,
            RecordState::Persistent => {
                record.state = RecordState::Deleted;
                record.pending_delete = true;
            }
        }
        let kind = record.kind;
        for other in self.records.iter_mut().filter(|other| other.is_live()) {
            other.forget_target(handle);
        }
        debug!("event=store_delete {} kind={kind} record={handle}", self.log);
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        if !self.records.iter().any(Record::needs_flush) {
            return Ok(());
        }
        let started_at = Instant::now();
        self.begin_if_needed()?;
        self.conn
            .execute_batch(&format!("SAVEPOINT {FLUSH_SAVEPOINT};"))?;

        let mut inserted = Vec::new();
        let outcome = self.write_pending(&mut inserted).and_then(|stats| {
            self.conn
                .execute_batch(&format!("RELEASE {FLUSH_SAVEPOINT};"))?;
            Ok(stats)
        });
        match outcome {
            Ok(stats) => {
                self.finish_flush(&inserted);
                info!(
                    "event=store_flush {} status=ok inserted={} updated={} links={} deleted={} duration_ms={}",
                    self.log,
                    stats.inserted,
                    stats.updated,
                    stats.links,
                    stats.deleted,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                self.revert_flush(&inserted);
                error!(
                    "event=store_flush {} status=error duration_ms={} error={err}",
                    self.log,
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    fn commit(&mut self) -> StoreResult<()> {
        let started_at = Instant::now();
        self.flush()?;
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        for record in self.records.iter_mut() {
            match record.state {
                RecordState::Persistent => record.durable = true,
                RecordState::Deleted => {
                    record.state = RecordState::Discarded;
                    record.durable = false;
                }
                RecordState::New | RecordState::Discarded => record.durable = false,
            }
        }
        info!(
            "event=store_commit {} status=ok duration_ms={}",
            self.log,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let started_at = Instant::now();
        let untouched = self
            .records
            .iter()
            .all(|record| record.durable || record.state == RecordState::Discarded);
        if !self.in_transaction && untouched && self.pending_writes() == 0 {
            debug!("event=store_rollback {} status=skipped", self.log);
            return Ok(());
        }
        if self.in_transaction {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_transaction = false;
        }

        self.by_id.clear();
        let known = self.records.len();
        for index in 0..known {
            let record = &mut self.records[index];
            match (record.durable, record.id.clone()) {
                (true, Some(id)) => {
                    record.state = RecordState::Persistent;
                    self.by_id.insert((record.kind, id), RecordHandle::new(index));
                }
                _ => {
                    record.state = RecordState::Discarded;
                    record.durable = false;
                }
            }
        }

        let mut reloaded = 0usize;
        let mut discarded = 0usize;
        for index in 0..known {
            let (kind, id) = match &self.records[index] {
                Record {
                    durable: true,
                    kind,
                    id: Some(id),
                    ..
                } => (*kind, id.clone()),
                _ => continue,
            };
            match self.read_row(kind, &id)? {
                Some(image) => {
                    let record = &mut self.records[index];
                    *record = Record::loaded(kind, id);
                    self.apply_image(RecordHandle::new(index), image)?;
                    reloaded += 1;
                }
                None => {
                    let record = &mut self.records[index];
                    record.state = RecordState::Discarded;
                    record.durable = false;
                    self.by_id.remove(&(kind, id));
                    discarded += 1;
                }
            }
        }

        info!(
            "event=store_rollback {} status=ok reloaded={reloaded} discarded={discarded} duration_ms={}",
            self.log,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn query(
        &mut self,
        kind: EntityKind,
        query: &Query<RecordHandle>,
    ) -> StoreResult<Vec<RecordHandle>> {
        self.flush()?;
        let clauses = compile(kind, query, |handle| self.row_id(*handle))?;
        let sql = format!(
            "SELECT {} FROM {}{}{} LIMIT ? OFFSET ?",
            id_column_of(kind),
            table_of(kind),
            clauses.where_sql,
            clauses.order_sql
        );
        let mut binds = clauses.binds;
        binds.push(Value::Integer(query.limit.map_or(-1, i64::from)));
        binds.push(Value::Integer(i64::from(query.offset)));

        let ids = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(binds), |row| row.get::<_, Value>(0))?;
            let mut ids = Vec::new();
            for id in rows {
                ids.push(entity_id(id?)?);
            }
            ids
        };

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.find(kind, &id)? {
                handles.push(handle);
            }
        }
        debug!(
            "event=query {} kind={kind} filters={} results={}",
            self.log,
            query.filters.len(),
            handles.len()
        );
        Ok(handles)
    }

    fn count(&mut self, kind: EntityKind, query: &Query<RecordHandle>) -> StoreResult<u64> {
        self.flush()?;
        let clauses = compile(kind, query, |handle| self.row_id(*handle))?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            table_of(kind),
            clauses.where_sql
        );
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(clauses.binds), |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn id_value(id: &EntityId) -> Value {
    match id {
        EntityId::Int(id) => Value::Integer(*id),
        EntityId::Key(key) => Value::Text(key.clone()),
    }
}

fn entity_id(value: Value) -> StoreResult<EntityId> {
    match value {
        Value::Integer(id) => Ok(EntityId::Int(id)),
        Value::Text(key) => Ok(EntityId::Key(key)),
        other => Err(StoreError::InvalidData(format!(
            "unexpected identity value {other:?}"
        ))),
    }
}

fn decode(kind: EntityKind, field: Field, value: Value) -> StoreResult<FieldValue<RecordHandle>> {
    let decoded = match (kind.value_type_of(field), value) {
        (Some(ValueType::Bool), Value::Integer(value)) => FieldValue::Bool(value != 0),
        (Some(ValueType::Int | ValueType::OptionalInt), Value::Integer(value)) => {
            FieldValue::Int(value)
        }
        (Some(ValueType::OptionalFloat), Value::Real(value)) => FieldValue::Float(value),
        (Some(ValueType::OptionalFloat), Value::Integer(value)) => FieldValue::Float(value as f64),
        (Some(ValueType::Text | ValueType::OptionalText), Value::Text(value)) => {
            FieldValue::Text(value)
        }
        (
            Some(ValueType::OptionalInt | ValueType::OptionalFloat | ValueType::OptionalText),
            Value::Null,
        ) => FieldValue::Null,
        (_, other) => {
            return Err(StoreError::InvalidData(format!(
                "{kind} {} holds {other:?}",
                field.name()
            )))
        }
    };
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::SqliteRecordStore;
    use crate::db::open_db_in_memory;
    use crate::model::field::{Field, FieldValue};
    use crate::model::{EntityId, EntityKind};
    use crate::store::{Filter, Query, RecordStore, StoreError};

    fn store() -> SqliteRecordStore {
        SqliteRecordStore::new(open_db_in_memory().unwrap())
    }

    #[test]
    fn flush_assigns_ids_and_derives_inverse_collections() {
        let mut store = store();
        let parent = store.create(EntityKind::Task).unwrap();
        let child = store.create(EntityKind::Task).unwrap();
        store.link(parent, Field::Children, child).unwrap();

        assert_eq!(store.get(child, Field::ParentId).unwrap(), FieldValue::Null);
        assert_eq!(
            store.get(parent, Field::Children).unwrap(),
            FieldValue::Refs(vec![child])
        );
        let parent_id = store.get(parent, Field::Id).unwrap().as_int().unwrap();
        assert_eq!(
            store.get(child, Field::ParentId).unwrap(),
            FieldValue::Int(parent_id)
        );
    }

    #[test]
    fn rollback_discards_uncommitted_records() {
        let mut store = store();
        let tag = store.create(EntityKind::Tag).unwrap();
        store.set(tag, Field::Value, "kept".into()).unwrap();
        store.commit().unwrap();

        store.set(tag, Field::Value, "changed".into()).unwrap();
        let fresh = store.create(EntityKind::Tag).unwrap();
        store.flush().unwrap();
        store.rollback().unwrap();

        assert!(!store.is_live(fresh));
        assert_eq!(
            store.get(tag, Field::Value).unwrap(),
            FieldValue::Text("kept".to_string())
        );
    }

    #[test]
    fn find_returns_the_same_handle_and_skips_deleted_rows() {
        let mut store = store();
        let user = store.create(EntityKind::User).unwrap();
        store.set(user, Field::Email, "a@example.com".into()).unwrap();
        store.commit().unwrap();
        let id = EntityId::Int(store.get(user, Field::Id).unwrap().as_int().unwrap());

        assert_eq!(store.find(EntityKind::User, &id).unwrap(), Some(user));
        store.delete(user).unwrap();
        assert_eq!(store.find(EntityKind::User, &id).unwrap(), None);
    }

    #[test]
    fn duplicate_identity_fails_flush_without_partial_writes() {
        let mut store = store();
        let first = store.create(EntityKind::Tag).unwrap();
        let second = store.create(EntityKind::Tag).unwrap();
        store.set(first, Field::Id, FieldValue::Int(7)).unwrap();
        store.set(second, Field::Id, FieldValue::Int(7)).unwrap();

        let error = store.flush().unwrap_err();
        assert!(error.is_constraint_violation());
        let count = store
            .count(EntityKind::Tag, &Query::new())
            .unwrap_err();
        assert!(matches!(count, StoreError::Db(_)));
    }

    #[test]
    fn query_filters_by_link_membership() {
        let mut store = store();
        let tag = store.create(EntityKind::Tag).unwrap();
        let tagged = store.create(EntityKind::Task).unwrap();
        let _plain = store.create(EntityKind::Task).unwrap();
        store.link(tag, Field::Tasks, tagged).unwrap();

        let hits = store
            .query(EntityKind::Task, &Query::new().filter(Filter::HasTag(tag)))
            .unwrap();
        assert_eq!(hits, vec![tagged]);
    }
}
