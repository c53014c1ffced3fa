//! Change notification protocol between the entity graph and its observer.
//!
//! # Responsibility
//! - Define the observer interface invoked by graph mutators.
//! - Validate that an operation is legal for a field before it is applied.
//!
//! # Invariants
//! - `field_changing` fires before the first byte of an entity changes; it
//!   may fire for both sides of a mirrored link.
//! - `field_changed` fires exactly once per logical mutation, on the side the
//!   caller mutated.
//! - Scalars and single references only use [`Operation::Set`]; collections
//!   only use [`Operation::Add`] and [`Operation::Remove`].

use crate::model::field::{Field, FieldShape, FieldValue};
use crate::model::graph::{Graph, GraphError, GraphResult};
use crate::model::{EntityKind, EntityRef};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Identity of one registered listener.
///
/// Entities store the id instead of the listener itself, so a listener can be
/// built on demand from borrowed session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation reported by `field_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Set,
    Add,
    Remove,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied mutation.
///
/// For `Set`, `value` is the new field value. For `Add`/`Remove` it is the
/// member as `FieldValue::Ref`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub entity: EntityRef,
    pub field: Field,
    pub operation: Operation,
    pub value: FieldValue,
}

/// Observer of graph mutations.
///
/// Graph mutators only call a listener for entities registered under that
/// listener's id. Errors returned from a hook abort the mutation call and are
/// handed back to the caller unchanged.
pub trait ChangeListener {
    type Error: From<GraphError>;

    /// Id this listener is registered under; `None` never matches.
    fn listener_id(&self) -> Option<ListenerId>;

    /// Called before `field` of `entity` changes. `graph` still shows the old
    /// value.
    fn field_changing(
        &mut self,
        graph: &Graph,
        entity: EntityRef,
        field: Field,
    ) -> Result<(), Self::Error>;

    /// Called after a mutation has been applied to both sides.
    fn field_changed(&mut self, graph: &Graph, change: &FieldChange) -> Result<(), Self::Error>;
}

/// Listener that observes nothing. Used for untracked edits such as restoring
/// snapshots and populating entities loaded from storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ChangeListener for NoopListener {
    type Error = GraphError;

    fn listener_id(&self) -> Option<ListenerId> {
        None
    }

    fn field_changing(&mut self, _: &Graph, _: EntityRef, _: Field) -> GraphResult<()> {
        Ok(())
    }

    fn field_changed(&mut self, _: &Graph, _: &FieldChange) -> GraphResult<()> {
        Ok(())
    }
}

/// Checks that `operation` is legal on `field` of `kind` and returns the
/// field shape.
///
/// # Errors
/// - [`GraphError::UnknownField`] when `kind` has no such field.
/// - [`GraphError::InvalidOperation`] for `Set` on a collection or
///   `Add`/`Remove` on a scalar or single reference.
pub fn validate_change(
    kind: EntityKind,
    field: Field,
    operation: Operation,
) -> GraphResult<FieldShape> {
    let shape = kind
        .shape_of(field)
        .ok_or(GraphError::UnknownField { kind, field })?;
    let allowed = match operation {
        Operation::Set => !shape.is_collection(),
        Operation::Add | Operation::Remove => shape.is_collection(),
    };
    if !allowed {
        return Err(GraphError::InvalidOperation { field, operation });
    }
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::{validate_change, Operation};
    use crate::model::field::{Field, FieldShape};
    use crate::model::graph::GraphError;
    use crate::model::EntityKind;

    #[test]
    fn collections_reject_set() {
        let error = validate_change(EntityKind::Task, Field::Tags, Operation::Set).unwrap_err();
        assert!(matches!(
            error,
            GraphError::InvalidOperation {
                field: Field::Tags,
                operation: Operation::Set
            }
        ));
    }

    #[test]
    fn scalars_and_singles_reject_add_and_remove() {
        for field in [Field::Summary, Field::Parent] {
            for operation in [Operation::Add, Operation::Remove] {
                assert!(validate_change(EntityKind::Task, field, operation).is_err());
            }
        }
        assert_eq!(
            validate_change(EntityKind::Note, Field::Task, Operation::Set).unwrap(),
            FieldShape::Single
        );
    }

    #[test]
    fn unknown_field_is_reported() {
        let error = validate_change(EntityKind::Tag, Field::Email, Operation::Set).unwrap_err();
        assert!(matches!(error, GraphError::UnknownField { .. }));
    }
}
