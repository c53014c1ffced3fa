//! Error type of the bridge layer.

use crate::model::graph::GraphError;
use crate::model::{EntityId, EntityKind, EntityRef};
use crate::store::{RecordHandle, StoreError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge-layer error.
#[derive(Debug)]
pub enum BridgeError {
    /// Illegal graph access or mutation.
    Graph(GraphError),
    /// Storage failure, including identity conflicts at commit.
    Store(StoreError),
    /// `add`, a write or a new link on an entity that is pending deletion.
    PendingDeletion(EntityRef),
    /// `delete` on an entity that is pending addition.
    PendingAddition(EntityRef),
    /// `delete` on an entity with no identity and no storage record.
    UntrackedDelete(EntityRef),
    /// Identity shape does not fit the entity kind.
    InvalidIdentity { kind: EntityKind, id: EntityId },
    /// Identity is already mapped to another entity.
    IdentityInUse { kind: EntityKind, id: EntityId },
    /// Record kind differs from the requested entity kind.
    KindMismatch {
        expected: EntityKind,
        record: RecordHandle,
        actual: EntityKind,
    },
    /// File logging could not be initialized.
    Logging(String),
}

impl BridgeError {
    /// Whether the store rejected a write on a constraint, such as two
    /// entities sharing one identity.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_constraint_violation())
    }
}

impl Display for BridgeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::PendingDeletion(entity) => {
                write!(f, "{entity} is pending deletion")
            }
            Self::PendingAddition(entity) => {
                write!(f, "{entity} is pending addition and cannot be deleted")
            }
            Self::UntrackedDelete(entity) => {
                write!(f, "{entity} has no identity and no storage record")
            }
            Self::InvalidIdentity { kind, id } => write!(f, "`{id}` is not a valid {kind} identity"),
            Self::IdentityInUse { kind, id } => {
                write!(f, "{kind} identity `{id}` belongs to another entity")
            }
            Self::KindMismatch {
                expected,
                record,
                actual,
            } => write!(f, "expected {expected} record, {record} is a {actual}"),
            Self::Logging(message) => write!(f, "logging setup failed: {message}"),
        }
    }
}

impl Error for BridgeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Graph(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GraphError> for BridgeError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<StoreError> for BridgeError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
