//! Domain entity graph for the task-tracking model.
//!
//! # Responsibility
//! - Define the six entity kinds, their identities and arena handles.
//! - Keep every bidirectional relationship mirrored in the in-memory graph.
//!
//! # Invariants
//! - Entities are addressed by stable arena handles; a handle is never reused.
//! - Identity (`id` or option `key`) is independent from the arena handle and
//!   stays unset for integer kinds until the store assigns it.

pub mod collection;
pub mod entity;
pub mod field;
pub mod graph;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The six hard-coded entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Tag,
    Note,
    Attachment,
    User,
    /// Key/value option; its key doubles as identity.
    AppOption,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        Self::Task,
        Self::Tag,
        Self::Note,
        Self::Attachment,
        Self::User,
        Self::AppOption,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Tag => "tag",
            Self::Note => "note",
            Self::Attachment => "attachment",
            Self::User => "user",
            Self::AppOption => "option",
        }
    }

    /// Whether identities of this kind are caller-provided text keys.
    pub fn is_keyed(self) -> bool {
        matches!(self, Self::AppOption)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable arena handle of one domain entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    kind: EntityKind,
    index: u32,
}

impl EntityRef {
    pub(crate) fn new(kind: EntityKind, index: u32) -> Self {
        Self { kind, index }
    }

    pub fn kind(self) -> EntityKind {
        self.kind
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.index)
    }
}

/// Storage identity of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Store-assigned (or caller-assigned) integer row id.
    Int(i64),
    /// Option key.
    Key(String),
}

impl EntityId {
    /// Returns whether this identity has the shape used by `kind`.
    pub fn fits(&self, kind: EntityKind) -> bool {
        matches!(
            (self, kind.is_keyed()),
            (Self::Int(_), false) | (Self::Key(_), true)
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Key(_) => None,
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Key(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}
