//! Relationship containers.
//!
//! # Responsibility
//! - Provide the two container kinds used by relationship fields: an ordered
//!   sequence (`children`) and a unique-membership set (everything else).
//! - Provide the lazily resolved single-valued reference.
//!
//! # Invariants
//! - Both containers hold each member at most once.
//! - Containers never mirror on their own; the graph owns mirroring.

use super::EntityRef;
use crate::store::RecordHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Membership operations shared by both container kinds.
pub trait Membership {
    fn contains(&self, member: EntityRef) -> bool;
    /// Inserts `member`; returns `false` when it was already present.
    fn insert(&mut self, member: EntityRef) -> bool;
    /// Removes `member`; returns `false` when it was absent.
    fn remove(&mut self, member: EntityRef) -> bool;
    fn to_vec(&self) -> Vec<EntityRef>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insertion-ordered sequence with unique members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedRefs(Vec<EntityRef>);

impl OrderedRefs {
    pub fn position(&self, member: EntityRef) -> Option<usize> {
        self.0.iter().position(|current| *current == member)
    }

    /// Inserts at `index`, clamped to the current length.
    pub(crate) fn insert_at(&mut self, index: usize, member: EntityRef) {
        let index = index.min(self.0.len());
        self.0.insert(index, member);
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> EntityRef {
        self.0.remove(index)
    }

    pub fn as_slice(&self) -> &[EntityRef] {
        &self.0
    }

    pub(crate) fn replace_order(&mut self, members: Vec<EntityRef>) {
        self.0 = members;
    }
}

impl Membership for OrderedRefs {
    fn contains(&self, member: EntityRef) -> bool {
        self.0.contains(&member)
    }

    fn insert(&mut self, member: EntityRef) -> bool {
        if self.contains(member) {
            return false;
        }
        self.0.push(member);
        true
    }

    fn remove(&mut self, member: EntityRef) -> bool {
        match self.position(member) {
            Some(index) => {
                self.0.remove(index);
                true
            }
            None => false,
        }
    }

    fn to_vec(&self) -> Vec<EntityRef> {
        self.0.clone()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Unique-membership set, iterated in handle order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSet(BTreeSet<EntityRef>);

impl RefSet {
    pub fn iter(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.0.iter().copied()
    }
}

impl Membership for RefSet {
    fn contains(&self, member: EntityRef) -> bool {
        self.0.contains(&member)
    }

    fn insert(&mut self, member: EntityRef) -> bool {
        self.0.insert(member)
    }

    fn remove(&mut self, member: EntityRef) -> bool {
        self.0.remove(&member)
    }

    fn to_vec(&self) -> Vec<EntityRef> {
        self.0.iter().copied().collect()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Mutable borrow of one relationship collection, tagged by container kind.
pub enum Members<'a> {
    Ordered(&'a mut OrderedRefs),
    Set(&'a mut RefSet),
}

impl Members<'_> {
    pub fn contains(&self, member: EntityRef) -> bool {
        match self {
            Self::Ordered(refs) => refs.contains(member),
            Self::Set(refs) => refs.contains(member),
        }
    }

    pub fn insert(&mut self, member: EntityRef) -> bool {
        match self {
            Self::Ordered(refs) => refs.insert(member),
            Self::Set(refs) => refs.insert(member),
        }
    }

    pub fn remove(&mut self, member: EntityRef) -> bool {
        match self {
            Self::Ordered(refs) => refs.remove(member),
            Self::Set(refs) => refs.remove(member),
        }
    }
}

/// Single-valued relationship that may still be waiting on the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "target", rename_all = "snake_case")]
pub enum LazyRef {
    #[default]
    Empty,
    /// Record to translate through the identity map on first read.
    Unresolved(RecordHandle),
    Resolved(EntityRef),
}

impl LazyRef {
    pub fn resolved(self) -> Option<EntityRef> {
        match self {
            Self::Resolved(target) => Some(target),
            Self::Empty | Self::Unresolved(_) => None,
        }
    }

    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Unresolved(_))
    }

    pub(crate) fn from_target(target: Option<EntityRef>) -> Self {
        target.map_or(Self::Empty, Self::Resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::{Membership, OrderedRefs, RefSet};
    use crate::model::{EntityKind, EntityRef};

    fn task(index: u32) -> EntityRef {
        EntityRef::new(EntityKind::Task, index)
    }

    #[test]
    fn ordered_refs_keep_insertion_order_and_reject_duplicates() {
        let mut refs = OrderedRefs::default();
        assert!(refs.insert(task(3)));
        assert!(refs.insert(task(1)));
        assert!(!refs.insert(task(3)));
        assert_eq!(refs.as_slice(), &[task(3), task(1)]);
    }

    #[test]
    fn ordered_insert_at_clamps_index() {
        let mut refs = OrderedRefs::default();
        refs.insert(task(1));
        refs.insert_at(10, task(2));
        refs.insert_at(0, task(3));
        assert_eq!(refs.as_slice(), &[task(3), task(1), task(2)]);
    }

    #[test]
    fn set_remove_reports_absence() {
        let mut refs = RefSet::default();
        refs.insert(task(2));
        assert!(refs.remove(task(2)));
        assert!(!refs.remove(task(2)));
        assert!(refs.is_empty());
    }
}
