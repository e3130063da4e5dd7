//! Per-entity bookkeeping that is not component data.

use std::collections::BTreeSet;

use crate::entity::Entity;

/// Descriptive and hierarchical information kept for every live entity.
///
/// The parent link is a relation resolved through the `World`, not an
/// ownership edge: a parent may be destroyed while the child handle still
/// names it, in which case the world detaches the child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityMetadata {
    pub name: String,
    pub tag: String,
    pub layer: u32,
    pub active: bool,
    pub parent: Option<Entity>,
    pub children: BTreeSet<Entity>,
}

impl EntityMetadata {
    /// Create the metadata for a freshly created entity.
    pub fn new(name: impl Into<String>) -> EntityMetadata {
        EntityMetadata {
            name: name.into(),
            tag: String::new(),
            layer: 0,
            active: true,
            parent: None,
            children: BTreeSet::new(),
        }
    }

    /// Returns true if the entity has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl Default for EntityMetadata {
    fn default() -> Self {
        EntityMetadata::new("")
    }
}
