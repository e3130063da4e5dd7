//! Archetypes group entities which share an identical component mask.
//!
//! Component data never moves between archetypes: pools stay keyed by entity.
//! Archetypes exist so that a query can test one mask per group instead of
//! one mask per entity.

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Debug, Formatter};

use crate::component::ComponentTypeID;
use crate::entity::Entity;
use crate::mask::ComponentMask;

/// The index of an archetype in its `ArchetypeRegistry`.
pub type ArchetypeID = usize;

/// An archetype represents a particular layout of an entity.
///
/// It contains its mask and the component types of that mask in ascending
/// ID order, plus the entities currently in it.
pub struct Archetype {
    id: ArchetypeID,
    mask: ComponentMask,
    component_types: Vec<ComponentTypeID>,
    entities: BTreeSet<Entity>,
}

impl Archetype {
    fn new(id: ArchetypeID, mask: ComponentMask) -> Archetype {
        Archetype {
            id,
            mask,
            component_types: mask.iter().collect(),
            entities: BTreeSet::new(),
        }
    }

    /// Return the unique archetype ID within its registry.
    pub fn id(&self) -> ArchetypeID {
        self.id
    }

    /// Return the component mask shared by all members.
    pub fn mask(&self) -> &ComponentMask {
        &self.mask
    }

    /// Return the sorted list of component types in this archetype.
    pub fn component_types(&self) -> &[ComponentTypeID] {
        &self.component_types
    }

    /// Returns true if this archetype contains the given component.
    pub fn has_component_type(&self, component_type: ComponentTypeID) -> bool {
        self.mask.has(component_type)
    }

    /// Returns true if this archetype satisfies a has-all / has-none query.
    pub fn matches(&self, required: &ComponentMask, excluded: &ComponentMask) -> bool {
        self.mask.has_all(required) && self.mask.has_none(excluded)
    }

    /// Iterate over the member entities in ascending order.
    pub fn entities(&self) -> impl Iterator<Item=Entity> + '_ {
        self.entities.iter().copied()
    }

    /// Get the number of member entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if this archetype has no members.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Debug for Archetype {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("component_types", &self.component_types)
            .field("entities", &self.entities.len())
            .finish()
    }
}

/// Lazily creates archetypes and caches them by mask.
///
/// The empty mask is always archetype 0.
pub struct ArchetypeRegistry {
    archetypes: Vec<Archetype>,
    by_mask: HashMap<ComponentMask, ArchetypeID>,
}

impl ArchetypeRegistry {
    /// Create a registry containing only the empty archetype.
    pub fn new() -> ArchetypeRegistry {
        let mut registry = ArchetypeRegistry {
            archetypes: Vec::new(),
            by_mask: HashMap::new(),
        };
        registry.ensure(ComponentMask::EMPTY);
        registry
    }

    /// Return the archetype for a mask, creating it if needed.
    pub fn ensure(&mut self, mask: ComponentMask) -> ArchetypeID {
        if let Some(id) = self.by_mask.get(&mask) {
            return *id;
        }

        let id = self.archetypes.len();
        self.archetypes.push(Archetype::new(id, mask));
        self.by_mask.insert(mask, id);
        log::trace!("created archetype #{} {:?}", id, mask);
        id
    }

    /// Look up an archetype by ID.
    pub fn get(&self, id: ArchetypeID) -> Option<&Archetype> {
        self.archetypes.get(id)
    }

    /// Look up an archetype by its exact mask, without creating it.
    pub fn find(&self, mask: &ComponentMask) -> Option<&Archetype> {
        self.by_mask.get(mask).map(|id| &self.archetypes[*id])
    }

    /// Place an entity in the archetype for `mask`, leaving `from` if given.
    ///
    /// Returns the archetype the entity now belongs to.
    pub fn relocate(&mut self, entity: Entity, from: Option<ArchetypeID>, mask: ComponentMask) -> ArchetypeID {
        let to = self.ensure(mask);
        if from == Some(to) {
            return to;
        }

        if let Some(from) = from {
            self.archetypes[from].entities.remove(&entity);
        }
        self.archetypes[to].entities.insert(entity);
        to
    }

    /// Drop an entity from its archetype.
    pub fn remove(&mut self, entity: Entity, from: ArchetypeID) {
        if let Some(archetype) = self.archetypes.get_mut(from) {
            archetype.entities.remove(&entity);
        }
    }

    /// Iterate over the archetypes matching a has-all / has-none query.
    pub fn matching<'a>(&'a self, required: &'a ComponentMask, excluded: &'a ComponentMask)
        -> impl Iterator<Item=&'a Archetype> + 'a
    {
        self.archetypes.iter().filter(move |a| a.matches(required, excluded))
    }

    /// Iterate over all archetypes.
    pub fn iter(&self) -> impl Iterator<Item=&Archetype> {
        self.archetypes.iter()
    }

    /// Get the number of archetypes created so far.
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Always false: the empty archetype exists from construction.
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Remove every member from every archetype, keeping the archetypes.
    pub fn clear_members(&mut self) {
        for archetype in self.archetypes.iter_mut() {
            archetype.entities.clear();
        }
    }
}

impl Default for ArchetypeRegistry {
    fn default() -> Self {
        ArchetypeRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ty(id: usize) -> ComponentTypeID {
        ComponentTypeID::new(id)
    }

    #[test]
    fn test_ensure_caches_by_mask() {
        let mut registry = ArchetypeRegistry::new();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ensure(ComponentMask::EMPTY), 0);

        let mask = ComponentMask::from_types([ty(2), ty(1)]);
        let a = registry.ensure(mask);
        let b = registry.ensure(ComponentMask::from_types([ty(1), ty(2)]));
        assert_eq!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().component_types(), &[ty(1), ty(2)]);
    }

    #[test]
    fn test_relocate() {
        let mut registry = ArchetypeRegistry::new();
        let e = Entity::new(0, 1);

        let empty = registry.relocate(e, None, ComponentMask::EMPTY);
        let with_one = registry.relocate(e, Some(empty), ComponentMask::from_types([ty(1)]));
        assert!(registry.get(empty).unwrap().is_empty());
        assert_eq!(registry.get(with_one).unwrap().entities().collect::<Vec<_>>(), vec![e]);

        registry.remove(e, with_one);
        assert!(registry.get(with_one).unwrap().is_empty());
    }

    #[test]
    fn test_matching() {
        let mut registry = ArchetypeRegistry::new();
        let ab = registry.ensure(ComponentMask::from_types([ty(1), ty(2)]));
        let a = registry.ensure(ComponentMask::from_types([ty(1)]));
        registry.ensure(ComponentMask::from_types([ty(2)]));

        let required = ComponentMask::from_types([ty(1)]);
        let excluded = ComponentMask::from_types([ty(2)]);
        let ids: Vec<_> = registry.matching(&required, &excluded).map(|a| a.id()).collect();
        assert_eq!(ids, vec![a]);

        let none = ComponentMask::EMPTY;
        let ids: Vec<_> = registry.matching(&required, &none).map(|a| a.id()).collect();
        assert_eq!(ids, vec![ab, a]);
    }
}
