//! A world which holds entities, their components and their hierarchy.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, RwLock};

use crossbeam_queue::SegQueue;

use crate::archetype::{ArchetypeID, ArchetypeRegistry};
use crate::component::{Component, ComponentTypeID};
use crate::entity::{Entity, EntityRegistry};
use crate::error::WorldError;
use crate::mask::ComponentMask;
use crate::metadata::EntityMetadata;
use crate::pool::{ErasedPool, SharedPool};
use crate::query::QueryBuilder;

struct EntityRecord {
    mask: ComponentMask,
    archetype: ArchetypeID,
    metadata: EntityMetadata,
    pending_destroy: bool,
}

/// Everything structural, kept under one lock so masks, archetype
/// membership and identities never disagree.
struct EntityTable {
    registry: EntityRegistry,
    records: Vec<Option<EntityRecord>>,
    archetypes: ArchetypeRegistry,
}

impl EntityTable {
    fn new() -> EntityTable {
        EntityTable {
            registry: EntityRegistry::new(),
            records: Vec::new(),
            archetypes: ArchetypeRegistry::new(),
        }
    }

    fn record(&self, entity: Entity) -> Option<&EntityRecord> {
        if !self.registry.is_valid(entity) {
            return None;
        }

        self.records.get(entity.index() as usize).and_then(|r| r.as_ref())
    }

    fn record_mut(&mut self, entity: Entity) -> Option<&mut EntityRecord> {
        if !self.registry.is_valid(entity) {
            return None;
        }

        self.records.get_mut(entity.index() as usize).and_then(|r| r.as_mut())
    }

    /// Apply `f` to an entity's mask, moving it between archetypes if the
    /// mask changed. Returns `None` for an invalid entity, otherwise whether
    /// the mask changed.
    fn update_mask(&mut self, entity: Entity, f: impl FnOnce(ComponentMask) -> ComponentMask) -> Option<bool> {
        if !self.registry.is_valid(entity) {
            return None;
        }

        let record = self.records.get_mut(entity.index() as usize)?.as_mut()?;
        let mask = f(record.mask);
        if mask == record.mask {
            return Some(false);
        }

        record.mask = mask;
        record.archetype = self.archetypes.relocate(entity, Some(record.archetype), mask);
        Some(true)
    }

    /// Collect `entity` and its descendants, children before parents.
    fn collect_subtree(&self, entity: Entity, seen: &mut HashSet<Entity>, order: &mut Vec<Entity>) {
        let record = match self.record(entity) {
            Some(r) => r,
            None => return,
        };

        if !seen.insert(entity) {
            return;
        }

        for child in record.metadata.children.iter() {
            self.collect_subtree(*child, seen, order);
        }
        order.push(entity);
    }
}

/// The owning container of all entities, components and hierarchy.
///
/// Every method takes `&self`: structural state is guarded by an internal
/// lock and each component pool by its own lock, so a `World` can be shared
/// between the engine loop and job workers behind an `Arc`.
///
/// Lock order is always pool, then table. Adding or removing a component holds
/// the pool's write lock while the mask is updated, so the two never disagree;
/// no method takes a pool lock while holding the table lock.
pub struct World {
    table: RwLock<EntityTable>,
    pools: RwLock<HashMap<ComponentTypeID, Arc<dyn ErasedPool>>>,
    pending_destroy: SegQueue<Entity>,
    structural_changes: SegQueue<Entity>,
}

impl World {
    /// Create a new empty world.
    pub fn new() -> World {
        World {
            table: RwLock::new(EntityTable::new()),
            pools: RwLock::new(HashMap::new()),
            pending_destroy: SegQueue::new(),
            structural_changes: SegQueue::new(),
        }
    }

    /// Create an entity with no components and an empty name.
    pub fn create_entity(&self) -> Entity {
        self.create_named_entity("")
    }

    /// Create an entity with no components and the given name.
    pub fn create_named_entity(&self, name: impl Into<String>) -> Entity {
        let entity = {
            let mut table = self.table.write().unwrap();
            let entity = table.registry.create();
            let idx = entity.index() as usize;
            if table.records.len() <= idx {
                table.records.resize_with(idx + 1, || None);
            }

            let archetype = table.archetypes.relocate(entity, None, ComponentMask::EMPTY);
            table.records[idx] = Some(EntityRecord {
                mask: ComponentMask::EMPTY,
                archetype,
                metadata: EntityMetadata::new(name),
                pending_destroy: false,
            });
            entity
        };

        self.structural_changes.push(entity);
        entity
    }

    /// Returns true if the entity is live in this world.
    ///
    /// Entities queued for destruction stay valid until the next call to
    /// `process_deferred_destruction`.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.table.read().unwrap().registry.is_valid(entity)
    }

    /// Queue an entity for destruction at the end of the frame.
    ///
    /// Returns true if the entity was newly queued. Queuing an invalid or
    /// already queued entity does nothing.
    pub fn destroy_entity(&self, entity: Entity) -> bool {
        let mut table = self.table.write().unwrap();
        match table.record_mut(entity) {
            Some(record) if !record.pending_destroy => {
                record.pending_destroy = true;
                self.pending_destroy.push(entity);
                true
            }
            _ => false,
        }
    }

    /// Get the number of entities queued for destruction.
    pub fn pending_destruction_count(&self) -> usize {
        self.pending_destroy.len()
    }

    /// Destroy every queued entity, and all of their descendants.
    ///
    /// Children are destroyed before their parents. Returns the number of
    /// entities destroyed.
    pub fn process_deferred_destruction(&self) -> usize {
        let mut roots = Vec::with_capacity(self.pending_destroy.len());
        while let Some(entity) = self.pending_destroy.pop() {
            roots.push(entity);
        }

        if roots.is_empty() {
            return 0;
        }

        let order = {
            let table = self.table.read().unwrap();
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            for root in roots {
                table.collect_subtree(root, &mut seen, &mut order);
            }
            order
        };

        let destroyed = order.into_iter()
            .filter(|entity| self.destroy_now(*entity))
            .count();
        log::trace!("destroyed {} deferred entities", destroyed);
        destroyed
    }

    /// Immediately remove an entity and its component values.
    fn destroy_now(&self, entity: Entity) -> bool {
        let mask = {
            let mut guard = self.table.write().unwrap();
            let table = &mut *guard;
            if !table.registry.is_valid(entity) {
                return false;
            }

            let record = match table.records[entity.index() as usize].take() {
                Some(record) => record,
                None => return false,
            };

            table.archetypes.remove(entity, record.archetype);
            if let Some(parent) = record.metadata.parent {
                if let Some(parent) = table.record_mut(parent) {
                    parent.metadata.children.remove(&entity);
                }
            }
            for child in record.metadata.children.iter() {
                if let Some(child) = table.record_mut(*child) {
                    child.metadata.parent = None;
                }
            }

            table.registry.destroy(entity);
            record.mask
        };

        // The identity is dead, so no new values can be attached; any value
        // added concurrently is rolled back by `add_component` itself.
        let pools: Vec<_> = {
            let pools = self.pools.read().unwrap();
            mask.iter().filter_map(|ty| pools.get(&ty).cloned()).collect()
        };
        for pool in pools {
            pool.remove_entity(entity);
        }

        self.structural_changes.push(entity);
        true
    }

    /// Immediately destroy every entity.
    pub fn clear(&self) {
        let destroyed: Vec<Entity> = {
            let mut table = self.table.write().unwrap();
            let live = table.registry.iter().collect();
            table.registry.clear();
            table.records.iter_mut().for_each(|r| *r = None);
            table.archetypes.clear_members();
            live
        };

        for pool in self.pools.read().unwrap().values() {
            pool.clear();
        }
        while self.pending_destroy.pop().is_some() {}
        for entity in destroyed {
            self.structural_changes.push(entity);
        }
    }

    fn pool<T: Component>(&self) -> Option<Arc<dyn ErasedPool>> {
        self.pools.read().unwrap().get(&T::component_type()).cloned()
    }

    fn ensure_pool<T: Component>(&self) -> Arc<dyn ErasedPool> {
        if let Some(pool) = self.pool::<T>() {
            return pool;
        }

        let mut pools = self.pools.write().unwrap();
        pools.entry(T::component_type())
            .or_insert_with(|| Arc::new(SharedPool::<T>::new()))
            .clone()
    }

    fn with_pool<T: Component, R>(&self, f: impl FnOnce(&SharedPool<T>) -> R) -> Option<R> {
        let pool = self.pool::<T>()?;
        let shared = pool.as_any().downcast_ref::<SharedPool<T>>()?;
        Some(f(shared))
    }

    /// Attach a component to an entity, returning the value it replaced.
    pub fn add_component<T: Component>(&self, entity: Entity, value: T) -> Result<Option<T>, WorldError> {
        if !self.is_valid(entity) {
            return Err(WorldError::InvalidEntity(entity));
        }

        let ty = T::component_type();
        let pool = self.ensure_pool::<T>();
        let shared = pool.as_any()
            .downcast_ref::<SharedPool<T>>()
            .ok_or(WorldError::InvalidEntity(entity))?;
        let mut values = shared.write();
        let previous = values.add(entity, value);

        let changed = self.table.write().unwrap().update_mask(entity, |mask| mask.with(ty));
        match changed {
            None => {
                // Destroyed between the check and the insert.
                values.remove(entity);
                Err(WorldError::InvalidEntity(entity))
            }
            Some(changed) => {
                if changed {
                    self.structural_changes.push(entity);
                }
                Ok(previous)
            }
        }
    }

    /// Get a copy of an entity's component.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<T> {
        self.with_component(entity, T::clone)
    }

    /// Call `f` with a reference to an entity's component.
    ///
    /// The pool for `T` is read-locked while `f` runs: `f` must not add or
    /// remove `T` components.
    pub fn with_component<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.with_pool::<T, _>(|pool| pool.read().get(entity).map(f)).flatten()
    }

    /// Call `f` with a mutable reference to an entity's component.
    ///
    /// The pool for `T` is write-locked while `f` runs: `f` must not touch
    /// any `T` component through the world.
    pub fn with_component_mut<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.with_pool::<T, _>(|pool| pool.write().get_mut(entity).map(f)).flatten()
    }

    /// Detach and return an entity's component.
    pub fn remove_component<T: Component>(&self, entity: Entity) -> Option<T> {
        let ty = T::component_type();
        let (value, changed) = self.with_pool::<T, _>(|pool| {
            let mut values = pool.write();
            let value = values.remove(entity)?;
            let changed = self.table.write().unwrap().update_mask(entity, |mask| mask.without(ty));
            Some((value, changed))
        }).flatten()?;

        if changed == Some(true) {
            self.structural_changes.push(entity);
        }
        Some(value)
    }

    /// Returns true if the entity has a component of type `T`.
    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        self.with_pool::<T, _>(|pool| pool.read().has(entity)).unwrap_or(false)
    }

    /// Call `f` with every entity holding a `T` and its value, in pool order.
    ///
    /// The pool for `T` is read-locked while iterating.
    pub fn for_each<T: Component>(&self, mut f: impl FnMut(Entity, &T)) {
        self.with_pool::<T, _>(|pool| pool.read().for_each(&mut f));
    }

    /// Get the number of entities holding a `T`.
    pub fn component_count<T: Component>(&self) -> usize {
        self.with_pool::<T, _>(|pool| pool.read().len()).unwrap_or(0)
    }

    /// Start building a query over this world.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Collect every entity whose mask has all of `required` and none of
    /// `excluded`.
    pub fn matching_entities(&self, required: &ComponentMask, excluded: &ComponentMask) -> Vec<Entity> {
        let table = self.table.read().unwrap();
        let entities = table.archetypes.matching(required, excluded)
            .flat_map(|archetype| archetype.entities())
            .collect();
        entities
    }

    /// Get the live component mask of an entity.
    pub fn mask_of(&self, entity: Entity) -> Option<ComponentMask> {
        self.table.read().unwrap().record(entity).map(|r| r.mask)
    }

    /// Get the archetype an entity currently belongs to.
    pub fn archetype_of(&self, entity: Entity) -> Option<ArchetypeID> {
        self.table.read().unwrap().record(entity).map(|r| r.archetype)
    }

    /// Get the number of archetypes created so far.
    pub fn archetype_count(&self) -> usize {
        self.table.read().unwrap().archetypes.len()
    }

    /// Get the number of live entities.
    pub fn entity_count(&self) -> usize {
        self.table.read().unwrap().registry.len()
    }

    /// Collect all live entities in slot order.
    pub fn entities(&self) -> Vec<Entity> {
        self.table.read().unwrap().registry.iter().collect()
    }

    /// Make `parent` the parent of `child`, or detach `child` with `None`.
    ///
    /// Fails if either entity is invalid, or if `parent` is `child` or one
    /// of its descendants.
    pub fn set_parent(&self, child: Entity, parent: Option<Entity>) -> Result<(), WorldError> {
        let mut guard = self.table.write().unwrap();
        let table = &mut *guard;

        let old_parent = match table.record(child) {
            Some(record) => record.metadata.parent,
            None => return Err(WorldError::InvalidEntity(child)),
        };

        if let Some(parent) = parent {
            if table.record(parent).is_none() {
                return Err(WorldError::InvalidEntity(parent));
            }

            let mut cursor = Some(parent);
            while let Some(ancestor) = cursor {
                if ancestor == child {
                    return Err(WorldError::HierarchyCycle { child, parent });
                }
                cursor = table.record(ancestor).and_then(|r| r.metadata.parent);
            }
        }

        if old_parent == parent {
            return Ok(());
        }

        if let Some(old) = old_parent {
            if let Some(record) = table.record_mut(old) {
                record.metadata.children.remove(&child);
            }
        }
        if let Some(new) = parent {
            if let Some(record) = table.record_mut(new) {
                record.metadata.children.insert(child);
            }
        }
        if let Some(record) = table.record_mut(child) {
            record.metadata.parent = parent;
        }
        Ok(())
    }

    /// Get the parent of an entity.
    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.table.read().unwrap().record(entity).and_then(|r| r.metadata.parent)
    }

    /// Get the children of an entity in ascending order.
    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        self.table.read().unwrap()
            .record(entity)
            .map(|r| r.metadata.children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Get a copy of an entity's metadata.
    pub fn metadata(&self, entity: Entity) -> Option<EntityMetadata> {
        self.table.read().unwrap().record(entity).map(|r| r.metadata.clone())
    }

    fn edit_metadata(&self, entity: Entity, f: impl FnOnce(&mut EntityMetadata)) -> bool {
        match self.table.write().unwrap().record_mut(entity) {
            Some(record) => {
                f(&mut record.metadata);
                true
            }
            None => false,
        }
    }

    /// Rename an entity. Returns false if the entity is invalid.
    pub fn set_name(&self, entity: Entity, name: impl Into<String>) -> bool {
        let name = name.into();
        self.edit_metadata(entity, |m| m.name = name)
    }

    /// Set an entity's tag. Returns false if the entity is invalid.
    pub fn set_tag(&self, entity: Entity, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        self.edit_metadata(entity, |m| m.tag = tag)
    }

    /// Set an entity's layer. Returns false if the entity is invalid.
    pub fn set_layer(&self, entity: Entity, layer: u32) -> bool {
        self.edit_metadata(entity, |m| m.layer = layer)
    }

    /// Set an entity's active flag. Returns false if the entity is invalid.
    pub fn set_active(&self, entity: Entity, active: bool) -> bool {
        self.edit_metadata(entity, |m| m.active = active)
    }

    /// Find the first live entity, in slot order, with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<Entity> {
        let table = self.table.read().unwrap();
        let found = table.registry.iter()
            .find(|e| table.record(*e).map_or(false, |r| r.metadata.name == name));
        found
    }

    /// Drain the log of entities whose component set changed, were created
    /// or were destroyed since the last call.
    ///
    /// An entity may appear more than once.
    pub fn take_structural_changes(&self) -> Vec<Entity> {
        let mut changes = Vec::with_capacity(self.structural_changes.len());
        while let Some(entity) = self.structural_changes.pop() {
            changes.push(entity);
        }
        changes
    }

    /// Returns true if structural changes are waiting to be taken.
    pub fn has_structural_changes(&self) -> bool {
        !self.structural_changes.is_empty()
    }
}

impl Default for World {
    fn default() -> Self {
        World::new()
    }
}

struct PoolSizes<'a>(&'a HashMap<ComponentTypeID, Arc<dyn ErasedPool>>);

impl Debug for PoolSizes<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.values().map(|pool| (pool.component_type(), pool.len())))
            .finish()
    }
}

impl Debug for World {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (entities, archetypes) = {
            let table = self.table.read().unwrap();
            (table.registry.len(), table.archetypes.len())
        };
        f.debug_struct("World")
            .field("entities", &entities)
            .field("archetypes", &archetypes)
            .field("pools", &PoolSizes(&self.pools.read().unwrap()))
            .field("pending_destroy", &self.pending_destroy.len())
            .finish()
    }
}
