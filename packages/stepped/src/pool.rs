//! Dense per-type component storage.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::component::{Component, ComponentTypeID};
use crate::entity::Entity;

/// A densely packed pool of one component type.
///
/// Values live in a contiguous `Vec` alongside the entity that owns each
/// slot. Removal swaps the last value into the freed slot, so slots are not
/// stable across removals; always address values by entity.
#[derive(Clone)]
pub struct ComponentPool<T> {
    values: Vec<T>,
    entities: Vec<Entity>,
    slots: HashMap<Entity, usize>,
}

impl<T> ComponentPool<T> {
    /// Create an empty pool.
    pub fn new() -> ComponentPool<T> {
        ComponentPool {
            values: Vec::new(),
            entities: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Attach a value to an entity, returning the value it replaced.
    pub fn add(&mut self, entity: Entity, value: T) -> Option<T> {
        match self.slots.get(&entity) {
            Some(slot) => Some(std::mem::replace(&mut self.values[*slot], value)),
            None => {
                self.slots.insert(entity, self.values.len());
                self.values.push(value);
                self.entities.push(entity);
                None
            }
        }
    }

    /// Get a reference to an entity's value.
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.slots.get(&entity).map(|slot| &self.values[*slot])
    }

    /// Get a mutable reference to an entity's value.
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        match self.slots.get(&entity) {
            Some(slot) => Some(&mut self.values[*slot]),
            None => None,
        }
    }

    /// Detach and return an entity's value.
    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        let slot = self.slots.remove(&entity)?;
        let value = self.values.swap_remove(slot);
        self.entities.swap_remove(slot);

        if let Some(moved) = self.entities.get(slot) {
            self.slots.insert(*moved, slot);
        }

        Some(value)
    }

    /// Returns true if the entity has a value in this pool.
    pub fn has(&self, entity: Entity) -> bool {
        self.slots.contains_key(&entity)
    }

    /// Get the number of values in the pool.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove every value.
    pub fn clear(&mut self) {
        self.values.clear();
        self.entities.clear();
        self.slots.clear();
    }

    /// The owning entities, in slot order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// The stored values, in slot order.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Call `f` with every `(Entity, &T)` pair in slot order.
    pub fn for_each(&self, mut f: impl FnMut(Entity, &T)) {
        for (entity, value) in self.iter() {
            f(entity, value);
        }
    }

    /// Iterate over `(Entity, &T)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item=(Entity, &T)> + '_ {
        self.entities.iter().copied().zip(self.values.iter())
    }

    /// Iterate over `(Entity, &mut T)` pairs in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item=(Entity, &mut T)> + '_ {
        self.entities.iter().copied().zip(self.values.iter_mut())
    }
}

impl<T> Default for ComponentPool<T> {
    fn default() -> Self {
        ComponentPool::new()
    }
}

impl<T> Debug for ComponentPool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentPool")
            .field("type", &std::any::type_name::<T>())
            .field("len", &self.values.len())
            .finish()
    }
}

/// The type-erased face of a pool, as stored in a `World`.
pub(crate) trait ErasedPool: Send + Sync {
    /// The component type this pool stores.
    fn component_type(&self) -> ComponentTypeID;

    /// Drop an entity's value, returning true if it had one.
    fn remove_entity(&self, entity: Entity) -> bool;

    fn len(&self) -> usize;

    fn clear(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A pool behind its own lock, so systems on different workers can touch
/// different pools concurrently.
pub(crate) struct SharedPool<T> {
    pool: RwLock<ComponentPool<T>>,
}

impl<T: Component> SharedPool<T> {
    pub fn new() -> SharedPool<T> {
        SharedPool {
            pool: RwLock::new(ComponentPool::new()),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ComponentPool<T>> {
        self.pool.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ComponentPool<T>> {
        self.pool.write().unwrap()
    }
}

impl<T: Component> ErasedPool for SharedPool<T> {
    fn component_type(&self) -> ComponentTypeID {
        T::component_type()
    }

    fn remove_entity(&self, entity: Entity) -> bool {
        self.write().remove(entity).is_some()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn clear(&self) {
        self.write().clear()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
