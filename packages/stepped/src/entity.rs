//! Entity identities.
//!
//! An entity has no intrinsic value: it is a versioned slot number that
//! components are attached to. Slots are recycled, and every recycle bumps the
//! slot's generation so that identities held past a destroy can be detected.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Display, Formatter};

use bit_vec::BitVec;

/// The identity of a single entity.
///
/// The low 32 bits hold the slot index and the high 32 bits hold the slot
/// generation. Entities are unique per `World`. They are not unique across
/// worlds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Entity(u64);

impl Entity {
    /// The sentinel entity which denotes absence. It is never valid.
    pub const NULL: Entity = Entity(0);

    /// Create an entity from its slot index and generation.
    pub const fn new(index: u32, generation: u32) -> Entity {
        Entity(((generation as u64) << 32) | index as u64)
    }

    /// Reconstruct an entity from the value returned by `to_bits`.
    pub const fn from_bits(bits: u64) -> Entity {
        Entity(bits)
    }

    /// Return the packed 64-bit representation of this entity.
    pub const fn to_bits(&self) -> u64 {
        self.0
    }

    /// Return the slot index of this entity.
    pub const fn index(&self) -> u32 {
        self.0 as u32
    }

    /// Return the generation of the slot when this entity was issued.
    pub const fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns true if this is the `NULL` sentinel.
    pub const fn is_null(&self) -> bool {
        self.generation() == 0
    }
}

impl PartialOrd for Entity {
    fn partial_cmp(&self, other: &Entity) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entity {
    fn cmp(&self, other: &Entity) -> Ordering {
        self.index().cmp(&other.index())
            .then_with(|| self.generation().cmp(&other.generation()))
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Entity(null)")
        } else {
            write!(f, "Entity({}v{})", self.index(), self.generation())
        }
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// Skip zero when a generation wraps, zero is reserved for `Entity::NULL`.
fn next_generation(generation: u32) -> u32 {
    generation.wrapping_add(1).max(1)
}

/// Issues and tracks entity identities.
///
/// The registry is not internally synchronised; the `World` guards it.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    generations: Vec<u32>,
    alive: BitVec,
    free: VecDeque<u32>,
    live: usize,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new() -> EntityRegistry {
        EntityRegistry::default()
    }

    /// Allocate a new entity.
    ///
    /// Freed slots are reused oldest-first. A fresh slot starts at
    /// generation 1; a reused slot carries the generation it was bumped to
    /// when it was destroyed.
    ///
    /// # Panics
    /// If all 2^32 slots are live at once.
    pub fn create(&mut self) -> Entity {
        self.live += 1;

        if let Some(index) = self.free.pop_front() {
            self.alive.set(index as usize, true);
            return Entity::new(index, self.generations[index as usize]);
        }

        let index = u32::try_from(self.generations.len())
            .expect("entity slots exhausted");
        self.generations.push(1);
        self.alive.push(true);
        Entity::new(index, 1)
    }

    /// Free the slot held by an entity.
    ///
    /// Returns false if the entity was not valid, in which case nothing
    /// changes.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_valid(entity) {
            return false;
        }

        let index = entity.index() as usize;
        self.alive.set(index, false);
        self.generations[index] = next_generation(self.generations[index]);
        self.free.push_back(entity.index());
        self.live -= 1;
        true
    }

    /// Returns true if the entity refers to a live slot of the same
    /// generation.
    pub fn is_valid(&self, entity: Entity) -> bool {
        if entity.is_null() {
            return false;
        }

        let index = entity.index() as usize;
        self.alive.get(index).unwrap_or(false)
            && self.generations[index] == entity.generation()
    }

    /// Return the live entity currently occupying a slot, if any.
    pub fn current(&self, index: u32) -> Option<Entity> {
        let idx = index as usize;
        if self.alive.get(idx).unwrap_or(false) {
            Some(Entity::new(index, self.generations[idx]))
        } else {
            None
        }
    }

    /// Get the number of live entities.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if no entities are live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Get the number of slots ever allocated, live or free.
    pub fn slot_count(&self) -> usize {
        self.generations.len()
    }

    /// Iterate over all live entities in slot order.
    pub fn iter(&self) -> impl Iterator<Item=Entity> + '_ {
        self.alive.iter()
            .enumerate()
            .filter(|(_, alive)| *alive)
            .map(move |(idx, _)| Entity::new(idx as u32, self.generations[idx]))
    }

    /// Destroy every entity, keeping slot generations so that old
    /// identities stay invalid.
    pub fn clear(&mut self) {
        let live: Vec<Entity> = self.iter().collect();
        for entity in live {
            self.destroy(entity);
        }
    }
}

impl Debug for EntityRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("live", &self.live)
            .field("slots", &self.generations.len())
            .field("free", &self.free.len())
            .finish()
    }
}
