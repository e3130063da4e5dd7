//! Fixed-width component bitmasks.

use std::fmt::{self, Debug, Formatter};

use crate::component::{Component, ComponentTypeID};

const WORDS: usize = 4;

/// The maximum number of distinct component types a process may register.
pub const MAX_COMPONENT_TYPES: usize = WORDS * 64;

/// A set of component types packed into a fixed array of 64-bit words.
///
/// Masks are used per entity (the live component set) and per `Archetype`.
/// Mutating operations return a new mask; a mask is never shared mutably.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ComponentMask([u64; WORDS]);

impl ComponentMask {
    /// The mask with no bits set.
    pub const EMPTY: ComponentMask = ComponentMask([0; WORDS]);

    /// Create an empty mask.
    pub const fn new() -> ComponentMask {
        ComponentMask::EMPTY
    }

    /// Build a mask from a list of component types.
    pub fn from_types(types: impl IntoIterator<Item=ComponentTypeID>) -> ComponentMask {
        types.into_iter().fold(ComponentMask::EMPTY, |mask, ty| mask.with(ty))
    }

    /// Build a mask containing a single component type.
    pub fn of<T: Component>() -> ComponentMask {
        ComponentMask::EMPTY.with(T::component_type())
    }

    fn split(ty: ComponentTypeID) -> (usize, u64) {
        let id = ty.id();
        debug_assert!(id < MAX_COMPONENT_TYPES);
        (id >> 6, 1u64 << (id & 63))
    }

    /// Return a copy of this mask with a component type set.
    #[must_use]
    pub fn with(mut self, ty: ComponentTypeID) -> ComponentMask {
        self.set(ty);
        self
    }

    /// Return a copy of this mask with a component type cleared.
    #[must_use]
    pub fn without(mut self, ty: ComponentTypeID) -> ComponentMask {
        self.unset(ty);
        self
    }

    /// Return the types in either mask.
    #[must_use]
    pub fn union(&self, other: &ComponentMask) -> ComponentMask {
        let mut words = self.0;
        for (word, other) in words.iter_mut().zip(other.0.iter()) {
            *word |= *other;
        }
        ComponentMask(words)
    }

    /// Return the types in both masks.
    #[must_use]
    pub fn intersection(&self, other: &ComponentMask) -> ComponentMask {
        let mut words = self.0;
        for (word, other) in words.iter_mut().zip(other.0.iter()) {
            *word &= *other;
        }
        ComponentMask(words)
    }

    /// Set the bit for a component type.
    pub fn set(&mut self, ty: ComponentTypeID) {
        let (word, bit) = Self::split(ty);
        self.0[word] |= bit;
    }

    /// Clear the bit for a component type.
    pub fn unset(&mut self, ty: ComponentTypeID) {
        let (word, bit) = Self::split(ty);
        self.0[word] &= !bit;
    }

    /// Returns true if the component type is in this mask.
    pub fn has(&self, ty: ComponentTypeID) -> bool {
        let (word, bit) = Self::split(ty);
        self.0[word] & bit != 0
    }

    /// Returns true if every type in `other` is also in this mask.
    pub fn has_all(&self, other: &ComponentMask) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a & b == *b)
    }

    /// Returns true if at least one type in `other` is in this mask.
    pub fn has_any(&self, other: &ComponentMask) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    /// Returns true if no type in `other` is in this mask.
    pub fn has_none(&self, other: &ComponentMask) -> bool {
        !self.has_any(other)
    }

    /// Returns true if no bits are set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Return the number of component types in this mask.
    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the component types in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item=ComponentTypeID> + '_ {
        self.0.iter().enumerate().flat_map(|(word_idx, word)| {
            let mut bits = *word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }

                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(ComponentTypeID::new((word_idx << 6) + bit))
            })
        })
    }
}

impl Debug for ComponentMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ty(id: usize) -> ComponentTypeID {
        ComponentTypeID::new(id)
    }

    #[test]
    fn test_set_unset() {
        let mut mask = ComponentMask::new();
        assert!(mask.is_empty());

        mask.set(ty(3));
        mask.set(ty(64));
        mask.set(ty(255));
        assert!(mask.has(ty(3)));
        assert!(mask.has(ty(64)));
        assert!(mask.has(ty(255)));
        assert!(!mask.has(ty(4)));
        assert_eq!(mask.len(), 3);

        mask.unset(ty(64));
        assert!(!mask.has(ty(64)));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![ty(3), ty(255)]);
    }

    #[test]
    fn test_predicates() {
        let entity = ComponentMask::from_types([ty(1), ty(2), ty(70)]);
        let required = ComponentMask::from_types([ty(1), ty(70)]);
        let excluded = ComponentMask::from_types([ty(5), ty(130)]);
        let overlapping = ComponentMask::from_types([ty(2), ty(9)]);

        assert!(entity.has_all(&required));
        assert!(!required.has_all(&entity));
        assert!(entity.has_none(&excluded));
        assert!(entity.has_any(&overlapping));
        assert!(!entity.has_none(&overlapping));

        // The empty mask is a subset of everything and overlaps nothing.
        assert!(entity.has_all(&ComponentMask::EMPTY));
        assert!(entity.has_none(&ComponentMask::EMPTY));
    }

    #[test]
    fn test_with_without() {
        let a = ComponentMask::EMPTY.with(ty(7));
        let b = a.with(ty(8)).without(ty(7));
        assert!(a.has(ty(7)));
        assert!(!b.has(ty(7)));
        assert!(b.has(ty(8)));
        assert_ne!(a, b);
    }

    #[test]
    fn test_union_intersection() {
        let a = ComponentMask::from_types([ty(1), ty(100)]);
        let b = ComponentMask::from_types([ty(100), ty(200)]);
        assert_eq!(a.union(&b), ComponentMask::from_types([ty(1), ty(100), ty(200)]));
        assert_eq!(a.intersection(&b), ComponentMask::from_types([ty(100)]));
    }
}
