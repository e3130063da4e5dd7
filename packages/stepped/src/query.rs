//! Has-all / has-none entity queries.

use crate::component::{Component, ComponentTypeID};
use crate::entity::Entity;
use crate::mask::ComponentMask;
use crate::world::World;

/// A builder for a query over a `World`.
///
/// A query matches every entity whose component mask contains all of the
/// required types and none of the excluded ones. Matching happens per
/// archetype, so the cost is proportional to the number of archetypes plus
/// the number of results.
///
/// Results are a snapshot: entities created or mutated after `execute`
/// returns are not reflected.
#[derive(Clone, Debug)]
pub struct QueryBuilder<'w> {
    world: &'w World,
    required: ComponentMask,
    excluded: ComponentMask,
}

impl<'w> QueryBuilder<'w> {
    /// Create a query with no constraints, which matches every live entity.
    pub fn new(world: &'w World) -> QueryBuilder<'w> {
        QueryBuilder {
            world,
            required: ComponentMask::EMPTY,
            excluded: ComponentMask::EMPTY,
        }
    }

    /// Require the component type `T`.
    pub fn with<T: Component>(self) -> QueryBuilder<'w> {
        self.with_type(T::component_type())
    }

    /// Exclude the component type `T`.
    pub fn without<T: Component>(self) -> QueryBuilder<'w> {
        self.without_type(T::component_type())
    }

    /// Require a component type by ID.
    pub fn with_type(mut self, component_type: ComponentTypeID) -> QueryBuilder<'w> {
        self.required.set(component_type);
        self
    }

    /// Exclude a component type by ID.
    pub fn without_type(mut self, component_type: ComponentTypeID) -> QueryBuilder<'w> {
        self.excluded.set(component_type);
        self
    }

    /// Require every type in `mask`.
    pub fn with_mask(mut self, mask: &ComponentMask) -> QueryBuilder<'w> {
        self.required = self.required.union(mask);
        self
    }

    /// Exclude every type in `mask`.
    pub fn without_mask(mut self, mask: &ComponentMask) -> QueryBuilder<'w> {
        self.excluded = self.excluded.union(mask);
        self
    }

    /// The required component mask.
    pub fn required(&self) -> &ComponentMask {
        &self.required
    }

    /// The excluded component mask.
    pub fn excluded(&self) -> &ComponentMask {
        &self.excluded
    }

    /// Returns true if a single entity currently satisfies this query.
    pub fn matches(&self, entity: Entity) -> bool {
        self.world.mask_of(entity)
            .map_or(false, |mask| mask.has_all(&self.required) && mask.has_none(&self.excluded))
    }

    /// Collect the matching entities, grouped by archetype.
    ///
    /// A type which is both required and excluded matches nothing.
    pub fn execute(&self) -> Vec<Entity> {
        self.world.matching_entities(&self.required, &self.excluded)
    }

    /// Call `f` with every matching entity.
    ///
    /// The result set is collected first, so `f` may freely mutate the world.
    pub fn for_each(&self, f: impl FnMut(Entity)) {
        self.execute().into_iter().for_each(f);
    }

    /// Count the matching entities.
    pub fn count(&self) -> usize {
        self.execute().len()
    }

    /// Returns the first matching entity, if any.
    pub fn first(&self) -> Option<Entity> {
        self.execute().into_iter().next()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::*;
    use crate::component;

    #[derive(Debug, Clone, Default)]
    struct Health(u32);
    component!(Health);

    #[derive(Debug, Clone, Default)]
    struct Armor(u32);
    component!(Armor);

    #[derive(Debug, Clone, Default)]
    struct Dead;
    component!(Dead);

    fn set(entities: Vec<Entity>) -> BTreeSet<Entity> {
        entities.into_iter().collect()
    }

    #[test]
    fn test_with_without() {
        let world = World::new();
        let a = world.create_entity();
        let b = world.create_entity();
        let c = world.create_entity();

        world.add_component(a, Health(10)).unwrap();
        world.add_component(b, Health(5)).unwrap();
        world.add_component(b, Armor(3)).unwrap();
        world.add_component(c, Health(0)).unwrap();
        world.add_component(c, Dead).unwrap();

        assert_eq!(set(world.query().with::<Health>().execute()), set(vec![a, b, c]));
        assert_eq!(set(world.query().with::<Health>().without::<Dead>().execute()), set(vec![a, b]));
        assert_eq!(world.query().with::<Health>().with::<Armor>().execute(), vec![b]);
        assert_eq!(world.query().with::<Armor>().without::<Armor>().count(), 0);

        let everything = world.query();
        assert_eq!(everything.count(), 3);
        assert!(everything.matches(a));
        assert!(!world.query().with::<Dead>().matches(a));
    }

    #[test]
    fn test_tracks_mutation() {
        let world = World::new();
        let e = world.create_entity();
        let query = world.query().with::<Health>().without::<Dead>();

        assert_eq!(query.first(), None);
        world.add_component(e, Health(1)).unwrap();
        assert_eq!(query.first(), Some(e));
        world.add_component(e, Dead).unwrap();
        assert_eq!(query.first(), None);
        world.remove_component::<Dead>(e);
        assert_eq!(query.first(), Some(e));
    }

    #[test]
    fn test_for_each_may_mutate() {
        let world = World::new();
        for _ in 0..8 {
            let e = world.create_entity();
            world.add_component(e, Health(1)).unwrap();
        }

        world.query().with::<Health>().for_each(|e| {
            world.add_component(e, Dead).unwrap();
        });
        assert_eq!(world.query().with::<Dead>().count(), 8);
    }
}
