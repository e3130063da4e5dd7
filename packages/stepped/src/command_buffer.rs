use std::fmt::{self, Debug, Formatter};

use crate::component::{Component, ComponentTypeID};
use crate::entity::Entity;
use crate::error::WorldError;
use crate::world::World;

type BoxedCommand = Box<dyn FnOnce(&World) -> Result<(), WorldError> + Send + 'static>;

enum Command {
    Add(Entity, ComponentTypeID, BoxedCommand),
    Remove(Entity, ComponentTypeID, BoxedCommand),
    Destroy(Entity),
    Custom(BoxedCommand),
}

impl Debug for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Command::Add(entity, ty, _) => write!(f, "Add({:?}, {:?})", entity, ty),
            Command::Remove(entity, ty, _) => write!(f, "Remove({:?}, {:?})", entity, ty),
            Command::Destroy(entity) => write!(f, "Destroy({:?})", entity),
            Command::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A command buffer for entity changes.
///
/// Systems running in parallel, or entity callbacks which cannot mutate the
/// structure they are iterating, record their changes here and apply them
/// to the `World` later. Commands apply in the order they were recorded.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    /// Create a new, empty, command buffer.
    pub fn new() -> CommandBuffer {
        CommandBuffer {
            commands: Vec::new(),
        }
    }

    /// Merge multiple command buffers.
    ///
    /// Commands keep their relative order, buffer by buffer, so if multiple
    /// buffers touch the same component the rightmost wins.
    pub fn merge(buffers: impl IntoIterator<Item=CommandBuffer>) -> CommandBuffer {
        let mut dest = CommandBuffer::new();
        for mut buffer in buffers {
            dest.append(&mut buffer);
        }
        dest
    }

    /// Move every command out of `other` onto the end of this buffer.
    pub fn append(&mut self, other: &mut CommandBuffer) {
        self.commands.append(&mut other.commands);
    }

    /// Record attaching a component to an entity.
    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) {
        self.commands.push(Command::Add(
            entity,
            T::component_type(),
            Box::new(move |world| world.add_component(entity, component).map(|_| ())),
        ));
    }

    /// Record detaching a component from an entity.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        self.commands.push(Command::Remove(
            entity,
            T::component_type(),
            Box::new(move |world| {
                world.remove_component::<T>(entity);
                Ok(())
            }),
        ));
    }

    /// Record queueing an entity for destruction.
    pub fn destroy_entity(&mut self, entity: Entity) {
        self.commands.push(Command::Destroy(entity));
    }

    /// Record an arbitrary world mutation.
    pub fn push(&mut self, f: impl FnOnce(&World) + Send + 'static) {
        self.commands.push(Command::Custom(Box::new(move |world| {
            f(world);
            Ok(())
        })));
    }

    /// Get the number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Apply every command to the world in order.
    ///
    /// A failing command does not stop the rest; the errors are returned.
    pub fn apply(self, world: &World) -> Vec<WorldError> {
        let mut errors = Vec::new();
        for command in self.commands {
            let result = match command {
                Command::Add(_, _, f) | Command::Remove(_, _, f) | Command::Custom(f) => f(world),
                Command::Destroy(entity) => {
                    world.destroy_entity(entity);
                    Ok(())
                }
            };

            if let Err(err) = result {
                log::debug!("command buffer: {}", err);
                errors.push(err);
            }
        }
        errors
    }
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.commands.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component;

    #[derive(Debug, Clone, PartialEq)]
    struct Score(i32);
    component!(Score);

    #[test]
    fn test_apply_in_order() {
        let world = World::new();
        let e = world.create_entity();

        let mut buffer = CommandBuffer::new();
        buffer.add_component(e, Score(1));
        buffer.add_component(e, Score(2));
        buffer.push(move |world| {
            world.with_component_mut::<Score, _>(e, |s| s.0 *= 10);
        });
        assert_eq!(buffer.len(), 3);
        assert!(world.get_component::<Score>(e).is_none());

        assert!(buffer.apply(&world).is_empty());
        assert_eq!(world.get_component::<Score>(e), Some(Score(20)));
    }

    #[test]
    fn test_errors_collected() {
        let world = World::new();
        let live = world.create_entity();
        let dead = world.create_entity();
        world.destroy_entity(dead);
        world.process_deferred_destruction();

        let mut buffer = CommandBuffer::new();
        buffer.add_component(dead, Score(1));
        buffer.add_component(live, Score(2));
        buffer.remove_component::<Score>(dead);

        let errors = buffer.apply(&world);
        assert_eq!(errors, vec![WorldError::InvalidEntity(dead)]);
        assert_eq!(world.get_component::<Score>(live), Some(Score(2)));
    }

    #[test]
    fn test_merge_rightmost_wins() {
        let world = World::new();
        let e = world.create_entity();

        let mut a = CommandBuffer::new();
        a.add_component(e, Score(1));
        let mut b = CommandBuffer::new();
        b.remove_component::<Score>(e);
        let mut c = CommandBuffer::new();
        c.add_component(e, Score(3));
        c.destroy_entity(e);

        let merged = CommandBuffer::merge(vec![a, b, c]);
        assert_eq!(merged.len(), 4);
        merged.apply(&world);

        assert_eq!(world.get_component::<Score>(e), Some(Score(3)));
        assert_eq!(world.pending_destruction_count(), 1);
    }
}
