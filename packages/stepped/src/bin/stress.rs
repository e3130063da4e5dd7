use std::sync::Arc;
use std::time::Instant;

use stepped::{CommandBuffer, component, Entity, JobExecutor, World};

#[derive(Debug, Clone, Copy, Default)]
pub struct MyComponent(i32);
component!(MyComponent);

#[derive(Debug, Clone, Copy, Default)]
pub struct Marker;
component!(Marker);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let world = Arc::new(World::new());
    let jobs = JobExecutor::new(4)?;
    let mut to_delete: Vec<Entity> = Vec::new();
    let start = Instant::now();

    for round in 0..8 {
        // Build one command buffer per worker, then apply them in order.
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let world = world.clone();
                let to_delete = to_delete.clone();
                jobs.schedule(move || {
                    let mut command_buffer = CommandBuffer::new();
                    for entity in to_delete.iter().skip(worker).step_by(4) {
                        command_buffer.remove_component::<MyComponent>(*entity);
                        command_buffer.destroy_entity(*entity);
                    }

                    for idx in 0..512 {
                        let entity = world.create_entity();
                        command_buffer.add_component(entity, MyComponent(idx));
                        if idx % 3 == 0 {
                            command_buffer.add_component(entity, Marker);
                        }
                    }
                    command_buffer
                })
            })
            .collect();

        let mut buffers = Vec::with_capacity(handles.len());
        for handle in handles {
            buffers.push(handle.wait()?);
        }

        let errors = CommandBuffer::merge(buffers).apply(&world);
        for err in &errors {
            log::warn!("round {}: {}", round, err);
        }
        world.process_deferred_destruction();

        to_delete = world.query()
            .with::<MyComponent>()
            .execute()
            .into_iter()
            .filter(|entity| entity.index() % 12 == 11)
            .collect();

        println!(
            "round {}: {} entities, {} marked, {} archetypes",
            round,
            world.entity_count(),
            world.query().with::<Marker>().count(),
            world.archetype_count(),
        );
    }

    jobs.shutdown();
    println!("finished in {:?}", start.elapsed());
    Ok(())
}
