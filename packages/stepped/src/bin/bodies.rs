use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stepped::{
    component,
    Component,
    ComponentMask,
    Engine,
    EngineConfig,
    Entity,
    Iterating,
    IteratingSystem,
    SystemContext,
    SystemPhases,
    World,
};

const G: f32 = 10.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct Position(f32, f32);
component!(Position);

#[derive(Debug, Clone, Copy, Default)]
pub struct Velocity(f32, f32);
component!(Velocity);

#[derive(Debug, Clone, Copy, Default)]
pub struct Mass(f32);
component!(Mass);

/// Bodies which overlapped another body and have been absorbed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Absorbed;
component!(Absorbed);

/// Accumulates gravity from every other body into each body's velocity.
struct ApplyAcceleration;

impl IteratingSystem for ApplyAcceleration {
    fn priority(&self) -> i32 {
        0
    }

    fn phases(&self) -> SystemPhases {
        SystemPhases::FIXED_UPDATE
    }

    fn required(&self) -> ComponentMask {
        ComponentMask::of::<Position>()
            .with(Velocity::component_type())
            .with(Mass::component_type())
    }

    fn excluded(&self) -> ComponentMask {
        ComponentMask::of::<Absorbed>()
    }

    fn parallel(&self) -> bool {
        true
    }

    fn process_entity(&self, world: &World, entity: Entity, dt: f64) {
        let dt = dt as f32;
        let (Some(Position(x_a, y_a)), Some(Mass(m_a))) =
            (world.get_component::<Position>(entity), world.get_component::<Mass>(entity)) else {
            return;
        };
        if m_a <= 0.0 {
            return;
        }

        let (mut ax, mut ay) = (0f32, 0f32);
        let mut overlapped = false;
        world.for_each::<Position>(|other, &Position(x_b, y_b)| {
            if other == entity {
                return;
            }
            let Some(Mass(m_b)) = world.get_component::<Mass>(other) else {
                return;
            };
            if m_b < 0.00001 {
                return;
            }

            let dx = x_b - x_a;
            let dy = y_b - y_a;
            let r2 = dx * dx + dy * dy;
            if r2 < 0.0005 {
                overlapped |= m_b >= m_a;
                return;
            }

            let a = (G * m_b) / r2;
            let r = r2.sqrt();
            ax += (dx * a) / r;
            ay += (dy * a) / r;
        });

        if overlapped {
            log::debug!("{:?} was absorbed", entity);
            if world.add_component(entity, Absorbed).is_ok() {
                world.with_component_mut::<Mass, _>(entity, |Mass(m)| *m = 0.0);
            }
            return;
        }

        world.with_component_mut::<Velocity, _>(entity, |Velocity(vx, vy)| {
            *vx += dt * ax;
            *vy += dt * ay;
        });
    }
}

struct ApplyVelocity;

impl IteratingSystem for ApplyVelocity {
    fn priority(&self) -> i32 {
        10
    }

    fn phases(&self) -> SystemPhases {
        SystemPhases::FIXED_UPDATE
    }

    fn required(&self) -> ComponentMask {
        ComponentMask::of::<Position>().with(Velocity::component_type())
    }

    fn process_entity(&self, world: &World, entity: Entity, dt: f64) {
        let dt = dt as f32;
        if let Some(Velocity(vx, vy)) = world.get_component::<Velocity>(entity) {
            world.with_component_mut::<Position, _>(entity, |Position(x, y)| {
                *x += dt * vx;
                *y += dt * vy;
            });
        }
    }
}

/// Destroys bodies which have left the simulation bounds.
struct Bounds {
    limit: f32,
}

impl IteratingSystem for Bounds {
    fn priority(&self) -> i32 {
        20
    }

    fn required(&self) -> ComponentMask {
        ComponentMask::of::<Position>()
    }

    fn on_initialize(&mut self, ctx: &SystemContext) -> anyhow::Result<()> {
        log::info!("bounds check over {} entities", ctx.world().entity_count());
        Ok(())
    }

    fn process_entity(&self, world: &World, entity: Entity, _dt: f64) {
        if let Some(Position(x, y)) = world.get_component::<Position>(entity) {
            if x.abs() > self.limit || y.abs() > self.limit {
                log::debug!("{:?} left the simulation", entity);
                world.destroy_entity(entity);
            }
        }
    }

    fn on_entity_removed(&self, _world: &World, entity: Entity) {
        log::trace!("{:?} no longer tracked", entity);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = EngineConfig::default()
        .with_fixed_time_step(1.0 / 120.0)
        .with_target_fps(60.0)
        .with_profiling(true);
    let mut engine = Engine::new(config)?;

    {
        let world = engine.world();
        let system = world.create_named_entity("system");

        const SQRT_NUM_ENTITIES: usize = 16;
        const SCALE: f32 = 2.0 / ((SQRT_NUM_ENTITIES - 1) as f32);

        for x in 0..SQRT_NUM_ENTITIES {
            for y in 0..SQRT_NUM_ENTITIES {
                let x = ((x as f32) * SCALE) - 1.0;
                let y = ((y as f32) * SCALE) - 1.0;

                let body = world.create_entity();
                world.add_component(body, Position(x, y))?;
                world.add_component(body, Velocity::default())?;
                world.add_component(body, Mass(0.001))?;
                world.set_parent(body, Some(system))?;
            }
        }
    }

    engine.register_system(Iterating::new(ApplyAcceleration).with_parallel_threshold(32)).await?;
    engine.register_system(Iterating::new(ApplyVelocity)).await?;
    engine.register_system(Iterating::new(Bounds { limit: 10.0 })).await?;

    let frames = Arc::new(AtomicU64::new(0));
    let counter = frames.clone();
    engine.set_frame_callback(move |info| {
        counter.store(info.frame_number + 1, Ordering::Relaxed);
        if info.frame_number % 60 == 0 {
            log::info!("frame {} alpha {:.2} fps {:.1}", info.frame_number, info.alpha, info.fps);
        }
    });

    engine.initialize()?;
    engine.start()?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    engine.stop().await?;

    let metrics = engine.metrics();
    println!("frames: {}", frames.load(Ordering::Relaxed));
    println!("metrics: {:?}", metrics);
    println!("bodies remaining: {}", engine.world().query().with::<Position>().count());

    let mut timings: Vec<_> = engine.system_timings().into_iter().collect();
    timings.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, ms) in timings {
        println!("  {}: {:.3}ms", name, ms);
    }

    for err in engine.take_system_errors().await {
        eprintln!("error: {}", err);
    }

    Ok(())
}
