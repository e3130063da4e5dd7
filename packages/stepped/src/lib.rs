//! An entity component system with a fixed-timestep engine loop.
//!
//! A `World` stores entities and their components in per-type pools, keeps a
//! component mask and archetype for every entity, and answers mask queries.
//! Systems are registered with a `SystemScheduler` and driven by an `Engine`,
//! which runs fixed updates, variable updates and deferred destruction each
//! frame. A `JobExecutor` runs data-parallel work on a worker pool.

pub use archetype::{Archetype, ArchetypeID};
pub use command_buffer::CommandBuffer;
pub use component::{
    Component,
    ComponentTypeID,
};
pub use engine::{Engine, EngineConfig, EngineState, FrameInfo};
pub use entity::Entity;
pub use error::{ConfigError, EngineError, JobError, SystemExecutionError, WorldError};
pub use executor::JobExecutor;
pub use job::{JobDependency, JobHandle, JobResult};
pub use mask::ComponentMask;
pub use metadata::EntityMetadata;
pub use metrics::PerformanceMetrics;
pub use query::QueryBuilder;
pub use scheduler::SystemScheduler;
pub use system::{
    Iterating,
    IteratingSystem,
    System,
    SystemContext,
    SystemPhases,
    SystemState,
};
pub use world::World;

pub mod component;
pub mod entity;
pub mod mask;
pub mod pool;
pub mod archetype;
pub mod metadata;

pub mod world;
pub mod query;
mod command_buffer;

pub mod job;
pub mod executor;

pub mod system;
pub mod scheduler;

pub mod timestep;
pub mod metrics;
pub mod engine;

pub mod error;
