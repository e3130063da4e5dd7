//! Systems: behaviour which runs against the world every frame.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};
use std::ops::BitOr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::Entity;
use crate::executor::JobExecutor;
use crate::mask::ComponentMask;
use crate::world::World;

/// The number of cached entities above which a parallel iterating system
/// splits its work across the job executor.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 100;

/// The number of entities per job when an iterating system runs in parallel.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// The loop phases a system takes part in.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemPhases(u8);

impl SystemPhases {
    pub const NONE: SystemPhases = SystemPhases(0);
    /// The variable-rate update, once per frame.
    pub const UPDATE: SystemPhases = SystemPhases(1);
    /// The fixed-rate update, zero or more times per frame.
    pub const FIXED_UPDATE: SystemPhases = SystemPhases(2);
    pub const ALL: SystemPhases = SystemPhases(3);

    /// Returns true if every phase in `other` is in this set.
    pub fn contains(self, other: SystemPhases) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SystemPhases {
    type Output = SystemPhases;

    fn bitor(self, rhs: SystemPhases) -> SystemPhases {
        SystemPhases(self.0 | rhs.0)
    }
}

impl Debug for SystemPhases {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        if self.contains(SystemPhases::UPDATE) {
            list.entry(&"update");
        }
        if self.contains(SystemPhases::FIXED_UPDATE) {
            list.entry(&"fixed_update");
        }
        list.finish()
    }
}

/// The lifecycle of a registered system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemState {
    /// Not yet handed to a scheduler.
    Uninitialized,
    /// Registered, but not yet run.
    Initialized,
    Running,
    /// Skipped by updates, but still tracking structural changes.
    Disabled,
    ShutDown,
}

/// What a system can reach during its callbacks.
#[derive(Clone, Debug)]
pub struct SystemContext {
    world: Arc<World>,
    jobs: JobExecutor,
}

impl SystemContext {
    pub fn new(world: Arc<World>, jobs: JobExecutor) -> SystemContext {
        SystemContext {
            world,
            jobs,
        }
    }

    /// The world being simulated.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// The worker pool for batched work.
    pub fn jobs(&self) -> &JobExecutor {
        &self.jobs
    }
}

/// Downcasting support for boxed systems.
///
/// Call these through a `&dyn System`, never on the `Box` itself, or the box
/// is what gets downcast.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// An ECS system.
///
/// Systems run on the engine loop task in ascending `priority` order. A
/// callback which returns an error or panics is reported by the scheduler
/// and skipped for that frame; other systems are unaffected.
#[async_trait]
pub trait System: AsAny + Send + 'static {
    /// The name used in logs, errors and timings.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Lower priorities run first.
    fn priority(&self) -> i32 {
        0
    }

    /// The phases this system runs in.
    fn phases(&self) -> SystemPhases {
        SystemPhases::UPDATE
    }

    /// Called once on registration. An error prevents registration.
    fn on_initialize(&mut self, _ctx: &SystemContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per frame if `phases` includes `UPDATE`.
    async fn on_update(&mut self, _ctx: &SystemContext, _dt: f64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per fixed step if `phases` includes `FIXED_UPDATE`.
    async fn on_fixed_update(&mut self, _ctx: &SystemContext, _dt: f64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the system is removed or the scheduler shuts down.
    fn on_shutdown(&mut self, _ctx: &SystemContext) {}

    /// Called for every entity whose component set changed since the
    /// system last ran, including created and destroyed entities.
    fn notify_structural_change(&mut self, _world: &World, _entity: Entity) {}
}

/// A system which processes every entity matching a component mask.
///
/// Wrap it in `Iterating` to register it with a scheduler.
pub trait IteratingSystem: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn priority(&self) -> i32 {
        0
    }

    fn phases(&self) -> SystemPhases {
        SystemPhases::UPDATE
    }

    /// Entities must have all of these components.
    fn required(&self) -> ComponentMask;

    /// Entities must have none of these components.
    fn excluded(&self) -> ComponentMask {
        ComponentMask::EMPTY
    }

    /// Whether `process_entity` may run for different entities at once.
    fn parallel(&self) -> bool {
        false
    }

    fn on_initialize(&mut self, _ctx: &SystemContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one entity. In parallel mode this runs on worker threads in
    /// no particular order.
    fn process_entity(&self, world: &World, entity: Entity, dt: f64);

    fn on_entity_added(&self, _world: &World, _entity: Entity) {}

    /// Called when an entity stops matching. If it was destroyed it is no
    /// longer valid in `world`.
    fn on_entity_removed(&self, _world: &World, _entity: Entity) {}

    fn on_shutdown(&mut self, _ctx: &SystemContext) {}
}

/// Adapts an `IteratingSystem` into a `System`, keeping the cached set of
/// matching entities.
pub struct Iterating<S> {
    inner: S,
    entities: BTreeSet<Entity>,
    parallel_threshold: usize,
    batch_size: usize,
}

impl<S: IteratingSystem> Iterating<S> {
    pub fn new(inner: S) -> Iterating<S> {
        Iterating {
            inner,
            entities: BTreeSet::new(),
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set how many cached entities it takes to switch to parallel
    /// processing.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Iterating<S> {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Iterating<S> {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// The cached matching entities, in ascending order.
    pub fn entities(&self) -> impl Iterator<Item=Entity> + '_ {
        self.entities.iter().copied()
    }

    /// The number of cached matching entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn matches(&self, world: &World, entity: Entity) -> bool {
        let (required, excluded) = (self.inner.required(), self.inner.excluded());
        world.mask_of(entity)
            .map_or(false, |mask| mask.has_all(&required) && mask.has_none(&excluded))
    }

    fn run(&self, ctx: &SystemContext, dt: f64) {
        let world = ctx.world().as_ref();
        let entities: Vec<Entity> = self.entities.iter().copied().collect();

        if self.inner.parallel() && entities.len() > self.parallel_threshold {
            let inner = &self.inner;
            ctx.jobs().for_each_batch(&entities, self.batch_size, |entity| {
                inner.process_entity(world, *entity, dt);
            });
        } else {
            for entity in entities {
                self.inner.process_entity(world, entity, dt);
            }
        }
    }
}

#[async_trait]
impl<S: IteratingSystem> System for Iterating<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn phases(&self) -> SystemPhases {
        self.inner.phases()
    }

    fn on_initialize(&mut self, ctx: &SystemContext) -> anyhow::Result<()> {
        self.inner.on_initialize(ctx)?;

        let world = ctx.world();
        let existing = world.matching_entities(&self.inner.required(), &self.inner.excluded());
        for entity in existing {
            if self.entities.insert(entity) {
                self.inner.on_entity_added(world, entity);
            }
        }
        Ok(())
    }

    async fn on_update(&mut self, ctx: &SystemContext, dt: f64) -> anyhow::Result<()> {
        self.run(ctx, dt);
        Ok(())
    }

    async fn on_fixed_update(&mut self, ctx: &SystemContext, dt: f64) -> anyhow::Result<()> {
        self.run(ctx, dt);
        Ok(())
    }

    fn on_shutdown(&mut self, ctx: &SystemContext) {
        self.inner.on_shutdown(ctx);
        self.entities.clear();
    }

    fn notify_structural_change(&mut self, world: &World, entity: Entity) {
        let matches = self.matches(world, entity);
        if matches && self.entities.insert(entity) {
            self.inner.on_entity_added(world, entity);
        } else if !matches && self.entities.remove(&entity) {
            self.inner.on_entity_removed(world, entity);
        }
    }
}

impl<S: IteratingSystem> Debug for Iterating<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iterating")
            .field("name", &self.inner.name())
            .field("entities", &self.entities.len())
            .field("parallel_threshold", &self.parallel_threshold)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::component;

    #[derive(Debug, Clone, Default)]
    struct Counter(u32);
    component!(Counter);

    #[derive(Debug, Clone, Default)]
    struct Hidden;
    component!(Hidden);

    #[derive(Default)]
    struct CountUp {
        added: AtomicUsize,
        removed: AtomicUsize,
        parallel: bool,
    }

    impl IteratingSystem for CountUp {
        fn required(&self) -> ComponentMask {
            ComponentMask::of::<Counter>()
        }

        fn excluded(&self) -> ComponentMask {
            ComponentMask::of::<Hidden>()
        }

        fn parallel(&self) -> bool {
            self.parallel
        }

        fn process_entity(&self, world: &World, entity: Entity, _dt: f64) {
            world.with_component_mut::<Counter, _>(entity, |c| c.0 += 1);
        }

        fn on_entity_added(&self, _world: &World, _entity: Entity) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn on_entity_removed(&self, _world: &World, _entity: Entity) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context() -> SystemContext {
        SystemContext::new(Arc::new(World::new()), JobExecutor::new(2).unwrap())
    }

    #[test]
    fn test_phases() {
        let both = SystemPhases::UPDATE | SystemPhases::FIXED_UPDATE;
        assert_eq!(both, SystemPhases::ALL);
        assert!(both.contains(SystemPhases::FIXED_UPDATE));
        assert!(!SystemPhases::UPDATE.contains(SystemPhases::FIXED_UPDATE));
        assert!(SystemPhases::UPDATE.contains(SystemPhases::NONE));
    }

    #[test]
    fn test_iterating_cache() {
        let ctx = context();
        let world = ctx.world().clone();
        let early = world.create_entity();
        world.add_component(early, Counter(0)).unwrap();

        let mut system = Iterating::new(CountUp::default());
        system.on_initialize(&ctx).unwrap();
        assert_eq!(system.entities().collect::<Vec<_>>(), vec![early]);

        let late = world.create_entity();
        world.add_component(late, Counter(0)).unwrap();
        world.add_component(early, Hidden).unwrap();
        for entity in world.take_structural_changes() {
            system.notify_structural_change(&world, entity);
        }

        assert_eq!(system.entities().collect::<Vec<_>>(), vec![late]);
        assert_eq!(system.inner().added.load(Ordering::SeqCst), 2);
        assert_eq!(system.inner().removed.load(Ordering::SeqCst), 1);

        world.destroy_entity(late);
        world.process_deferred_destruction();
        for entity in world.take_structural_changes() {
            system.notify_structural_change(&world, entity);
        }
        assert!(system.is_empty());
        assert_eq!(system.inner().removed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parallel_processes_every_entity_once() {
        let ctx = context();
        let world = ctx.world().clone();
        let entities: Vec<_> = (0..500).map(|_| {
            let e = world.create_entity();
            world.add_component(e, Counter(0)).unwrap();
            e
        }).collect();

        let mut system = Iterating::new(CountUp { parallel: true, ..CountUp::default() })
            .with_parallel_threshold(10)
            .with_batch_size(7);
        system.on_initialize(&ctx).unwrap();
        assert_eq!(system.len(), 500);

        system.on_update(&ctx, 0.016).await.unwrap();
        system.on_fixed_update(&ctx, 0.016).await.unwrap();

        for e in entities {
            assert_eq!(world.get_component::<Counter>(e).map(|c| c.0), Some(2));
        }
    }

    /// Records which thread processed each entity.
    #[derive(Default)]
    struct ThreadRecorder {
        on_worker: AtomicUsize,
        on_caller: AtomicUsize,
    }

    impl IteratingSystem for ThreadRecorder {
        fn required(&self) -> ComponentMask {
            ComponentMask::of::<Counter>()
        }

        fn parallel(&self) -> bool {
            true
        }

        fn process_entity(&self, _world: &World, _entity: Entity, _dt: f64) {
            let on_worker = std::thread::current()
                .name()
                .map_or(false, |name| name.starts_with("stepped-worker"));
            if on_worker {
                self.on_worker.fetch_add(1, Ordering::SeqCst);
            } else {
                self.on_caller.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_default_parallel_threshold() {
        for (count, parallel) in [(DEFAULT_PARALLEL_THRESHOLD, false), (DEFAULT_PARALLEL_THRESHOLD + 1, true)] {
            let ctx = context();
            let world = ctx.world().clone();
            for _ in 0..count {
                let e = world.create_entity();
                world.add_component(e, Counter(0)).unwrap();
            }

            let mut system = Iterating::new(ThreadRecorder::default());
            system.on_initialize(&ctx).unwrap();
            assert_eq!(system.len(), count);
            futures::executor::block_on(system.on_update(&ctx, 0.016)).unwrap();

            let (on_worker, on_caller) = (
                system.inner().on_worker.load(Ordering::SeqCst),
                system.inner().on_caller.load(Ordering::SeqCst),
            );
            if parallel {
                assert_eq!((on_worker, on_caller), (count, 0));
            } else {
                assert_eq!((on_worker, on_caller), (0, count));
            }
        }
    }

    #[test]
    fn test_downcast_through_trait_object() {
        let boxed: Box<dyn System> = Box::new(Iterating::new(CountUp::default()));
        assert!(boxed.as_ref().as_any().downcast_ref::<Iterating<CountUp>>().is_some());
        assert!(boxed.into_any().downcast::<Iterating<CountUp>>().is_ok());
    }
}
