//! Ordered, failure-isolated system dispatch.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use futures::FutureExt;

use crate::error::{panic_message, SystemExecutionError};
use crate::system::{System, SystemContext, SystemPhases, SystemState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Update,
    FixedUpdate,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Update => "update",
            Phase::FixedUpdate => "fixed update",
        }
    }

    fn phases(self) -> SystemPhases {
        match self {
            Phase::Update => SystemPhases::UPDATE,
            Phase::FixedUpdate => SystemPhases::FIXED_UPDATE,
        }
    }
}

struct SystemEntry {
    system: Box<dyn System>,
    name: String,
    priority: i32,
    phases: SystemPhases,
    state: SystemState,
}

impl SystemEntry {
    fn is<T: System>(&self) -> bool {
        self.system.as_ref().as_any().is::<T>()
    }
}

/// Runs registered systems in ascending priority order.
///
/// Systems with equal priority run in registration order. Before each
/// system runs, the world's structural changes are fanned out to every
/// registered system so that cached entity sets are current.
pub struct SystemScheduler {
    context: SystemContext,
    systems: Vec<SystemEntry>,
    profiling: bool,
    slow_system_budget: Option<Duration>,
    timings: HashMap<String, f64>,
    errors: Vec<SystemExecutionError>,
}

impl SystemScheduler {
    /// Create a scheduler with no systems.
    pub fn new(context: SystemContext) -> SystemScheduler {
        SystemScheduler {
            context,
            systems: Vec::new(),
            profiling: false,
            slow_system_budget: None,
            timings: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// The context handed to every system callback.
    pub fn context(&self) -> &SystemContext {
        &self.context
    }

    /// Enable or disable per-system timing capture.
    pub fn set_profiling(&mut self, enabled: bool) {
        self.profiling = enabled;
        if !enabled {
            self.timings.clear();
        }
    }

    /// Warn whenever a single system callback takes longer than `budget`.
    pub fn set_slow_system_budget(&mut self, budget: Option<Duration>) {
        self.slow_system_budget = budget;
    }

    /// Initialize a system and add it to the schedule.
    ///
    /// Returns the registered system for further configuration. If
    /// `on_initialize` fails or panics, the system is dropped and the
    /// error returned.
    pub fn register_system<S: System>(&mut self, mut system: S) -> Result<&mut S, SystemExecutionError> {
        let name = system.name().to_owned();
        let context = &self.context;
        let result = catch_unwind(AssertUnwindSafe(|| system.on_initialize(context)));
        let message = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{:#}", err)),
            Err(payload) => Some(panic_message(&*payload)),
        };
        if let Some(message) = message {
            let err = SystemExecutionError { system: name, phase: "initialize", message };
            log::error!("{}", err);
            return Err(err);
        }

        let priority = system.priority();
        let phases = system.phases();
        let idx = self.systems.partition_point(|e| e.priority <= priority);
        self.systems.insert(idx, SystemEntry {
            system: Box::new(system),
            name,
            priority,
            phases,
            state: SystemState::Initialized,
        });
        log::debug!("registered system '{}' (priority {}, {:?})", self.systems[idx].name, priority, phases);

        let registered = self.systems[idx].system.as_mut().as_any_mut().downcast_mut::<S>();
        Ok(registered.expect("registered system has the inserted type"))
    }

    fn find<T: System>(&self) -> Option<usize> {
        self.systems.iter().position(|e| e.is::<T>())
    }

    /// Find the first registered system of type `T`.
    pub fn get_system<T: System>(&self) -> Option<&T> {
        let idx = self.find::<T>()?;
        self.systems[idx].system.as_ref().as_any().downcast_ref::<T>()
    }

    /// Find the first registered system of type `T`, mutably.
    pub fn get_system_mut<T: System>(&mut self) -> Option<&mut T> {
        let idx = self.find::<T>()?;
        self.systems[idx].system.as_mut().as_any_mut().downcast_mut::<T>()
    }

    /// Shut down and remove the first registered system of type `T`.
    pub fn remove_system<T: System>(&mut self) -> Option<T> {
        let idx = self.find::<T>()?;
        let mut entry = self.systems.remove(idx);
        if entry.state != SystemState::ShutDown {
            self.shutdown_entry(&mut entry);
        }
        log::debug!("removed system '{}'", entry.name);

        entry.system.into_any().downcast::<T>().ok().map(|s| *s)
    }

    /// Enable or disable the first registered system of type `T`.
    ///
    /// Returns false if there is no such system or it has shut down.
    /// Disabled systems still track structural changes.
    pub fn set_enabled<T: System>(&mut self, enabled: bool) -> bool {
        let idx = match self.find::<T>() {
            Some(idx) => idx,
            None => return false,
        };

        let entry = &mut self.systems[idx];
        match entry.state {
            SystemState::Initialized | SystemState::Running | SystemState::Disabled => {
                entry.state = if enabled { SystemState::Running } else { SystemState::Disabled };
                true
            }
            _ => false,
        }
    }

    /// Get the lifecycle state of the first registered system of type `T`.
    pub fn state_of<T: System>(&self) -> Option<SystemState> {
        self.find::<T>().map(|idx| self.systems[idx].state)
    }

    /// The names of the registered systems in execution order.
    pub fn system_names(&self) -> Vec<String> {
        self.systems.iter().map(|e| e.name.clone()).collect()
    }

    /// Get the number of registered systems.
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// The most recent callback duration of each system, in milliseconds.
    ///
    /// Empty unless profiling is enabled.
    pub fn system_timings(&self) -> HashMap<String, f64> {
        self.timings.clone()
    }

    /// Take the failures recorded since the last call.
    pub fn take_errors(&mut self) -> Vec<SystemExecutionError> {
        std::mem::take(&mut self.errors)
    }

    /// Deliver pending structural changes to every live system.
    pub fn dispatch_structural_changes(&mut self) {
        let world = self.context.world().clone();
        if !world.has_structural_changes() {
            return;
        }

        let mut seen = HashSet::new();
        let changes: Vec<_> = world.take_structural_changes()
            .into_iter()
            .filter(|e| seen.insert(*e))
            .collect();

        for entry in self.systems.iter_mut() {
            if entry.state == SystemState::ShutDown {
                continue;
            }

            let system = &mut entry.system;
            let result = catch_unwind(AssertUnwindSafe(|| {
                for entity in changes.iter() {
                    system.notify_structural_change(&world, *entity);
                }
            }));
            if let Err(payload) = result {
                let err = SystemExecutionError {
                    system: entry.name.clone(),
                    phase: "structural change",
                    message: panic_message(&*payload),
                };
                log::error!("{}", err);
                self.errors.push(err);
            }
        }
    }

    /// Run every enabled update system once.
    pub async fn update(&mut self, dt: f64) {
        self.run_phase(Phase::Update, dt).await;
    }

    /// Run every enabled fixed-update system once.
    pub async fn fixed_update(&mut self, dt: f64) {
        self.run_phase(Phase::FixedUpdate, dt).await;
    }

    async fn run_phase(&mut self, phase: Phase, dt: f64) {
        for idx in 0..self.systems.len() {
            {
                let entry = &self.systems[idx];
                let runnable = matches!(entry.state, SystemState::Initialized | SystemState::Running);
                if !runnable || !entry.phases.contains(phase.phases()) {
                    continue;
                }
            }

            self.dispatch_structural_changes();

            let context = self.context.clone();
            let entry = &mut self.systems[idx];
            entry.state = SystemState::Running;
            let start = Instant::now();
            let result = {
                let future = match phase {
                    Phase::Update => entry.system.on_update(&context, dt),
                    Phase::FixedUpdate => entry.system.on_fixed_update(&context, dt),
                };
                AssertUnwindSafe(future).catch_unwind().await
            };
            let elapsed = start.elapsed();

            if self.profiling {
                self.timings.insert(entry.name.clone(), elapsed.as_secs_f64() * 1000.0);
            }
            if let Some(budget) = self.slow_system_budget {
                if elapsed > budget {
                    log::warn!("system '{}' took {:?} during {} (budget {:?})",
                               entry.name, elapsed, phase.label(), budget);
                }
            }

            let message = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{:#}", err)),
                Err(payload) => Some(panic_message(&*payload)),
            };
            if let Some(message) = message {
                let err = SystemExecutionError {
                    system: entry.name.clone(),
                    phase: phase.label(),
                    message,
                };
                log::error!("{}", err);
                self.errors.push(err);
            }
        }
    }

    fn shutdown_entry(&self, entry: &mut SystemEntry) {
        let system = &mut entry.system;
        let context = &self.context;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| system.on_shutdown(context))) {
            log::error!("system '{}' panicked during shutdown: {}", entry.name, panic_message(&*payload));
        }
        entry.state = SystemState::ShutDown;
    }

    /// Shut down every system, in reverse execution order.
    ///
    /// Shut down systems stay registered but never run again.
    pub fn shutdown(&mut self) {
        let mut systems = std::mem::take(&mut self.systems);
        for entry in systems.iter_mut().rev() {
            if entry.state != SystemState::ShutDown {
                self.shutdown_entry(entry);
            }
        }
        self.systems = systems;
        log::debug!("scheduler shut down");
    }
}

impl Debug for SystemScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let systems: Vec<_> = self.systems.iter()
            .map(|e| (&e.name, e.priority, e.state))
            .collect();
        f.debug_struct("SystemScheduler")
            .field("systems", &systems)
            .field("profiling", &self.profiling)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;
    use async_trait::async_trait;

    use super::*;
    use crate::component;
    use crate::entity::Entity;
    use crate::executor::JobExecutor;
    use crate::world::World;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        priority: i32,
        phases: SystemPhases,
        log: Log,
        shut_down: bool,
    }

    impl Recorder {
        fn new(name: &'static str, priority: i32, log: &Log) -> Recorder {
            Recorder {
                name,
                priority,
                phases: SystemPhases::UPDATE,
                log: log.clone(),
                shut_down: false,
            }
        }

        fn with_phases(mut self, phases: SystemPhases) -> Recorder {
            self.phases = phases;
            self
        }
    }

    #[async_trait]
    impl System for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn phases(&self) -> SystemPhases {
            self.phases
        }

        async fn on_update(&mut self, _ctx: &SystemContext, _dt: f64) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name.to_owned());
            Ok(())
        }

        async fn on_fixed_update(&mut self, _ctx: &SystemContext, _dt: f64) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{} (fixed)", self.name));
            Ok(())
        }

        fn on_shutdown(&mut self, _ctx: &SystemContext) {
            self.shut_down = true;
            self.log.lock().unwrap().push(format!("{} shutdown", self.name));
        }
    }

    struct Failing {
        panic: bool,
    }

    #[async_trait]
    impl System for Failing {
        fn name(&self) -> &str {
            if self.panic { "panicking" } else { "erroring" }
        }

        async fn on_update(&mut self, _ctx: &SystemContext, _dt: f64) -> anyhow::Result<()> {
            if self.panic {
                panic!("system exploded");
            }
            bail!("system gave up")
        }
    }

    struct RefusesInit;

    #[async_trait]
    impl System for RefusesInit {
        fn on_initialize(&mut self, _ctx: &SystemContext) -> anyhow::Result<()> {
            bail!("missing resource")
        }
    }

    fn scheduler() -> SystemScheduler {
        SystemScheduler::new(SystemContext::new(Arc::new(World::new()), JobExecutor::new(1).unwrap()))
    }

    fn take(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[tokio::test]
    async fn test_priority_order() {
        let log = Log::default();
        let mut scheduler = scheduler();

        scheduler.register_system(Recorder::new("b", 10, &log)).unwrap();
        scheduler.register_system(Recorder::new("a", -5, &log)).unwrap();
        scheduler.register_system(Recorder::new("c", 10, &log).with_phases(SystemPhases::ALL)).unwrap();
        scheduler.register_system(Recorder::new("f", 0, &log).with_phases(SystemPhases::FIXED_UPDATE)).unwrap();
        assert_eq!(scheduler.system_names(), vec!["a", "f", "b", "c"]);

        scheduler.fixed_update(1.0 / 60.0).await;
        assert_eq!(take(&log), vec!["f (fixed)", "c (fixed)"]);

        scheduler.update(0.016).await;
        assert_eq!(take(&log), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let log = Log::default();
        let mut scheduler = scheduler();
        scheduler.set_profiling(true);

        scheduler.register_system(Failing { panic: true }).unwrap();
        scheduler.register_system(Failing { panic: false }).unwrap();
        scheduler.register_system(Recorder::new("after", 1, &log)).unwrap();

        scheduler.update(0.016).await;
        assert_eq!(take(&log), vec!["after"]);

        let errors = scheduler.take_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].system, "panicking");
        assert_eq!(errors[0].message, "system exploded");
        assert_eq!(errors[1].system, "erroring");
        assert_eq!(errors[1].message, "system gave up");
        assert!(scheduler.take_errors().is_empty());

        // Failed systems are still timed.
        let timings = scheduler.system_timings();
        assert!(timings.contains_key("panicking"));
        assert!(timings.contains_key("erroring"));
        assert!(timings.contains_key("after"));
    }

    #[test]
    fn test_failed_initialize_is_not_registered() {
        let mut scheduler = scheduler();
        let err = scheduler.register_system(RefusesInit).err().unwrap();
        assert_eq!(err.phase, "initialize");
        assert_eq!(err.message, "missing resource");
        assert!(scheduler.is_empty());
        assert!(scheduler.get_system::<RefusesInit>().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let log = Log::default();
        let mut scheduler = scheduler();
        scheduler.register_system(Recorder::new("only", 0, &log)).unwrap();
        assert_eq!(scheduler.state_of::<Recorder>(), Some(SystemState::Initialized));
        scheduler.update(0.016).await;
        assert_eq!(take(&log), vec!["only"]);
        assert_eq!(scheduler.state_of::<Recorder>(), Some(SystemState::Running));

        assert!(scheduler.set_enabled::<Recorder>(false));
        assert_eq!(scheduler.state_of::<Recorder>(), Some(SystemState::Disabled));
        scheduler.update(0.016).await;
        assert!(take(&log).is_empty());

        assert!(scheduler.set_enabled::<Recorder>(true));
        scheduler.update(0.016).await;
        assert_eq!(take(&log), vec!["only"]);

        scheduler.get_system_mut::<Recorder>().unwrap().name = "renamed";
        assert_eq!(scheduler.get_system::<Recorder>().unwrap().name, "renamed");

        let removed = scheduler.remove_system::<Recorder>().unwrap();
        assert!(removed.shut_down);
        assert!(scheduler.is_empty());
        assert!(scheduler.remove_system::<Recorder>().is_none());
        assert!(!scheduler.set_enabled::<Recorder>(true));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let log = Log::default();
        let mut scheduler = scheduler();
        scheduler.register_system(Recorder::new("first", 0, &log)).unwrap();
        scheduler.register_system(Recorder::new("second", 1, &log)).unwrap();

        scheduler.shutdown();
        assert_eq!(take(&log), vec!["second shutdown", "first shutdown"]);
        assert_eq!(scheduler.state_of::<Recorder>(), Some(SystemState::ShutDown));
        assert!(!scheduler.set_enabled::<Recorder>(true));

        scheduler.update(0.016).await;
        assert!(take(&log).is_empty());
    }

    #[derive(Debug, Clone)]
    struct Marker;
    component!(Marker);

    #[derive(Default)]
    struct Watcher {
        seen: Vec<Entity>,
    }

    #[async_trait]
    impl System for Watcher {
        fn notify_structural_change(&mut self, _world: &World, entity: Entity) {
            self.seen.push(entity);
        }
    }

    struct Spawner;

    #[async_trait]
    impl System for Spawner {
        fn priority(&self) -> i32 {
            -1
        }

        async fn on_update(&mut self, ctx: &SystemContext, _dt: f64) -> anyhow::Result<()> {
            let e = ctx.world().create_entity();
            ctx.world().add_component(e, Marker)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_structural_changes_reach_later_systems() {
        let mut scheduler = scheduler();
        scheduler.register_system(Spawner).unwrap();
        scheduler.register_system(Watcher::default()).unwrap();

        scheduler.update(0.016).await;

        // The spawner ran first; the watcher saw the new entity once before
        // its own update.
        let seen = &scheduler.get_system::<Watcher>().unwrap().seen;
        assert_eq!(seen.len(), 1);
        assert!(scheduler.context().world().has_component::<Marker>(seen[0]));
    }
}
