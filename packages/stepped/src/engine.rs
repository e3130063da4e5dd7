//! The fixed-timestep engine loop.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::lock::Mutex;
use tokio::task::JoinHandle;

use crate::error::{ConfigError, EngineError, SystemExecutionError};
use crate::executor::JobExecutor;
use crate::metrics::{MetricsRecorder, PerformanceMetrics};
use crate::scheduler::SystemScheduler;
use crate::system::{System, SystemContext};
use crate::timestep::FixedTimestep;
use crate::world::World;

/// Engine loop settings.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Seconds per fixed update.
    pub fixed_time_step: f64,
    /// Frames per second to pace the loop to; zero means uncapped.
    pub target_fps: f64,
    /// The longest frame delta accounted for, in seconds.
    pub max_frame_time: f64,
    pub max_fixed_updates_per_frame: u32,
    pub worker_threads: usize,
    /// Capture per-system timings.
    pub enable_profiling: bool,
    /// Warn when a single system callback runs longer than this.
    pub slow_system_budget: Option<Duration>,
}

impl EngineConfig {
    pub fn with_fixed_time_step(mut self, seconds: f64) -> EngineConfig {
        self.fixed_time_step = seconds;
        self
    }

    pub fn with_target_fps(mut self, fps: f64) -> EngineConfig {
        self.target_fps = fps;
        self
    }

    pub fn with_max_frame_time(mut self, seconds: f64) -> EngineConfig {
        self.max_frame_time = seconds;
        self
    }

    pub fn with_max_fixed_updates_per_frame(mut self, count: u32) -> EngineConfig {
        self.max_fixed_updates_per_frame = count;
        self
    }

    pub fn with_worker_threads(mut self, count: usize) -> EngineConfig {
        self.worker_threads = count;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> EngineConfig {
        self.enable_profiling = enabled;
        self
    }

    pub fn with_slow_system_budget(mut self, budget: Option<Duration>) -> EngineConfig {
        self.slow_system_budget = budget;
        self
    }

    /// Check that the settings describe a loop which can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_time_step.is_finite() && self.fixed_time_step > 0.0) {
            return Err(ConfigError::FixedTimeStep(self.fixed_time_step));
        }
        if !(self.max_frame_time >= self.fixed_time_step) {
            return Err(ConfigError::MaxFrameTime {
                max_frame_time: self.max_frame_time,
                fixed_time_step: self.fixed_time_step,
            });
        }
        if !(self.target_fps.is_finite() && self.target_fps >= 0.0) {
            return Err(ConfigError::TargetFps(self.target_fps));
        }
        if self.max_fixed_updates_per_frame == 0 {
            return Err(ConfigError::MaxFixedUpdates);
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::WorkerThreads);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        EngineConfig {
            fixed_time_step: 1.0 / 60.0,
            target_fps: 0.0,
            max_frame_time: 0.25,
            max_fixed_updates_per_frame: 5,
            worker_threads: cores.saturating_sub(1).max(1),
            enable_profiling: false,
            slow_system_budget: None,
        }
    }
}

/// The engine lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Initialized,
    Running,
    Paused,
}

/// Timing for one loop iteration, handed to the frame callback.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameInfo {
    /// The clamped frame delta, in seconds.
    pub delta_time: f64,
    pub fixed_delta_time: f64,
    /// How far between the previous and the next fixed step this frame
    /// sits, for interpolation.
    pub alpha: f64,
    /// Zero-based.
    pub frame_number: u64,
    /// Averaged over the recent frames, including this one.
    pub fps: f64,
}

type FrameCallback = Box<dyn FnMut(&FrameInfo) + Send + 'static>;

struct FrameState {
    timestep: FixedTimestep,
    recorder: MetricsRecorder,
    frame_number: u64,
}

struct EngineShared {
    config: EngineConfig,
    world: Arc<World>,
    jobs: JobExecutor,
    scheduler: Mutex<SystemScheduler>,
    frame: Mutex<FrameState>,
    state: StdMutex<EngineState>,
    run_id: AtomicU64,
    on_frame: StdMutex<Option<FrameCallback>>,
    metrics: StdMutex<PerformanceMetrics>,
    timings: StdMutex<HashMap<String, f64>>,
}

impl EngineShared {
    fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: EngineState) {
        let mut current = self.state.lock().unwrap();
        if *current != state {
            log::info!("engine {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Run one loop iteration, without pacing.
    async fn run_frame(&self, delta: f64) -> FrameInfo {
        let mut frame = self.frame.lock().await;
        let plan = frame.timestep.advance(delta);
        let fixed_delta_time = frame.timestep.fixed_time_step();

        let (update_time, fixed_update_time) = {
            let mut scheduler = self.scheduler.lock().await;

            let start = Instant::now();
            for _ in 0..plan.steps {
                scheduler.fixed_update(fixed_delta_time).await;
            }
            let fixed_update_time = start.elapsed();

            let start = Instant::now();
            scheduler.update(plan.delta).await;
            let update_time = start.elapsed();

            if self.config.enable_profiling {
                *self.timings.lock().unwrap() = scheduler.system_timings();
            }
            (update_time, fixed_update_time)
        };

        frame.recorder.record_frame(plan.delta, update_time, fixed_update_time);
        let metrics = frame.recorder.current();
        *self.metrics.lock().unwrap() = metrics;

        let info = FrameInfo {
            delta_time: plan.delta,
            fixed_delta_time,
            alpha: plan.alpha,
            frame_number: frame.frame_number,
            fps: metrics.fps,
        };
        frame.frame_number += 1;
        if let Some(callback) = self.on_frame.lock().unwrap().as_mut() {
            callback(&info);
        }

        self.world.process_deferred_destruction();
        // Drain the change log even if no system ran this frame, so caches
        // see this frame's removals and the log stays bounded.
        self.scheduler.lock().await.dispatch_structural_changes();
        info
    }

    async fn run_loop(self: Arc<Self>, run_id: u64) {
        let mut last = Instant::now();
        loop {
            if self.state() != EngineState::Running || self.run_id.load(Ordering::Acquire) != run_id {
                break;
            }

            let frame_start = Instant::now();
            let delta = frame_start.duration_since(last).as_secs_f64();
            last = frame_start;

            self.run_frame(delta).await;

            if self.config.target_fps > 0.0 {
                let deadline = frame_start + Duration::from_secs_f64(1.0 / self.config.target_fps);
                tokio::time::sleep_until(deadline.into()).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        log::debug!("engine loop {} exited", run_id);
    }
}

/// Owns a world, its systems and a job executor, and drives them with a
/// fixed-timestep loop.
///
/// Each frame runs the owed fixed updates, then one variable update. Metrics
/// are recorded before the frame callback, and deferred entity destruction
/// follows it, after which every system hears about the frame's structural
/// changes.
pub struct Engine {
    shared: Arc<EngineShared>,
    initialized: bool,
    task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Create an engine with an empty world.
    pub fn new(config: EngineConfig) -> Result<Engine, EngineError> {
        Engine::with_world(config, Arc::new(World::new()))
    }

    /// Create an engine around an existing world.
    pub fn with_world(config: EngineConfig, world: Arc<World>) -> Result<Engine, EngineError> {
        config.validate()?;

        let jobs = JobExecutor::new(config.worker_threads)
            .map_err(|err| EngineError::Executor(err.to_string()))?;
        let mut scheduler = SystemScheduler::new(SystemContext::new(world.clone(), jobs.clone()));
        scheduler.set_profiling(config.enable_profiling);
        scheduler.set_slow_system_budget(config.slow_system_budget);

        let frame = FrameState {
            timestep: FixedTimestep::new(
                config.fixed_time_step,
                config.max_frame_time,
                config.max_fixed_updates_per_frame,
            ),
            recorder: MetricsRecorder::default(),
            frame_number: 0,
        };

        Ok(Engine {
            shared: Arc::new(EngineShared {
                config,
                world,
                jobs,
                scheduler: Mutex::new(scheduler),
                frame: Mutex::new(frame),
                state: StdMutex::new(EngineState::Stopped),
                run_id: AtomicU64::new(0),
                on_frame: StdMutex::new(None),
                metrics: StdMutex::new(PerformanceMetrics::default()),
                timings: StdMutex::new(HashMap::new()),
            }),
            initialized: false,
            task: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn world(&self) -> &Arc<World> {
        &self.shared.world
    }

    pub fn jobs(&self) -> &JobExecutor {
        &self.shared.jobs
    }

    /// The scheduler, for registering and inspecting systems.
    ///
    /// The loop holds this lock for the duration of each frame's updates.
    pub fn scheduler(&self) -> &Mutex<SystemScheduler> {
        &self.shared.scheduler
    }

    /// Register a system with the scheduler.
    pub async fn register_system<S: System>(&self, system: S) -> Result<(), SystemExecutionError> {
        self.shared.scheduler.lock().await.register_system(system).map(|_| ())
    }

    /// Set the sink which receives every frame's `FrameInfo`.
    pub fn set_frame_callback(&self, callback: impl FnMut(&FrameInfo) + Send + 'static) {
        *self.shared.on_frame.lock().unwrap() = Some(Box::new(callback));
    }

    /// Aggregate metrics as of the last completed frame.
    pub fn metrics(&self) -> PerformanceMetrics {
        *self.shared.metrics.lock().unwrap()
    }

    /// Per-system timings in milliseconds as of the last completed frame.
    ///
    /// Empty unless profiling is enabled.
    pub fn system_timings(&self) -> HashMap<String, f64> {
        self.shared.timings.lock().unwrap().clone()
    }

    /// Take the system failures recorded since the last call.
    pub async fn take_system_errors(&self) -> Vec<SystemExecutionError> {
        self.shared.scheduler.lock().await.take_errors()
    }

    /// Prepare the engine to run. May only be called once.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Err(EngineError::AlreadyInitialized);
        }

        self.initialized = true;
        self.shared.set_state(EngineState::Initialized);
        Ok(())
    }

    fn expect_state(&self, operation: &'static str, allowed: &[EngineState]) -> Result<EngineState, EngineError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(EngineError::InvalidState { operation, state })
        }
    }

    fn spawn_loop(&mut self) -> Result<(), EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let run_id = self.shared.run_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.set_state(EngineState::Running);
        self.task = Some(runtime.spawn(self.shared.clone().run_loop(run_id)));
        Ok(())
    }

    /// Start the loop task on the current tokio runtime.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.expect_state("start", &[EngineState::Initialized])?;
        self.spawn_loop()
    }

    /// Stop running frames after the current one.
    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.expect_state("pause", &[EngineState::Running])?;
        self.shared.set_state(EngineState::Paused);
        Ok(())
    }

    /// Continue a paused loop.
    ///
    /// The frame clock restarts, so time spent paused is not simulated.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.expect_state("resume", &[EngineState::Paused])?;
        self.spawn_loop()
    }

    /// Run a single frame with a caller-chosen delta, in seconds.
    ///
    /// Only valid while the loop task is not running.
    pub async fn step(&self, delta: f64) -> Result<FrameInfo, EngineError> {
        self.expect_state("step", &[EngineState::Initialized, EngineState::Paused])?;
        Ok(self.shared.run_frame(delta).await)
    }

    /// Cancel the loop, shut down every system and drop pending jobs.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        self.expect_state("stop", &[EngineState::Initialized, EngineState::Running, EngineState::Paused])?;
        self.shared.set_state(EngineState::Stopped);

        if let Some(task) = self.task.take() {
            task.abort();
            // Cancellation is the expected outcome.
            let _ = task.await;
        }

        self.shared.scheduler.lock().await.shutdown();
        self.shared.jobs.shutdown();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}
