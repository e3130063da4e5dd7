//! Error types.
//!
//! None of these represent corruption: an invalid entity is reported and
//! otherwise ignored, a failing system is skipped for the frame, and a failing
//! job resolves its handle with an error. Callers decide whether to surface
//! them.

use thiserror::Error;

use crate::engine::EngineState;
use crate::entity::Entity;

/// Errors from structural operations on a `World`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    /// The entity was destroyed, never existed, or is `Entity::NULL`.
    #[error("entity {0:?} is not valid")]
    InvalidEntity(Entity),

    /// The requested parent is the child itself or one of its descendants.
    #[error("cannot parent {child:?} to {parent:?}: it would create a cycle")]
    HierarchyCycle {
        child: Entity,
        parent: Entity,
    },
}

/// A system callback returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("system '{system}' failed during {phase}: {message}")]
pub struct SystemExecutionError {
    /// The name of the failing system.
    pub system: String,
    /// The callback that failed (`initialize`, `update`, `fixed update`).
    pub phase: &'static str,
    /// The rendered error or panic payload.
    pub message: String,
}

/// Why a job did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job panicked; the message is the panic payload if it was a string.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// A fallible job returned an error.
    #[error("job failed: {0}")]
    Failed(String),

    /// The executor shut down before the job ran.
    #[error("job cancelled before it ran")]
    Cancelled,
}

/// Rejected `EngineConfig` values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("fixed time step must be positive and finite, got {0}")]
    FixedTimeStep(f64),

    #[error("max frame time ({max_frame_time}) must be at least the fixed time step ({fixed_time_step})")]
    MaxFrameTime {
        max_frame_time: f64,
        fixed_time_step: f64,
    },

    #[error("target fps must be finite and non-negative, got {0}")]
    TargetFps(f64),

    #[error("max fixed updates per frame must be at least 1")]
    MaxFixedUpdates,

    #[error("worker thread count must be at least 1")]
    WorkerThreads,
}

/// Errors from engine lifecycle calls.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine is already initialized")]
    AlreadyInitialized,

    #[error("cannot {operation} while the engine is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to start job executor: {0}")]
    Executor(String),

    #[error("the engine loop must be started from within a tokio runtime")]
    NoRuntime,
}

/// Render a `catch_unwind` payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
