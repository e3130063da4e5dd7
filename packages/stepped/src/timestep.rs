//! Fixed-timestep accumulation.

/// What a single frame should simulate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepPlan {
    /// The frame delta after clamping, in seconds.
    pub delta: f64,
    /// How many fixed steps to run.
    pub steps: u32,
    /// Simulation time discarded by the step cap, in seconds.
    pub dropped: f64,
    /// How far the accumulator is into the next fixed step, in `[0, 1)`.
    pub alpha: f64,
}

/// Converts variable frame deltas into a whole number of fixed steps.
///
/// Each frame's delta is clamped to `max_frame_time` and added to an
/// accumulator, which is drained one fixed step at a time up to
/// `max_steps`. If the cap is reached with a full step still owed, the
/// accumulator is reset to zero: the simulation loses time rather than
/// falling further behind.
#[derive(Clone, Debug)]
pub struct FixedTimestep {
    fixed_time_step: f64,
    max_frame_time: f64,
    max_steps: u32,
    accumulator: f64,
    total_steps: u64,
}

impl FixedTimestep {
    pub fn new(fixed_time_step: f64, max_frame_time: f64, max_steps: u32) -> FixedTimestep {
        FixedTimestep {
            fixed_time_step,
            max_frame_time,
            max_steps,
            accumulator: 0.0,
            total_steps: 0,
        }
    }

    pub fn fixed_time_step(&self) -> f64 {
        self.fixed_time_step
    }

    /// The unsimulated time carried into the next frame, in seconds.
    pub fn accumulator(&self) -> f64 {
        self.accumulator
    }

    /// The number of fixed steps planned since creation.
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// The current interpolation factor between fixed steps.
    pub fn alpha(&self) -> f64 {
        self.accumulator / self.fixed_time_step
    }

    /// Forget any carried time.
    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }

    /// Account for a frame of `delta` seconds.
    ///
    /// Negative or non-finite deltas count as zero.
    pub fn advance(&mut self, delta: f64) -> StepPlan {
        let delta = if delta.is_finite() {
            delta.clamp(0.0, self.max_frame_time)
        } else {
            0.0
        };
        self.accumulator += delta;

        let mut steps = 0;
        while self.accumulator >= self.fixed_time_step && steps < self.max_steps {
            self.accumulator -= self.fixed_time_step;
            steps += 1;
        }
        self.total_steps += steps as u64;

        let mut dropped = 0.0;
        if self.accumulator >= self.fixed_time_step {
            dropped = self.accumulator;
            self.accumulator = 0.0;
            log::warn!("simulation fell behind: ran {} fixed steps and dropped {:.3}s", steps, dropped);
        }

        StepPlan {
            delta,
            steps,
            dropped,
            alpha: self.alpha(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const STEP: f64 = 1.0 / 60.0;

    #[test]
    fn test_spiral_of_death_guard() {
        let mut timestep = FixedTimestep::new(STEP, 0.25, 5);
        let plan = timestep.advance(10.0);

        assert_eq!(plan.delta, 0.25);
        assert_eq!(plan.steps, 5);
        assert!(plan.dropped > STEP);
        assert_eq!(timestep.accumulator(), 0.0);
        assert_eq!(plan.alpha, 0.0);
    }

    #[test]
    fn test_carries_remainder() {
        let mut timestep = FixedTimestep::new(STEP, 0.25, 5);

        let plan = timestep.advance(STEP * 0.5);
        assert_eq!(plan.steps, 0);
        assert!((plan.alpha - 0.5).abs() < 1e-9);

        let plan = timestep.advance(STEP * 2.0);
        assert_eq!(plan.steps, 2);
        assert_eq!(plan.dropped, 0.0);
        assert!((plan.alpha - 0.5).abs() < 1e-9);
        assert_eq!(timestep.total_steps(), 2);
    }

    #[test]
    fn test_cap_without_backlog_keeps_remainder() {
        let mut timestep = FixedTimestep::new(0.1, 1.0, 2);
        let plan = timestep.advance(0.25);
        assert_eq!(plan.steps, 2);
        assert_eq!(plan.dropped, 0.0);
        assert!((timestep.accumulator() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_bad_deltas() {
        let mut timestep = FixedTimestep::new(STEP, 0.25, 5);
        assert_eq!(timestep.advance(-1.0).delta, 0.0);
        assert_eq!(timestep.advance(f64::NAN).delta, 0.0);
        assert_eq!(timestep.advance(f64::INFINITY).steps, 0);
        assert_eq!(timestep.accumulator(), 0.0);
    }
}
