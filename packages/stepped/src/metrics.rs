//! Frame performance metrics.

use std::collections::VecDeque;
use std::time::Duration;

/// The number of frames averaged for the FPS figure.
pub const DEFAULT_FPS_WINDOW: usize = 60;

/// Aggregate timing for the most recent frame.
///
/// Times are in milliseconds; `fps` is averaged over a sliding window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub fps: f64,
    pub frame_time: f64,
    pub update_time: f64,
    pub fixed_update_time: f64,
    pub frame_count: u64,
}

/// Accumulates per-frame timings into `PerformanceMetrics`.
#[derive(Clone, Debug)]
pub struct MetricsRecorder {
    window: VecDeque<f64>,
    window_size: usize,
    window_total: f64,
    current: PerformanceMetrics,
}

impl MetricsRecorder {
    /// Create a recorder averaging FPS over `window_size` frames.
    pub fn new(window_size: usize) -> MetricsRecorder {
        let window_size = window_size.max(1);
        MetricsRecorder {
            window: VecDeque::with_capacity(window_size),
            window_size,
            window_total: 0.0,
            current: PerformanceMetrics::default(),
        }
    }

    /// Record one frame.
    ///
    /// `frame_delta` is the frame's wall-clock delta in seconds.
    pub fn record_frame(&mut self, frame_delta: f64, update_time: Duration, fixed_update_time: Duration) {
        if self.window.len() == self.window_size {
            if let Some(oldest) = self.window.pop_front() {
                self.window_total -= oldest;
            }
        }
        self.window.push_back(frame_delta);
        self.window_total += frame_delta;

        let fps = if self.window_total > 0.0 {
            self.window.len() as f64 / self.window_total
        } else {
            0.0
        };

        self.current = PerformanceMetrics {
            fps,
            frame_time: frame_delta * 1000.0,
            update_time: update_time.as_secs_f64() * 1000.0,
            fixed_update_time: fixed_update_time.as_secs_f64() * 1000.0,
            frame_count: self.current.frame_count + 1,
        };
    }

    /// The metrics as of the last recorded frame.
    pub fn current(&self) -> PerformanceMetrics {
        self.current
    }

    /// Forget the FPS window, keeping the frame count.
    pub fn reset_window(&mut self) {
        self.window.clear();
        self.window_total = 0.0;
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        MetricsRecorder::new(DEFAULT_FPS_WINDOW)
    }
}
