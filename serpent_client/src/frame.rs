//! Fixed-timestep frame loop.
//!
//! Frames arrive at the render rate; simulation steps at the configured tick.
//! Elapsed time accumulates and is spent one whole step at a time.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Steps run for a single frame at most; the rest of the backlog is dropped.
const MAX_CATCH_UP_STEPS: u32 = 8;

#[derive(Debug, Clone)]
pub struct FixedStep {
    step: Duration,
    accumulator: Duration,
}

impl FixedStep {
    pub fn new(step: Duration) -> Self {
        Self {
            step: step.max(Duration::from_millis(1)),
            accumulator: Duration::ZERO,
        }
    }

    /// Adds `elapsed` and returns how many whole steps to simulate.
    pub fn advance(&mut self, elapsed: Duration) -> u32 {
        self.accumulator += elapsed;
        let mut steps = 0;
        while self.accumulator >= self.step {
            self.accumulator -= self.step;
            steps += 1;
            if steps == MAX_CATCH_UP_STEPS {
                debug!(dropped = ?self.accumulator, "Frame backlog dropped");
                self.accumulator = Duration::ZERO;
                break;
            }
        }
        steps
    }

    pub fn step(&self) -> Duration {
        self.step
    }
}

/// A running frame loop. Dropping it stops the loop.
pub struct FrameLoop {
    interval: Interval,
    last: Instant,
    stepper: FixedStep,
}

impl FrameLoop {
    pub fn start(step: Duration, frame_interval: Duration) -> Self {
        let now = Instant::now();
        let mut interval = time::interval_at(now + frame_interval, frame_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            last: now,
            stepper: FixedStep::new(step),
        }
    }

    /// Waits for the next frame and returns the simulation steps it owes.
    ///
    /// Cancel safe.
    pub async fn next_frame(&mut self) -> u32 {
        let now = self.interval.tick().await;
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        self.stepper.advance(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_partial_steps() {
        let mut fs = FixedStep::new(Duration::from_millis(100));
        assert_eq!(fs.advance(Duration::from_millis(60)), 0);
        assert_eq!(fs.advance(Duration::from_millis(60)), 1);
        assert_eq!(fs.advance(Duration::from_millis(180)), 2);
        assert_eq!(fs.advance(Duration::from_millis(0)), 0);
    }

    #[test]
    fn backlog_is_capped() {
        let mut fs = FixedStep::new(Duration::from_millis(10));
        assert_eq!(fs.advance(Duration::from_secs(5)), MAX_CATCH_UP_STEPS);
        assert_eq!(fs.advance(Duration::from_millis(5)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_steps_at_tick_rate() {
        let mut frames = FrameLoop::start(Duration::from_millis(100), Duration::from_millis(20));
        let mut steps = 0;
        for _ in 0..25 {
            steps += frames.next_frame().await;
        }
        assert_eq!(steps, 5);
    }
}
