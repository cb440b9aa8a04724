//! Runtime measurement for the actuators. Each actuator owns its own
//! `Timer`; instances are never shared.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Measures elapsed seconds on the monotonic clock while remembering
/// the wall-clock moment the measurement began. The wall stamp is
/// what ends up in the runtime log; the monotonic delta is what the
/// safety limits are checked against.

#[derive(Debug, Default)]
pub struct Timer {
    start: Option<Instant>,
    wall_start: Option<DateTime<Utc>>,
}

impl Timer {
    pub fn new() -> Timer {
        Timer::default()
    }

    /// Begins a measurement. Starting a running timer is a no-op, so
    /// callers don't need to track whether a previous start is still
    /// outstanding.
    pub fn start(&mut self) {
        if self.start.is_some() {
            return;
        }

        self.wall_start = Some(Utc::now());
        self.start = Some(Instant::now());
    }

    /// Ends the measurement and returns `(wall_start, elapsed_secs)`.
    /// Stopping a timer that isn't running returns the current wall
    /// time and a zero duration.
    pub fn stop(&mut self) -> (DateTime<Utc>, f64) {
        match self.start.take() {
            None => (Utc::now(), 0.0),

            Some(started) => {
                let elapsed = started.elapsed().as_secs_f64();
                let wall = self.wall_start.take().unwrap_or_else(Utc::now);

                (wall, elapsed)
            }
        }
    }

    /// The current monotonic delta, or 0 when stopped.
    pub fn elapsed_seconds(&self) -> f64 {
        match self.start {
            None => 0.0,
            Some(started) => started.elapsed().as_secs_f64(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.start.is_some()
    }

    /// Moves the start instant into the past so limit checks can be
    /// exercised without waiting.
    #[cfg(test)]
    pub fn backdate(&mut self, secs: u64) {
        if let Some(started) = self.start {
            self.start = Some(started - std::time::Duration::from_secs(secs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_without_start() {
        let mut timer = Timer::new();

        assert!(!timer.is_running());
        assert_eq!(timer.elapsed_seconds(), 0.0);

        let (_, elapsed) = timer.stop();

        assert_eq!(elapsed, 0.0);
    }

    #[test]
    fn test_start_stop() {
        let mut timer = Timer::new();

        timer.start();
        assert!(timer.is_running());
        assert!(timer.elapsed_seconds() >= 0.0);

        let (_, elapsed) = timer.stop();

        assert!(elapsed >= 0.0);
        assert!(!timer.is_running());
        assert_eq!(timer.elapsed_seconds(), 0.0);
    }

    #[test]
    fn test_idempotent_start() {
        let mut timer = Timer::new();

        timer.start();
        timer.backdate(100);

        // A second start must not reset the measurement.

        timer.start();
        assert!(timer.elapsed_seconds() >= 100.0);

        let (_, elapsed) = timer.stop();

        assert!(elapsed >= 100.0);
    }

    #[test]
    fn test_restart_after_stop() {
        let mut timer = Timer::new();

        timer.start();
        timer.backdate(50);
        let _ = timer.stop();

        timer.start();
        assert!(timer.elapsed_seconds() < 50.0);
    }
}
