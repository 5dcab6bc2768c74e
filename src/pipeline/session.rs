//! Recording session handle: cancellation flag, clock and counters

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pipeline::stats::PipelineStats;

/// Timestamp source shared by every stage
pub trait Clock: Send + Sync {
    /// Monotonic seconds
    fn now(&self) -> f64;
}

/// Seconds elapsed since the clock was created
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock advanced by hand, for deterministic tests and replay
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// State shared by all stages of one recording.
///
/// `is_active` is the only cancellation signal. Every wait in the pipeline
/// re-checks it at least once per `poll_interval`.
pub struct Session {
    active: AtomicBool,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    fps: u32,
    stats: PipelineStats,
}

impl Session {
    pub fn new(clock: Arc<dyn Clock>, fps: u32, poll_interval: Duration) -> Self {
        Self {
            active: AtomicBool::new(true),
            clock,
            poll_interval,
            fps,
            stats: PipelineStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Signal every stage to unwind
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Seconds between two output frames
    pub fn frame_interval(&self) -> f64 {
        1.0 / self.fps as f64
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("active", &self.is_active())
            .field("fps", &self.fps)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1.5);
        assert_eq!(clock.now(), 1.5);
        clock.advance(0.25);
        assert_eq!(clock.now(), 1.75);
        clock.set(0.0);
        assert_eq!(clock.now(), 0.0);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_cancel() {
        let session = Session::new(Arc::new(ManualClock::new(0.0)), 30, Duration::from_millis(1));
        assert!(session.is_active());
        session.cancel();
        assert!(!session.is_active());
        assert!((session.frame_interval() - 1.0 / 30.0).abs() < 1e-12);
    }
}
