//! Deadline based timers.
//!
//! The CFDP state machines never read a clock themselves. Every timer stores an absolute
//! deadline which is compared against the timestamp passed to [crate::entity::Entity::tick].
//! This keeps the transactions deterministic and allows driving them with simulated time.
use core::time::Duration;
use std::time::Instant;

/// Countdown with a fixed interval and an optional deadline. A stopped countdown never expires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Countdown {
    interval: Duration,
    deadline: Option<Duration>,
}

impl Countdown {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// (Re-)start the countdown relative to the passed timestamp.
    pub fn start(&mut self, now: Duration) {
        self.deadline = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn has_expired(&self, now: Duration) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Start the countdown again if it is currently running.
    pub fn restart_if_running(&mut self, now: Duration) {
        if self.is_running() {
            self.start(now);
        }
    }

    pub fn remaining(&self, now: Duration) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_sub(now))
    }
}

/// Monotonic time source.
pub trait Clock {
    /// Time since an arbitrary but fixed epoch.
    fn now(&self) -> Duration;
}

/// [Clock] based on [Instant], using the creation time as the epoch.
#[derive(Debug, Copy, Clone)]
pub struct StdClock {
    epoch: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
