//! [`Throttle`] – minimum-period rate limiter for repetitive log lines.
//!
//! The decision is a pure function of the last emit time, the period and
//! the current time; logging stays with the caller.
//!
//! ```
//! use std::time::{Duration, Instant};
//! use urlink_driver::throttle::Throttle;
//!
//! let mut throttle = Throttle::new(Duration::from_secs(1));
//! let t0 = Instant::now();
//! assert!(throttle.allow_at(t0));
//! assert!(!throttle.allow_at(t0 + Duration::from_millis(500)));
//! assert!(throttle.allow_at(t0 + Duration::from_secs(1)));
//! ```

use std::time::{Duration, Instant};

/// `true` when an event at `now` may be emitted given the previous emit.
pub fn is_due(last_emit: Option<Instant>, period: Duration, now: Instant) -> bool {
    match last_emit {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= period,
    }
}

#[derive(Debug, Clone)]
pub struct Throttle {
    period: Duration,
    last_emit: Option<Instant>,
}

impl Throttle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_emit: None,
        }
    }

    /// Record an attempt at `now`; returns whether it should be emitted.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        let due = is_due(self.last_emit, self.period, now);
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}
