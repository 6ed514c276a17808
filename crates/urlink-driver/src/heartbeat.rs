//! [`HeartbeatMonitor`] – reverse-channel liveness check.
//!
//! Every joint-state message counts as a heartbeat. The uploaded program
//! never announces that it stopped, so a silent channel is the only
//! disconnect signal: once a heartbeat has been seen, a gap longer than the
//! deadline means the session is dead.

use std::time::{Duration, Instant};

use urlink_types::UrError;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No heartbeat yet; the deadline does not apply.
    Waiting,
    Healthy,
    /// Silent for the contained duration, which exceeds the deadline.
    TimedOut(Duration),
}

// ────────────────────────────────────────────────────────────────────────────
// HeartbeatMonitor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    deadline: Duration,
    last_beat: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            last_beat: None,
        }
    }

    pub fn beat_at(&mut self, now: Instant) {
        self.last_beat = Some(now);
    }

    pub fn beat(&mut self) {
        self.beat_at(Instant::now());
    }

    pub fn health_at(&self, now: Instant) -> Health {
        match self.last_beat {
            None => Health::Waiting,
            Some(last) => {
                let silent = now.saturating_duration_since(last);
                if silent > self.deadline {
                    Health::TimedOut(silent)
                } else {
                    Health::Healthy
                }
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`UrError::LivenessTimeout`] when the deadline was exceeded.
    pub fn check(&self) -> Result<(), UrError> {
        match self.health_at(Instant::now()) {
            Health::TimedOut(silent) => Err(UrError::LivenessTimeout(silent)),
            Health::Waiting | Health::Healthy => Ok(()),
        }
    }
}
