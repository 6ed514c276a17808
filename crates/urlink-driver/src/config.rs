//! Timing constants and the runtime control flags shared between the
//! supervisor and the command endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Every bounded wait the driver performs.
///
/// The defaults are what a real controller needs; tests shrink them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Longest silence tolerated on the primary channel.
    pub primary_timeout: Duration,
    /// Read poll on the reverse channel.
    pub reverse_poll: Duration,
    /// Longest gap between joint-state messages on the reverse channel.
    pub liveness: Duration,
    /// Supervisor sleep between steady-state iterations.
    pub steady_poll: Duration,
    /// Supervisor sleep while waiting for ready-to-program.
    pub ready_poll: Duration,
    /// How long the supervisor waits for the uploaded program to connect back.
    pub registry_wait: Duration,
    /// Delay between a fatal robot condition and process exit.
    pub fatal_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(1),
            reverse_poll: Duration::from_millis(200),
            liveness: Duration::from_secs(1),
            steady_poll: Duration::from_millis(200),
            ready_poll: Duration::from_secs(1),
            registry_wait: Duration::from_secs(1),
            fatal_grace: Duration::from_secs(2),
        }
    }
}

/// Flags flipped at runtime by configuration or external callers and read
/// once per supervisor iteration.
#[derive(Debug, Default)]
pub struct ControlFlags {
    prevent_programming: AtomicBool,
    free_drive: AtomicBool,
}

/// Point-in-time copy of [`ControlFlags`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    pub prevent_programming: bool,
    pub free_drive: bool,
}

impl ControlFlags {
    pub fn new(prevent_programming: bool) -> Self {
        Self {
            prevent_programming: AtomicBool::new(prevent_programming),
            free_drive: AtomicBool::new(false),
        }
    }

    pub fn prevent_programming(&self) -> bool {
        self.prevent_programming.load(Ordering::Acquire)
    }

    pub fn set_prevent_programming(&self, value: bool) {
        self.prevent_programming.store(value, Ordering::Release);
    }

    pub fn free_drive(&self) -> bool {
        self.free_drive.load(Ordering::Acquire)
    }

    pub fn set_free_drive(&self, value: bool) {
        self.free_drive.store(value, Ordering::Release);
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            prevent_programming: self.prevent_programming(),
            free_drive: self.free_drive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_matches_controller_contract() {
        let timing = Timing::default();
        assert_eq!(timing.primary_timeout, Duration::from_secs(1));
        assert_eq!(timing.reverse_poll, Duration::from_millis(200));
        assert_eq!(timing.liveness, Duration::from_secs(1));
        assert_eq!(timing.fatal_grace, Duration::from_secs(2));
    }

    #[test]
    fn snapshot_reflects_latest_writes() {
        let flags = ControlFlags::new(true);
        assert_eq!(
            flags.snapshot(),
            FlagSnapshot {
                prevent_programming: true,
                free_drive: false
            }
        );
        flags.set_prevent_programming(false);
        flags.set_free_drive(true);
        assert_eq!(
            flags.snapshot(),
            FlagSnapshot {
                prevent_programming: false,
                free_drive: true
            }
        );
    }
}
