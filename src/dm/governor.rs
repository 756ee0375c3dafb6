//! Restart throttling for displays whose server keeps dying ("loop of death").
//!
//! The governor only looks at the bookkeeping stored on the display plus the
//! `now` value handed in by the caller, so every branch can be driven from a
//! test with a simulated clock.

use std::time::Duration;

/// A start window longer than this is considered a fresh loop.
pub const LOOP_WINDOW_SECS: i64 = 90;
/// A run lasting at least this long is treated as a real session.
pub const HEALTHY_RUN_SECS: i64 = 30;
/// Restarts tolerated inside one loop window before the cooldown kicks in.
pub const MAX_RETRIES_IN_WINDOW: u32 = 6;
pub const COOLDOWN_SECS: u64 = 120;
/// Minimum spacing between restarts once the loop has started to spin.
pub const THROTTLE_SECS: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// Logout, greeter restart, crash of the worker.
    Routine,
    /// The worker gave up because no server could be started.
    ServerFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Re-manage after `sleep`.
    Proceed { sleep: Duration },
    /// The loop tripped: warn the user and re-manage after the cooldown.
    Wait { sleep: Duration },
    /// The server kept failing after a cooldown already ran its course.
    Disable,
}

impl Verdict {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Verdict::Proceed { sleep } | Verdict::Wait { sleep } => Some(*sleep),
            Verdict::Disable => None,
        }
    }
}

/// Per-display retry bookkeeping (wall-clock seconds).
///
/// `last_loop_start == 0` means "no loop in progress"; the next evaluation resets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub last_start: i64,
    pub last_loop_start: i64,
    pub retry_count: u32,
    pub sleep_before_run: u64,
    pub cooldown_served: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self, now: i64) {
        self.last_loop_start = now;
        self.last_start = now;
        self.retry_count = 1;
        self.sleep_before_run = 1;
    }

    /// Decide how long to wait before the display is managed again.
    pub fn evaluate(&mut self, now: i64, cause: RestartCause) -> Verdict {
        let healthy = now - self.last_start >= HEALTHY_RUN_SECS;
        let fresh = self.last_loop_start == 0 || now < self.last_loop_start;
        let window_expired = now - self.last_loop_start >= LOOP_WINDOW_SECS;

        if fresh || window_expired || healthy {
            // Only the evaluation right after a cooldown can disable.
            let failed_after_cooldown =
                self.cooldown_served && !healthy && cause == RestartCause::ServerFailed;
            self.cooldown_served = false;
            self.reset(now);
            if failed_after_cooldown {
                return Verdict::Disable;
            }
            return Verdict::Proceed { sleep: Duration::from_secs(self.sleep_before_run) };
        }

        if self.retry_count >= MAX_RETRIES_IN_WINDOW {
            self.sleep_before_run = COOLDOWN_SECS;
            // The start after the cooldown lies in the future.
            self.last_start = now + COOLDOWN_SECS as i64;
            self.retry_count = 1;
            // Forces a reset on the evaluation after the cooldown.
            self.last_loop_start = 0;
            self.cooldown_served = true;
            return Verdict::Wait { sleep: Duration::from_secs(COOLDOWN_SECS) };
        }

        self.cooldown_served = false;
        let since_last = now - self.last_start;
        self.sleep_before_run = if self.retry_count > 2 && since_last < THROTTLE_SECS {
            (THROTTLE_SECS - since_last) as u64
        } else {
            1
        };
        self.retry_count += 1;
        self.last_start = now;
        Verdict::Proceed { sleep: Duration::from_secs(self.sleep_before_run) }
    }
}
