//! Quiet-tick liveness monitor.
//!
//! Counts consecutive quiet ticks, arms a short countdown once the shard has
//! gone silent for too long, and on expiry grants the defragger a one-shot
//! escalation bonus.

/// Quiet ticks before the countdown arms.
pub const QUIET_TICKS_WARNING: u32 = 6;
/// Length of the armed countdown, in ticks.
pub const WATCHDOG_COUNTDOWN: u32 = 3;

/// Watchdog counters. `pending_bonus` is the number of fired-but-undischarged
/// triggers; the defragger discharges it on first use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watchdog {
    pub quiet_ticks: u32,
    pub countdown: u32,
    pub active: bool,
    pub pending_bonus: u32,
}

/// What a tick-boundary observation did to the watchdog, so the shard can
/// emit the matching global events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTransition {
    Idle,
    /// Countdown just armed.
    Armed { countdown: u32 },
    /// Armed countdown decremented without reaching zero.
    Counting { countdown: u32 },
    /// Countdown hit zero; a bonus is now pending.
    Fired,
    /// A non-quiet window reset an armed or counting watchdog.
    Restored,
}

impl Watchdog {
    /// Fold the previous window's quietness into the counters.
    pub fn observe(&mut self, quiet: bool) -> WatchdogTransition {
        if !quiet {
            let was_escalating = self.quiet_ticks >= QUIET_TICKS_WARNING || self.countdown > 0 || self.active;
            self.quiet_ticks = 0;
            self.countdown = 0;
            self.active = false;
            return if was_escalating {
                WatchdogTransition::Restored
            } else {
                WatchdogTransition::Idle
            };
        }
        if self.active {
            self.countdown -= 1;
            if self.countdown == 0 {
                self.active = false;
                self.quiet_ticks = 0;
                self.pending_bonus = self.pending_bonus.saturating_add(1);
                return WatchdogTransition::Fired;
            }
            return WatchdogTransition::Counting {
                countdown: self.countdown,
            };
        }
        self.quiet_ticks += 1;
        if self.quiet_ticks == QUIET_TICKS_WARNING {
            self.countdown = WATCHDOG_COUNTDOWN;
            self.active = true;
            return WatchdogTransition::Armed {
                countdown: self.countdown,
            };
        }
        WatchdogTransition::Idle
    }

    /// Take the accumulated bonus index, leaving it discharged.
    #[must_use]
    pub fn discharge(&mut self) -> u32 {
        std::mem::take(&mut self.pending_bonus)
    }
}
