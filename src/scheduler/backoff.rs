//! Consecutive-error counter driving the cooldown.

/// What the loop should do after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Sleep the normal interval.
    Continue,
    /// Sleep the extended cooldown.
    Cool,
}

/// Counter that climbs on failure and drains on success. Reaching `max`
/// triggers a cooldown and drops the counter to `reset_to`, which stays
/// above zero so a still-broken server cools again sooner.
#[derive(Debug, Clone)]
pub struct Backoff {
    errors: u32,
    max: u32,
    reset_to: u32,
}

impl Backoff {
    pub fn new(max: u32, reset_to: u32) -> Self {
        Self {
            errors: 0,
            max,
            reset_to,
        }
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn on_success(&mut self) {
        self.errors = self.errors.saturating_sub(1);
    }

    pub fn on_failure(&mut self) -> BackoffAction {
        self.errors += 1;
        if self.errors >= self.max {
            self.errors = self.reset_to;
            BackoffAction::Cool
        } else {
            BackoffAction::Continue
        }
    }
}
