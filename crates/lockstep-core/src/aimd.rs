//! Adaptive checkpoint interval.

use crate::config::MIN_TIMEOUT;

/// Additive-increase / multiplicative-decrease checkpoint interval.
///
/// When disabled the interval stays at the configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    configured: u64,
    current: u64,
    adaptive: bool,
}

impl TimeoutPolicy {
    pub fn new(configured: u64, adaptive: bool) -> Self {
        Self {
            configured,
            current: configured,
            adaptive,
        }
    }

    /// Committed instructions after which the open segment times out.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn configured(&self) -> u64 {
        self.configured
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Halve the interval after a detected fault.
    pub fn on_fault(&mut self) {
        if self.adaptive {
            self.current = (self.current >> 1).max(MIN_TIMEOUT);
        }
    }

    /// Grow the interval by one after a clean retirement.
    pub fn on_clean_retire(&mut self) {
        if self.adaptive {
            self.current = (self.current + 1).min(self.configured);
        }
    }
}
