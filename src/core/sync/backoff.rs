/*!
 * Reader Backoff
 *
 * Adaptive spin used between seqlock read attempts. Spins with exponential
 * backoff first, then yields to the scheduler once the spin budget is spent.
 */

use super::config::SpinConfig;
use super::{hint, thread};

/// Per-read backoff state
pub(crate) struct Backoff {
    config: SpinConfig,
    step: u32,
    spins: u32,
}

impl Backoff {
    #[inline]
    pub(crate) fn new(config: SpinConfig) -> Self {
        Self {
            config,
            step: 0,
            spins: 0,
        }
    }

    /// Wait a little before the next attempt
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.spins < self.config.spins_before_yield {
            let rounds = 1u32 << self.step.min(self.config.max_backoff_shift);
            for _ in 0..rounds {
                hint::spin_loop();
            }
            self.spins = self.spins.saturating_add(1);
            self.step = self.step.saturating_add(1);
        } else {
            thread::yield_now();
        }
    }

    /// Whether the spin budget is exhausted and the reader is now yielding
    #[cfg(test)]
    pub(crate) fn is_yielding(&self) -> bool {
        self.spins >= self.config.spins_before_yield
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switches_to_yield() {
        let mut backoff = Backoff::new(SpinConfig::cooperative());
        for _ in 0..4 {
            assert!(!backoff.is_yielding());
            backoff.snooze();
        }
        assert!(backoff.is_yielding());
        backoff.snooze(); // yields, must not panic
    }
}
