/*!
 * Synchronization Configuration
 *
 * Runtime configuration for how readers spin while a seqlock page is unstable
 */

use crate::core::limits::{DEFAULT_MAX_BACKOFF_SHIFT, DEFAULT_SPINS_BEFORE_YIELD};
use serde::{Deserialize, Serialize};

/// Spin/backoff configuration for retrying readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinConfig {
    /// Busy spins before the reader starts yielding to the scheduler
    pub spins_before_yield: u32,
    /// Exponential backoff cap: each step issues at most `1 << shift` spin hints
    pub max_backoff_shift: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            spins_before_yield: DEFAULT_SPINS_BEFORE_YIELD,
            max_backoff_shift: DEFAULT_MAX_BACKOFF_SHIFT,
        }
    }
}

impl SpinConfig {
    /// Never yield; lowest latency, burns a core while waiting
    pub const fn low_latency() -> Self {
        Self {
            spins_before_yield: u32::MAX,
            max_backoff_shift: 4,
        }
    }

    /// Yield almost immediately; friendly to oversubscribed machines
    pub const fn cooperative() -> Self {
        Self {
            spins_before_yield: 4,
            max_backoff_shift: 2,
        }
    }
}
