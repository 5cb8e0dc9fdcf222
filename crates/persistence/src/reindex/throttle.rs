//! Throttle oracle for reindex batches.
//!
//! Before each batch the task asks the oracle for a batch size and a delay.
//! The oracle is driven by storage-backend feedback: rate-limited responses
//! raise the pressure, successful batches let it decay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// What the oracle wants the next batch to look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePlan {
    /// Records to process in the next batch. Always at least 1.
    pub batch_size: usize,
    /// Pause to honor before issuing the batch.
    pub delay: Duration,
}

/// Oracle consulted before every reindex batch.
pub trait ThrottleOracle: Send + Sync {
    /// Plan for the next batch.
    fn plan(&self) -> ThrottlePlan;

    /// The backend pushed back on the last batch.
    fn record_rate_limited(&self);

    /// The last batch went through.
    fn record_success(&self);
}

/// Oracle that always answers with the configured batch size and no delay.
#[derive(Debug)]
pub struct FixedThrottle {
    batch_size: usize,
}

impl FixedThrottle {
    /// Creates a fixed oracle.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl ThrottleOracle for FixedThrottle {
    fn plan(&self) -> ThrottlePlan {
        ThrottlePlan {
            batch_size: self.batch_size,
            delay: Duration::ZERO,
        }
    }

    fn record_rate_limited(&self) {}

    fn record_success(&self) {}
}

/// Maximum pressure level; batch size bottoms out at `base >> MAX_PRESSURE`.
const MAX_PRESSURE: u32 = 6;

/// Base delay applied at the first pressure level by [`AdaptiveThrottle::with_batch_size`].
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Oracle that halves the batch and grows the delay under backend pressure.
///
/// Each rate-limited response raises the pressure level by one; each
/// successful batch lowers it by one. At level `n` the batch size is
/// `base >> n` (floored at 1) and the delay is `base_delay << (n - 1)`.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    base_batch: usize,
    base_delay: Duration,
    pressure: AtomicU32,
}

impl AdaptiveThrottle {
    /// Creates an adaptive oracle.
    pub fn new(base_batch: usize, base_delay: Duration) -> Self {
        Self {
            base_batch: base_batch.max(1),
            base_delay,
            pressure: AtomicU32::new(0),
        }
    }

    /// Creates an adaptive oracle seeded from a configured batch size, with
    /// the default base delay.
    pub fn with_batch_size(base_batch: usize) -> Self {
        Self::new(base_batch, DEFAULT_BASE_DELAY)
    }

    /// Current pressure level.
    pub fn pressure(&self) -> u32 {
        self.pressure.load(Ordering::Relaxed)
    }
}

impl ThrottleOracle for AdaptiveThrottle {
    fn plan(&self) -> ThrottlePlan {
        let pressure = self.pressure.load(Ordering::Relaxed).min(MAX_PRESSURE);
        let batch_size = (self.base_batch >> pressure).max(1);
        let delay = if pressure == 0 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.saturating_pow(pressure - 1)
        };
        ThrottlePlan { batch_size, delay }
    }

    fn record_rate_limited(&self) {
        let _ = self
            .pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_add(1).min(MAX_PRESSURE))
            });
    }

    fn record_success(&self) {
        let _ = self
            .pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_sub(1))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_plan_is_constant() {
        let oracle = FixedThrottle::new(100);
        oracle.record_rate_limited();
        let plan = oracle.plan();
        assert_eq!(plan.batch_size, 100);
        assert_eq!(plan.delay, Duration::ZERO);
    }

    #[test]
    fn adaptive_shrinks_under_pressure() {
        let oracle = AdaptiveThrottle::new(100, Duration::from_millis(100));
        assert_eq!(oracle.plan().batch_size, 100);
        assert_eq!(oracle.plan().delay, Duration::ZERO);

        oracle.record_rate_limited();
        let plan = oracle.plan();
        assert_eq!(plan.batch_size, 50);
        assert_eq!(plan.delay, Duration::from_millis(100));

        oracle.record_rate_limited();
        let plan = oracle.plan();
        assert_eq!(plan.batch_size, 25);
        assert_eq!(plan.delay, Duration::from_millis(200));
    }

    #[test]
    fn adaptive_recovers_on_success() {
        let oracle = AdaptiveThrottle::new(80, Duration::from_millis(50));
        oracle.record_rate_limited();
        oracle.record_rate_limited();
        oracle.record_success();
        assert_eq!(oracle.pressure(), 1);
        oracle.record_success();
        oracle.record_success();
        assert_eq!(oracle.pressure(), 0);
        assert_eq!(oracle.plan().batch_size, 80);
    }

    #[test]
    fn with_batch_size_uses_default_delay() {
        let oracle = AdaptiveThrottle::with_batch_size(100);
        assert_eq!(oracle.plan().batch_size, 100);
        oracle.record_rate_limited();
        assert_eq!(oracle.plan().delay, DEFAULT_BASE_DELAY);
    }

    #[test]
    fn batch_size_never_reaches_zero() {
        let oracle = AdaptiveThrottle::new(4, Duration::from_millis(10));
        for _ in 0..10 {
            oracle.record_rate_limited();
        }
        assert_eq!(oracle.plan().batch_size, 1);
    }
}
