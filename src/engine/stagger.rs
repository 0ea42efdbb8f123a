use std::time::Duration;

use crate::config::limits::MAX_STAGGER_SPREAD;

/// Per-rank delay between the opening instant and submission.
///
/// The step from rank `x` to `x + 1` is `base + linear·x + quadratic·x²`,
/// so gaps widen with rank. The total is clamped to `max_spread`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    pub base: Duration,
    pub linear: Duration,
    pub quadratic: Duration,
    pub max_spread: Duration,
}

impl Default for StaggerPolicy {
    /// 0, 200ms, 460ms, 860ms for ranks 0..4.
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            linear: Duration::from_millis(20),
            quadratic: Duration::from_millis(40),
            max_spread: MAX_STAGGER_SPREAD,
        }
    }
}

impl StaggerPolicy {
    /// No stagger at all: every candidate fires at the opening instant.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            linear: Duration::ZERO,
            quadratic: Duration::ZERO,
            max_spread: Duration::ZERO,
        }
    }

    pub fn delay(&self, rank: usize) -> Duration {
        let mut total = Duration::ZERO;
        for x in 0..rank {
            let x = u32::try_from(x).unwrap_or(u32::MAX);
            let step = self
                .base
                .saturating_add(self.linear.saturating_mul(x))
                .saturating_add(self.quadratic.saturating_mul(x.saturating_mul(x)));
            total = total.saturating_add(step);
            if total >= self.max_spread {
                return self.max_spread;
            }
        }
        total
    }
}
