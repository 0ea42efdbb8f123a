use std::time::Duration;

use chrono::{DateTime, Utc};

/// The single wall-clock source shared by the trigger and every attempt task.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by tokio's timer. Under `tokio::time::pause` it only
/// moves when virtual time does, which makes timing tests deterministic.
pub struct AnchoredClock {
    wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl AnchoredClock {
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        self.wall + chrono::Duration::from_std(self.anchor.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Below this distance from the target, coarse sleeping gives way to polling.
pub const FINE_POLL_WINDOW: Duration = Duration::from_millis(250);
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Sleep until `clock` reads at least `target`: one computed sleep to just
/// short of the instant, then small polls so clock adjustments are honored.
pub async fn sleep_until(clock: &dyn Clock, target: DateTime<Utc>) {
    loop {
        let now = clock.now();
        if now >= target {
            return;
        }
        let remaining = (target - now).to_std().unwrap_or_default();
        if remaining > FINE_POLL_WINDOW {
            tokio::time::sleep(remaining - FINE_POLL_WINDOW).await;
        } else {
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn anchored_clock_follows_virtual_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 22, 10, 0, 0).unwrap();
        let clock = AnchoredClock::starting_at(start);
        assert_eq!(clock.now(), start);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_lands_on_target() {
        let start = Utc.with_ymd_and_hms(2024, 5, 22, 10, 0, 0).unwrap();
        let clock = AnchoredClock::starting_at(start);
        let target = start + chrono::Duration::minutes(59) + chrono::Duration::seconds(30);
        sleep_until(&clock, target).await;
        let now = clock.now();
        assert!(now >= target);
        assert!(now - target < chrono::Duration::milliseconds(10));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_past_target_returns_immediately() {
        let start = Utc.with_ymd_and_hms(2024, 5, 22, 12, 0, 0).unwrap();
        let clock = AnchoredClock::starting_at(start);
        sleep_until(&clock, start - chrono::Duration::hours(1)).await;
        assert_eq!(clock.now(), start);
    }
}
