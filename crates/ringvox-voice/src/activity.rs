//! Inactivity tracking.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shared "last activity" timestamp.
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Records activity now.
    pub fn touch(&self) {
        let now = Instant::now();
        match self.last.lock() {
            Ok(mut last) => *last = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn idle_for(&self) -> Duration {
        let last = match self.last.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        };
        Instant::now().saturating_duration_since(last)
    }
}

/// Checks `clock` every `interval` and calls `on_timeout` once the idle time
/// reaches `timeout`. Returns after firing.
pub async fn watchdog<F>(clock: &ActivityClock, timeout: Duration, interval: Duration, on_timeout: F)
where
    F: FnOnce(),
{
    info!(
        timeout_ms = timeout.as_millis() as u64,
        interval_ms = interval.as_millis() as u64,
        "starting inactivity watchdog"
    );
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let idle = clock.idle_for();
        if idle >= timeout {
            info!(idle_ms = idle.as_millis() as u64, "inactivity timeout reached");
            on_timeout();
            return;
        }
        debug!(idle_ms = idle.as_millis() as u64, "session active");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn idle_time_advances_and_resets() {
        let clock = ActivityClock::new();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(clock.idle_for() >= Duration::from_millis(1_500));
        clock.touch();
        assert_eq!(clock.idle_for(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_after_timeout() {
        let clock = Arc::new(ActivityClock::new());
        let fired = Arc::new(AtomicBool::new(false));
        let start = Instant::now();

        let flag = Arc::clone(&fired);
        watchdog(
            &clock,
            Duration::from_secs(5),
            Duration::from_secs(1),
            move || flag.store(true, Ordering::SeqCst),
        )
        .await;

        assert!(fired.load(Ordering::SeqCst));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_timeout() {
        let clock = Arc::new(ActivityClock::new());
        let start = Instant::now();

        let toucher = Arc::clone(&clock);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            toucher.touch();
        });

        watchdog(&clock, Duration::from_secs(5), Duration::from_secs(1), || {}).await;
        assert!(start.elapsed() >= Duration::from_secs(8));
    }
}
