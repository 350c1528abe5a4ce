use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    disabled_until: Option<DateTime<Utc>>,
}

/// Disables static review after repeated reviewer crashes. While disabled the
/// pipeline skips review entirely (fail-open) until the cooldown elapses.
///
/// Shared by every worker of a pool; interior state is behind a mutex.
pub struct StaticReviewCircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl StaticReviewCircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
            clock,
        }
    }

    /// True when review should run. An expired cooldown resets the breaker.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true;
        };
        match state.disabled_until {
            Some(until) if self.clock.now() < until => false,
            Some(_) => {
                info!("Static review re-enabled after cooldown");
                *state = BreakerState::default();
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.consecutive_failures = 0;
        }
    }

    /// Returns `true` when this failure just tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.disabled_until.is_none() && state.consecutive_failures >= self.threshold {
            let cooldown = chrono::Duration::from_std(self.cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            let until = self
                .clock
                .now()
                .checked_add_signed(cooldown)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.disabled_until = Some(until);
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Static review disabled after repeated reviewer failures"
            );
            return true;
        }
        false
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().map_or(0, |s| s.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::StaticReviewCircuitBreaker;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(clock: &ManualClock) -> StaticReviewCircuitBreaker {
        StaticReviewCircuitBreaker::new(3, Duration::from_secs(300), Arc::new(clock.clone()))
    }

    #[test]
    fn opens_exactly_at_the_threshold() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(!breaker.is_enabled());
        assert!(!breaker.record_failure(), "already open, not newly opened");
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.record_failure());
        assert!(breaker.is_enabled());
    }

    #[test]
    fn re_enables_itself_after_cooldown() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            breaker.record_failure();
        }

        clock.advance(ChronoDuration::seconds(299));
        assert!(!breaker.is_enabled());

        clock.advance(ChronoDuration::seconds(1));
        assert!(breaker.is_enabled());
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
