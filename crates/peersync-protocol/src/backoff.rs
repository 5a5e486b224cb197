/// Client reconnect pacing.
///
/// Attempts are spaced at least `delay` apart, measured from the start of the
/// previous attempt. A server may stretch the spacing with a `Throttle`
/// message; the override lasts until the next established session.
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Setter half of a [`ReconnectPolicy`], handed to the session.
#[derive(Debug, Clone, Default)]
pub struct ThrottleHandle(Arc<parking_lot::Mutex<Option<Duration>>>);

impl ThrottleHandle {
    pub fn set_delay(&self, delay: Duration) {
        *self.0.lock() = Some(delay);
    }

    fn get(&self) -> Option<Duration> {
        *self.0.lock()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().take();
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    min_delay: Duration,
    jitter: Duration,
    throttle: ThrottleHandle,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            min_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            throttle: ThrottleHandle::default(),
        }
    }

    /// Set the floor applied to throttle overrides (default: 0).
    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Set the maximum random delay added to each wait (default: 0).
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn throttle_handle(&self) -> ThrottleHandle {
        self.throttle.clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        self.throttle.set_delay(delay);
    }

    pub fn current_delay(&self) -> Duration {
        self.throttle.get().unwrap_or(self.delay).max(self.min_delay)
    }

    /// How long to wait before the next attempt, given how long ago the last one started.
    pub fn wait_after(&self, elapsed: Duration) -> Duration {
        let base = self.current_delay().saturating_sub(elapsed);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Drop any throttle override. Called once a session is established.
    pub fn reset(&self) {
        self.throttle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_is_delay_minus_elapsed() {
        let policy = ReconnectPolicy::new(Duration::from_secs(60));
        assert_eq!(policy.wait_after(Duration::from_secs(15)), Duration::from_secs(45));
        assert_eq!(policy.wait_after(Duration::from_secs(90)), Duration::ZERO);
    }

    #[test]
    fn throttle_overrides_until_reset() {
        let policy = ReconnectPolicy::new(Duration::from_secs(60)).with_min_delay(Duration::from_secs(5));
        let handle = policy.throttle_handle();
        handle.set_delay(Duration::from_secs(300));
        assert_eq!(policy.current_delay(), Duration::from_secs(300));

        handle.set_delay(Duration::from_millis(10));
        assert_eq!(policy.current_delay(), Duration::from_secs(5));

        policy.reset();
        assert_eq!(policy.current_delay(), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1)).with_jitter(Duration::from_millis(100));
        for _ in 0..50 {
            let wait = policy.wait_after(Duration::ZERO);
            assert!(wait >= Duration::from_secs(1));
            assert!(wait <= Duration::from_millis(1100));
        }
    }
}
