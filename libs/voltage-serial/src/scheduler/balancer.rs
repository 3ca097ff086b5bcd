//! High priority time debt
//!
//! Time spent on high priority reads is added, time spent on low priority
//! reads is subtracted. Once the debt reaches the threshold a ready low
//! priority item preempts ready high priority ones.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TotalTimeBalancer {
    total_ms: i64,
    /// Maximum debt that does not need to be reduced
    threshold_ms: i64,
    /// Debt is clamped to [-max, max]
    max_ms: i64,
}

impl TotalTimeBalancer {
    pub fn new(threshold: Duration, max: Duration) -> Self {
        Self {
            total_ms: 0,
            threshold_ms: threshold.as_millis() as i64,
            max_ms: max.as_millis() as i64,
        }
    }

    pub fn increment(&mut self, delta: Duration) {
        self.total_ms = (self.total_ms + delta.as_millis() as i64).min(self.max_ms);
    }

    pub fn decrement(&mut self, delta: Duration) {
        self.total_ms = (self.total_ms - delta.as_millis() as i64).max(-self.max_ms);
    }

    pub fn should_decrement(&self) -> bool {
        self.total_ms >= self.threshold_ms
    }

    /// Debt above the threshold
    pub fn time_to_decrement(&self) -> Duration {
        Duration::from_millis((self.total_ms - self.threshold_ms).max(0) as u64)
    }

    pub fn reset(&mut self) {
        self.total_ms = 0;
    }

    pub fn total_ms(&self) -> i64 {
        self.total_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_and_threshold() {
        let mut balancer =
            TotalTimeBalancer::new(Duration::from_millis(1000), Duration::from_millis(2000));
        balancer.increment(Duration::from_millis(600));
        assert!(!balancer.should_decrement());
        balancer.increment(Duration::from_millis(600));
        assert!(balancer.should_decrement());
        assert_eq!(balancer.time_to_decrement(), Duration::from_millis(200));

        balancer.increment(Duration::from_secs(10));
        assert_eq!(balancer.total_ms(), 2000);

        balancer.decrement(Duration::from_secs(10));
        assert_eq!(balancer.total_ms(), -2000);
        assert_eq!(balancer.time_to_decrement(), Duration::ZERO);

        balancer.reset();
        assert_eq!(balancer.total_ms(), 0);
    }
}
