//! One second trailing window counter for low priority reads

use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Items allowed per window, 0 disables limiting
    limit: usize,
    count: usize,
    start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            count: 0,
            start: None,
        }
    }

    fn in_window(&self, time: Instant) -> bool {
        self.start
            .is_some_and(|start| time.saturating_duration_since(start) < WINDOW)
    }

    pub fn new_item(&mut self, time: Instant) {
        if self.limit == 0 {
            return;
        }
        if self.in_window(time) {
            self.count += 1;
            return;
        }
        self.count = 1;
        self.start = Some(time);
    }

    pub fn is_over_limit(&self, time: Instant) -> bool {
        self.limit != 0 && self.in_window(time) && self.count > self.limit
    }

    /// End of the current window
    pub fn window_end(&self) -> Option<Instant> {
        self.start.map(|start| start + WINDOW)
    }
}
