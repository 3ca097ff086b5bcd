//! Priority scheduler
//!
//! Two deadline queues, one per priority tier. High priority entries are
//! registers with a fixed read period, low priority entries are polled as
//! often as the bus allows.
//!
//! ```text
//!            ┌──────────── SelectionPolicy::All ───────────┐
//!   high  ──►│ ready && (!force_low || low not ready) ──► High
//!   low   ──►│ otherwise, if ready                   ──► Low
//!            └─────────────────────────────────────────────┘
//!   force_low = balancer debt >= lag || no high entries
//! ```
//!
//! The [`TotalTimeBalancer`] keeps low priority reads from starving: every
//! high priority selection adds its duration to a debt, every low priority
//! selection pays it back.

pub mod balancer;
pub mod queue;
pub mod rate_limiter;

pub use balancer::TotalTimeBalancer;
pub use queue::{PriorityQueueSchedule, ScheduledItem};
pub use rate_limiter::RateLimiter;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::register::Register;

/// Default bound of the high priority time debt
pub const DEFAULT_MAX_LOW_PRIORITY_LAG: Duration = Duration::from_secs(1);

const MOVING_AVERAGE_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

/// How the accumulator should treat an offered item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationPolicy {
    /// First item of a selection, accept regardless of the poll limit
    Force,
    AccordingToPollLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Low priority tier is throttled
    OnlyHighPriority,
    All,
}

/// Two tier deadline scheduler
#[derive(Debug)]
pub struct Scheduler<T: Ord> {
    high: PriorityQueueSchedule<T>,
    low: PriorityQueueSchedule<T>,
    balancer: TotalTimeBalancer,
}

impl<T: Ord> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOW_PRIORITY_LAG)
    }
}

impl<T: Ord> Scheduler<T> {
    pub fn new(max_low_priority_lag: Duration) -> Self {
        Self {
            high: PriorityQueueSchedule::new(),
            low: PriorityQueueSchedule::new(),
            balancer: TotalTimeBalancer::new(max_low_priority_lag, max_low_priority_lag * 2),
        }
    }

    pub fn add_entry(&mut self, data: T, deadline: Instant, priority: Priority) {
        match priority {
            Priority::High => self.high.add_entry(data, deadline),
            Priority::Low => self.low.add_entry(data, deadline),
        }
    }

    /// Earliest deadline over both tiers
    pub fn deadline(&self) -> Option<Instant> {
        match (self.high.deadline(), self.low.deadline()) {
            (Some(high), Some(low)) => Some(high.min(low)),
            (high, low) => high.or(low),
        }
    }

    pub fn high_priority_deadline(&self) -> Option<Instant> {
        self.high.deadline()
    }

    pub fn low_priority_deadline(&self) -> Option<Instant> {
        self.low.deadline()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub fn contains(&self, data: &T) -> bool {
        self.high.contains(data) || self.low.contains(data)
    }

    pub fn remove(&mut self, data: &T) {
        self.high.remove(data);
        self.low.remove(data);
    }

    /// Account the time spent on the last selection
    pub fn update_selection_time(&mut self, delta: Duration, priority: Priority) {
        match priority {
            Priority::High => self.balancer.increment(delta),
            Priority::Low => self.balancer.decrement(delta),
        }
    }

    pub fn reset_load_balancing(&mut self) {
        self.balancer.reset();
    }

    /// Offer ready entries of one tier to `accumulator` until it declines.
    ///
    /// The accumulator gets the entry, the accumulation policy and the poll
    /// budget (`None` is unlimited). Accepted entries leave the queue and must
    /// be re-added by the caller. Returns the tier that was served, if any.
    pub fn accumulate_next<F>(
        &mut self,
        now: Instant,
        policy: SelectionPolicy,
        mut accumulator: F,
    ) -> Option<Priority>
    where
        F: FnMut(&T, AccumulationPolicy, Option<Duration>) -> bool,
    {
        let allow_low = policy == SelectionPolicy::All;
        let force_low = allow_low && (self.balancer.should_decrement() || self.high.is_empty());
        let low_ready = allow_low && self.low.has_ready_items(now);

        if self.high.has_ready_items(now) && (!force_low || !low_ready) {
            Self::accumulate(&mut self.high, now, None, &mut accumulator);
            return Some(Priority::High);
        }
        if low_ready {
            let poll_limit = self.low_priority_poll_limit(now);
            Self::accumulate(&mut self.low, now, poll_limit, &mut accumulator);
            return Some(Priority::Low);
        }
        None
    }

    fn accumulate<F>(
        queue: &mut PriorityQueueSchedule<T>,
        now: Instant,
        poll_limit: Option<Duration>,
        accumulator: &mut F,
    ) where
        F: FnMut(&T, AccumulationPolicy, Option<Duration>) -> bool,
    {
        let mut policy = AccumulationPolicy::Force;
        while queue.has_ready_items(now) {
            let Some(top) = queue.top() else {
                break;
            };
            if !accumulator(&top.data, policy, poll_limit) {
                break;
            }
            queue.pop();
            policy = AccumulationPolicy::AccordingToPollLimit;
        }
    }

    fn low_priority_poll_limit(&self, now: Instant) -> Option<Duration> {
        let high_deadline = self.high.deadline()?;
        match high_deadline.checked_duration_since(now) {
            Some(delta) if !delta.is_zero() => Some(delta),
            _ => Some(self.balancer.time_to_decrement()),
        }
    }
}

/// Register entry of the client schedule.
///
/// Equal deadlines are served by device, then type, then address, then bit offset.
#[derive(Debug, Clone)]
pub struct ScheduledRegister(pub Arc<Register>);

impl ScheduledRegister {
    pub fn register(&self) -> &Arc<Register> {
        &self.0
    }
}

impl PartialEq for ScheduledRegister {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ScheduledRegister {}

impl PartialOrd for ScheduledRegister {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRegister {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.0.config(), other.0.config());
        self.0
            .device()
            .cmp(&other.0.device())
            .then_with(|| a.reg_type.cmp(&b.reg_type))
            .then_with(|| a.address.cmp(&b.address))
            .then_with(|| a.bit_offset.cmp(&b.bit_offset))
            .then_with(|| Arc::as_ptr(&self.0).cmp(&Arc::as_ptr(&other.0)))
    }
}

impl fmt::Display for ScheduledRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Average over the last few durations
#[derive(Debug, Clone, Default)]
pub struct MovingAverage {
    samples: VecDeque<Duration>,
}

impl MovingAverage {
    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == MOVING_AVERAGE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}
