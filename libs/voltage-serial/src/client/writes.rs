//! Pending register writes with a bounded retry window

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::SerialError;
use crate::register::Register;

#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub(crate) register: Arc<Register>,
    pub(crate) raw: u64,
    /// Start of the current run of failures
    pub(crate) first_failure: Option<Instant>,
}

/// What to do with a write after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteRetry {
    Retry,
    GiveUp,
}

impl PendingWrite {
    /// Permanent exceptions give up at once, others after `max_fail_time`
    pub(crate) fn on_failure(&mut self, err: &SerialError, now: Instant, max_fail_time: Duration) -> WriteRetry {
        if err.is_permanent() {
            return WriteRetry::GiveUp;
        }
        let first = *self.first_failure.get_or_insert(now);
        if now.saturating_duration_since(first) >= max_fail_time {
            WriteRetry::GiveUp
        } else {
            WriteRetry::Retry
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<PendingWrite>,
}

impl WriteQueue {
    /// Add new values; a newer value replaces the queued one and its failure history
    pub(crate) fn merge(&mut self, incoming: Vec<(Arc<Register>, u64)>) {
        for (register, raw) in incoming {
            if let Some(existing) = self
                .pending
                .iter_mut()
                .find(|w| Arc::ptr_eq(&w.register, &register))
            {
                existing.raw = raw;
                existing.first_failure = None;
                continue;
            }
            self.pending.push_back(PendingWrite {
                register,
                raw,
                first_failure: None,
            });
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<PendingWrite> {
        self.pending.pop_front()
    }

    /// Put a failed write back for the next flush
    pub(crate) fn requeue(&mut self, writes: Vec<PendingWrite>) {
        self.pending.extend(writes);
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingWrite> {
        self.pending.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::modbus::ModbusException;
    use crate::register::{RegisterAddress, RegisterConfig, RegisterStore, RegisterType};

    fn registers(count: u32) -> Vec<Arc<Register>> {
        let mut store = RegisterStore::new();
        (0..count)
            .map(|addr| {
                let config =
                    RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(addr))
                        .build()
                        .unwrap();
                store.intern(DeviceId(0), config).0
            })
            .collect()
    }

    #[test]
    fn test_merge_replaces_value() {
        let regs = registers(2);
        let mut queue = WriteQueue::default();
        queue.merge(vec![(Arc::clone(&regs[0]), 1), (Arc::clone(&regs[1]), 2)]);
        queue.merge(vec![(Arc::clone(&regs[0]), 3)]);
        assert_eq!(queue.len(), 2);
        let first = queue.pop_front().unwrap();
        assert_eq!(first.raw, 3);
        assert!(Arc::ptr_eq(&first.register, &regs[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_window() {
        let regs = registers(1);
        let mut write = PendingWrite {
            register: Arc::clone(&regs[0]),
            raw: 1,
            first_failure: None,
        };
        let timeout = SerialError::timeout("request timed out");
        let window = Duration::from_secs(600);
        let t0 = Instant::now();

        assert_eq!(write.on_failure(&timeout, t0, window), WriteRetry::Retry);
        assert_eq!(
            write.on_failure(&timeout, t0 + Duration::from_secs(599), window),
            WriteRetry::Retry
        );
        assert_eq!(
            write.on_failure(&timeout, t0 + window, window),
            WriteRetry::GiveUp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_exception_gives_up() {
        let regs = registers(1);
        let mut write = PendingWrite {
            register: Arc::clone(&regs[0]),
            raw: 1,
            first_failure: None,
        };
        let err = SerialError::from(ModbusException::from_code(0x02));
        assert_eq!(
            write.on_failure(&err, Instant::now(), Duration::from_secs(600)),
            WriteRetry::GiveUp
        );
    }
}
