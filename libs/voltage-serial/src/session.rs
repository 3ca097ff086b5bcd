//! Open/close policy of the shared port
//!
//! ```text
//!            open_if_allowed (cooldown passed)
//!   Closed ─────────────────────────────────────► Open
//!     ▲                                            │
//!     └──── close_if_needed (fail time AND cycles) ┘
//! ```
//!
//! A failed open schedules the next attempt `reopen_timeout` later. An open
//! port is closed only after every device failed for longer than
//! `max_fail_time` and for `connection_max_fail_cycles` cycles in a row.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PortOpenCloseSettings;
use crate::error::Result;
use crate::port::Port;

#[derive(Debug)]
pub struct PortSession {
    settings: PortOpenCloseSettings,
    next_open_attempt: Option<Instant>,
    last_success: Option<Instant>,
    remaining_fail_cycles: i32,
}

impl PortSession {
    pub fn new(settings: PortOpenCloseSettings) -> Self {
        let remaining_fail_cycles = settings.connection_max_fail_cycles;
        Self {
            settings,
            next_open_attempt: None,
            last_success: None,
            remaining_fail_cycles,
        }
    }

    pub fn settings(&self) -> &PortOpenCloseSettings {
        &self.settings
    }

    /// Earliest time the next open attempt is allowed
    pub fn next_open_attempt(&self) -> Option<Instant> {
        self.next_open_attempt
    }

    fn reset(&mut self, now: Instant) {
        self.last_success = Some(now);
        self.remaining_fail_cycles = self.settings.connection_max_fail_cycles;
    }

    /// Open a closed port unless the cooldown after a failure is still running.
    ///
    /// Returns Ok(false) while waiting for the cooldown.
    pub async fn open_if_allowed(&mut self, port: &mut dyn Port, now: Instant) -> Result<bool> {
        if port.is_open() {
            return Ok(true);
        }
        if let Some(next) = self.next_open_attempt {
            if now < next {
                return Ok(false);
            }
        }
        match port.open().await {
            Ok(()) => {
                info!("Port opened: {}", port.description());
                self.next_open_attempt = None;
                self.reset(now);
                Ok(true)
            },
            Err(e) => {
                self.next_open_attempt = Some(now + self.settings.reopen_timeout());
                warn!("Port open failed: {} - {}", port.description(), e);
                Err(e)
            },
        }
    }

    /// Count one cycle and close the port once the fail budget is spent
    pub async fn close_if_needed(&mut self, port: &mut dyn Port, all_failed: bool, now: Instant) {
        if !all_failed {
            self.reset(now);
            return;
        }
        let Ok(max_fail_time_ms) = u64::try_from(self.settings.max_fail_time_ms) else {
            return;
        };
        if self.settings.connection_max_fail_cycles < 0 {
            return;
        }
        if self.remaining_fail_cycles > 0 {
            self.remaining_fail_cycles -= 1;
        }
        let last_success = *self.last_success.get_or_insert(now);
        let failing_for = now.saturating_duration_since(last_success);
        if failing_for > Duration::from_millis(max_fail_time_ms) && self.remaining_fail_cycles == 0 {
            if port.is_open() {
                warn!(
                    "Closing port {} after {:?} without answers",
                    port.description(),
                    failing_for
                );
                port.close().await;
            }
            self.reset(now);
        } else {
            debug!(
                "Port fail budget: {} cycles left, failing for {:?}",
                self.remaining_fail_cycles, failing_for
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use crate::port::MockPort;

    #[tokio::test(start_paused = true)]
    async fn test_reopen_cooldown() {
        let mut port = MockPort::new();
        port.set_fail_open(true);
        let mut session = PortSession::new(PortOpenCloseSettings::default());
        let t0 = Instant::now();

        assert!(session.open_if_allowed(&mut port, t0).await.is_err());
        assert_eq!(port.open_calls(), 1);

        // cooldown running, no attempt
        assert!(!session
            .open_if_allowed(&mut port, t0 + Duration::from_secs(4))
            .await
            .unwrap());
        assert_eq!(port.open_calls(), 1);

        port.set_fail_open(false);
        assert!(session
            .open_if_allowed(&mut port, t0 + Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(port.open_calls(), 2);
        assert!(port.is_open());
        assert_eq!(session.next_open_attempt(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_needs_time_and_cycles() {
        let mut port = MockPort::new();
        let t0 = Instant::now();
        let mut session = PortSession::new(PortOpenCloseSettings::default());
        session.open_if_allowed(&mut port, t0).await.unwrap();

        // cycles spent quickly, time bound not reached
        session.close_if_needed(&mut port, true, t0 + Duration::from_secs(1)).await;
        session.close_if_needed(&mut port, true, t0 + Duration::from_secs(2)).await;
        session.close_if_needed(&mut port, true, t0 + Duration::from_secs(3)).await;
        assert!(port.is_open());

        session.close_if_needed(&mut port, true, t0 + Duration::from_millis(5001)).await;
        assert!(!port.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let mut port = MockPort::new();
        let t0 = Instant::now();
        let mut session = PortSession::new(PortOpenCloseSettings::default());
        session.open_if_allowed(&mut port, t0).await.unwrap();

        session.close_if_needed(&mut port, true, t0 + Duration::from_secs(4)).await;
        session.close_if_needed(&mut port, false, t0 + Duration::from_secs(5)).await;
        session.close_if_needed(&mut port, true, t0 + Duration::from_secs(9)).await;
        assert!(port.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_disables_close() {
        let mut port = MockPort::new();
        let t0 = Instant::now();
        let settings = PortOpenCloseSettings {
            max_fail_time_ms: -1,
            ..PortOpenCloseSettings::default()
        };
        let mut session = PortSession::new(settings);
        session.open_if_allowed(&mut port, t0).await.unwrap();
        for i in 0..10 {
            session
                .close_if_needed(&mut port, true, t0 + Duration::from_secs(10 * i))
                .await;
        }
        assert!(port.is_open());
    }
}
