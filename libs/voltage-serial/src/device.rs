//! Devices on the shared bus
//!
//! A [`Device`] turns register ranges and writes into protocol transactions
//! on a borrowed [`Port`]. It also tracks whether the slave still answers:
//! [`DeviceState::set_transfer_result`] is fed after every exchange and flips
//! the connection state once the fail budget is exhausted.

pub mod modbus;
pub mod registry;

pub use self::modbus::ModbusDevice;
pub use registry::{DeviceFactory, ProtocolRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::port::Port;
use crate::range::{RangeLimits, RegisterRange};
use crate::register::{Register, RegisterConfig};
use crate::scheduler::MovingAverage;

/// Index of a device inside its client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state of a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No exchange finished yet
    #[default]
    Unknown,
    /// Last exchange got an answer
    Connected,
    /// Fail budget exhausted
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "UNKNOWN"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Fail budget after which a silent device counts as disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectPolicy {
    pub max_fail_cycles: u32,
    pub timeout: Duration,
}

impl DisconnectPolicy {
    /// None when either setting is negative
    pub fn from_config(config: &DeviceConfig) -> Option<Self> {
        let cycles = u32::try_from(config.device_max_fail_cycles).ok()?;
        let timeout_ms = u64::try_from(config.device_timeout_ms).ok()?;
        Some(Self {
            max_fail_cycles: cycles,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// Runtime state shared by all device implementations
#[derive(Debug)]
pub struct DeviceState {
    name: String,
    policy: Option<DisconnectPolicy>,
    connection: ConnectionState,
    last_success: Option<Instant>,
    remaining_fail_cycles: u32,
    supports_holes: bool,
    changed: Option<ConnectionState>,
    request_duration: MovingAverage,
}

impl DeviceState {
    pub fn new(name: impl Into<String>, policy: Option<DisconnectPolicy>) -> Self {
        Self {
            name: name.into(),
            policy,
            connection: ConnectionState::Unknown,
            last_success: None,
            remaining_fail_cycles: policy.map(|p| p.max_fail_cycles).unwrap_or_default(),
            supports_holes: true,
            changed: None,
            request_duration: MovingAverage::default(),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.connection == ConnectionState::Disconnected
    }

    pub fn supports_holes(&self) -> bool {
        self.supports_holes
    }

    pub fn supports_holes_mut(&mut self) -> &mut bool {
        &mut self.supports_holes
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Record the outcome of one exchange.
    ///
    /// Without a policy failures are ignored. A device that never answered
    /// counts as timed out.
    pub fn set_transfer_result(&mut self, ok: bool, now: Instant) {
        if ok {
            self.last_success = Some(now);
            if let Some(policy) = self.policy {
                self.remaining_fail_cycles = policy.max_fail_cycles;
            }
            if self.connection != ConnectionState::Connected {
                info!("[{}] connected", self.name);
                self.connection = ConnectionState::Connected;
                self.changed = Some(ConnectionState::Connected);
            }
            return;
        }

        let Some(policy) = self.policy else {
            return;
        };
        self.remaining_fail_cycles = self.remaining_fail_cycles.saturating_sub(1);
        let timed_out = self
            .last_success
            .is_none_or(|last| now.saturating_duration_since(last) > policy.timeout);
        if self.remaining_fail_cycles == 0
            && self.connection != ConnectionState::Disconnected
            && timed_out
        {
            self.set_disconnected();
        }
    }

    pub fn set_disconnected(&mut self) {
        info!("[{}] disconnected", self.name);
        self.supports_holes = true;
        self.connection = ConnectionState::Disconnected;
        self.changed = Some(ConnectionState::Disconnected);
    }

    /// The state change since the last call, if any
    pub fn take_state_change(&mut self) -> Option<ConnectionState> {
        self.changed.take()
    }

    pub fn record_request_duration(&mut self, duration: Duration) {
        self.request_duration.push(duration);
    }

    /// Moving average of range read durations
    pub fn average_request_duration(&self) -> Option<Duration> {
        self.request_duration.average()
    }
}

/// Protocol side of one slave
///
/// @trait Device
/// @purpose Run protocol transactions for one slave on a borrowed port
/// @implementors ModbusDevice, device specific adapters via ProtocolRegistry
#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;

    fn config(&self) -> &DeviceConfig;

    fn state(&self) -> &DeviceState;

    fn state_mut(&mut self) -> &mut DeviceState;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Reject registers the protocol cannot serve
    fn validate_register(&self, config: &RegisterConfig) -> Result<()>;

    fn range_limits(&self) -> RangeLimits {
        let config = self.config();
        RangeLimits {
            max_reg_hole: config.max_reg_hole,
            max_bit_hole: config.max_bit_hole,
            max_read_registers: config.max_read_registers,
            supports_holes: self.state().supports_holes(),
            response_timeout: config.configured_response_timeout().unwrap_or_default(),
            request_delay: config.request_delay(),
            frame_timeout: config.frame_timeout(),
        }
    }

    /// Empty range bounded by this device's limits
    fn create_register_range(&self) -> RegisterRange {
        RegisterRange::new(self.range_limits())
    }

    /// Start a session before the first exchange
    async fn prepare(&mut self, port: &mut dyn Port) -> Result<()>;

    /// Leave the bus clean for the next device
    async fn end_session(&mut self, _port: &mut dyn Port) -> Result<()> {
        Ok(())
    }

    /// Read a range, updating register values, errors and the device state
    async fn read_register_range(&mut self, port: &mut dyn Port, range: &mut RegisterRange);

    /// Write a raw value to a register
    async fn write_register(&mut self, port: &mut dyn Port, reg: &Register, raw: u64) -> Result<()>;
}

/// Log an end-of-session failure without failing the cycle
pub(crate) fn log_end_session_error(device: &dyn Device, err: &crate::error::SerialError) {
    if device.state().is_disconnected() {
        debug!("[{}] end session failed: {}", device.name(), err);
    } else {
        tracing::warn!("[{}] end session failed: {}", device.name(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Option<DisconnectPolicy> {
        Some(DisconnectPolicy {
            max_fail_cycles: 2,
            timeout: Duration::from_secs(3),
        })
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = DeviceConfig::new("meter", 1);
        assert_eq!(
            DisconnectPolicy::from_config(&config),
            Some(DisconnectPolicy {
                max_fail_cycles: 2,
                timeout: Duration::from_secs(3)
            })
        );
        config.device_timeout_ms = -1;
        assert_eq!(DisconnectPolicy::from_config(&config), None);
        config.device_timeout_ms = 3000;
        config.device_max_fail_cycles = -1;
        assert_eq!(DisconnectPolicy::from_config(&config), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_disconnect() {
        let mut state = DeviceState::new("meter", policy());
        let t0 = Instant::now();

        state.set_transfer_result(true, t0);
        assert!(state.is_connected());
        assert_eq!(state.take_state_change(), Some(ConnectionState::Connected));
        assert_eq!(state.take_state_change(), None);

        // budget exhausted but the timeout has not passed yet
        state.set_transfer_result(false, t0 + Duration::from_secs(1));
        state.set_transfer_result(false, t0 + Duration::from_secs(2));
        assert!(state.is_connected());

        *state.supports_holes_mut() = false;
        state.set_transfer_result(false, t0 + Duration::from_millis(3001));
        assert!(state.is_disconnected());
        assert!(state.supports_holes());
        assert_eq!(state.take_state_change(), Some(ConnectionState::Disconnected));

        // no repeated notification while staying disconnected
        state.set_transfer_result(false, t0 + Duration::from_secs(10));
        assert_eq!(state.take_state_change(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_budget() {
        let mut state = DeviceState::new("meter", policy());
        let t0 = Instant::now();
        state.set_transfer_result(true, t0);
        state.set_transfer_result(false, t0 + Duration::from_secs(4));
        state.set_transfer_result(true, t0 + Duration::from_secs(5));
        state.set_transfer_result(false, t0 + Duration::from_secs(9));
        assert!(state.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_answered() {
        let mut state = DeviceState::new("meter", policy());
        let now = Instant::now();
        state.set_transfer_result(false, now);
        assert_eq!(state.connection(), ConnectionState::Unknown);
        state.set_transfer_result(false, now);
        assert!(state.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy() {
        let mut state = DeviceState::new("meter", None);
        let now = Instant::now();
        for _ in 0..10 {
            state.set_transfer_result(false, now);
        }
        assert_eq!(state.connection(), ConnectionState::Unknown);
        assert_eq!(state.take_state_change(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceId(3).to_string(), "#3");
        assert_eq!(ConnectionState::Disconnected.to_string(), "DISCONNECTED");
    }
}
