//! Register data model
//!
//! A [`RegisterConfig`] describes where a value lives on a device and how its
//! raw bits map to text. A [`Register`] binds one config to one device and
//! carries the runtime state the client loop maintains for it.
//!
//! # Geometry
//!
//! ```text
//! word16_width = (ceil((bit_offset + bit_width) / 8) + 1) / 2
//!
//!   word 0 (address)      word 1 (address + 1)
//!  ┌────────────────┐    ┌────────────────┐
//!  │ high ... low   │    │ high ... low   │   big endian: word 0 is most significant
//!  └────────────────┘    └────────────────┘
//! ```
//!
//! Registers are interned by [`RegisterStore`]: the same (device, config)
//! pair always yields the same `Arc<Register>`.

pub mod bcd;
pub mod conversion;
pub mod format;
pub mod packing;

pub use conversion::{format_g, from_raw, invert_word_order_if_needed, to_raw};
pub use format::{RegisterFormat, WordOrder};
pub use packing::{compose_words, extract_value};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::device::DeviceId;
use crate::error::{Result, SerialError};
use crate::scheduler::MovingAverage;

/// Location of a register on its device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterAddress {
    Numeric(u32),
    Text(String),
}

impl RegisterAddress {
    /// Address of the word `words` positions after this one
    pub fn offset(&self, words: u32) -> Result<Self> {
        match self {
            RegisterAddress::Numeric(addr) => addr
                .checked_add(words)
                .map(RegisterAddress::Numeric)
                .ok_or_else(|| SerialError::config(format!("address {addr} + {words} overflows"))),
            RegisterAddress::Text(name) => Err(SerialError::not_supported(format!(
                "offset arithmetic on text address '{name}'"
            ))),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match self {
            RegisterAddress::Numeric(addr) => Ok(*addr),
            RegisterAddress::Text(name) => Err(SerialError::not_supported(format!(
                "text address '{name}' on a numeric protocol"
            ))),
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterAddress::Numeric(addr) => write!(f, "{addr}"),
            RegisterAddress::Text(name) => f.write_str(name),
        }
    }
}

/// Modbus register table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Coil,
    Discrete,
    Holding,
    HoldingSingle,
    HoldingMulti,
    Input,
}

impl RegisterType {
    pub fn is_single_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }

    pub fn name(self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Holding => "holding",
            RegisterType::HoldingSingle => "holding_single",
            RegisterType::HoldingMulti => "holding_multi",
            RegisterType::Input => "input",
        }
    }
}

/// Static description of a register
#[derive(Debug, Clone)]
pub struct RegisterConfig {
    pub reg_type: RegisterType,
    pub address: RegisterAddress,
    pub format: RegisterFormat,
    pub scale: f64,
    pub offset: f64,
    /// Rounding step applied to rendered values, 0 disables rounding
    pub round_to: f64,
    pub word_order: WordOrder,
    pub bit_offset: u8,
    /// Width in bits, 0 means the full format width
    pub bit_width: u8,
    /// Fixed poll period; registers without one are polled with low priority
    pub read_period: Option<Duration>,
    /// Minimal interval between reads of a low priority register
    pub read_rate_limit: Option<Duration>,
    pub read_only: bool,
    /// Raw value meaning "not supported by this device"
    pub unsupported_value: Option<u64>,
    /// Raw value meaning "device reports an error"
    pub error_value: Option<u64>,
}

impl RegisterConfig {
    pub fn builder(reg_type: RegisterType, address: RegisterAddress) -> RegisterConfigBuilder {
        RegisterConfigBuilder::new(reg_type, address)
    }

    pub fn byte_width(&self) -> u8 {
        self.format.byte_width()
    }

    pub fn bit_width(&self) -> u32 {
        if self.bit_width != 0 {
            return u32::from(self.bit_width);
        }
        u32::from(self.byte_width()) * 8
    }

    /// Number of 16-bit words spanned by the value
    pub fn word16_width(&self) -> u16 {
        let bits = u32::from(self.bit_offset) + self.bit_width();
        ((bits.div_ceil(8) + 1) / 2) as u16
    }

    pub fn is_high_priority(&self) -> bool {
        self.read_period.is_some()
    }

    pub fn to_raw(&self, text: &str) -> Result<u64> {
        to_raw(self, text)
    }

    pub fn from_raw(&self, raw: u64) -> String {
        from_raw(self, raw)
    }

    #[allow(clippy::type_complexity)]
    fn key(
        &self,
    ) -> (
        (RegisterType, &RegisterAddress, RegisterFormat, u64, u64, u64, WordOrder),
        (u8, u8, Option<Duration>, Option<Duration>, bool, Option<u64>, Option<u64>),
    ) {
        (
            (
                self.reg_type,
                &self.address,
                self.format,
                self.scale.to_bits(),
                self.offset.to_bits(),
                self.round_to.to_bits(),
                self.word_order,
            ),
            (
                self.bit_offset,
                self.bit_width,
                self.read_period,
                self.read_rate_limit,
                self.read_only,
                self.unsupported_value,
                self.error_value,
            ),
        )
    }
}

impl PartialEq for RegisterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RegisterConfig {}

impl Hash for RegisterConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for RegisterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {}>", self.reg_type.name(), self.address)?;
        if self.bit_offset != 0 || self.bit_width != 0 {
            write!(f, ":{}:{}", self.bit_offset, self.bit_width())?;
        }
        Ok(())
    }
}

/// Fluent builder for [`RegisterConfig`], validates geometry on `build`
#[derive(Debug, Clone)]
pub struct RegisterConfigBuilder {
    config: RegisterConfig,
}

impl RegisterConfigBuilder {
    fn new(reg_type: RegisterType, address: RegisterAddress) -> Self {
        Self {
            config: RegisterConfig {
                reg_type,
                address,
                format: RegisterFormat::U16,
                scale: 1.0,
                offset: 0.0,
                round_to: 0.0,
                word_order: WordOrder::BigEndian,
                bit_offset: 0,
                bit_width: 0,
                read_period: None,
                read_rate_limit: None,
                read_only: false,
                unsupported_value: None,
                error_value: None,
            },
        }
    }

    pub fn format(mut self, format: RegisterFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.config.scale = scale;
        self
    }

    pub fn offset(mut self, offset: f64) -> Self {
        self.config.offset = offset;
        self
    }

    pub fn round_to(mut self, round_to: f64) -> Self {
        self.config.round_to = round_to;
        self
    }

    pub fn word_order(mut self, word_order: WordOrder) -> Self {
        self.config.word_order = word_order;
        self
    }

    pub fn bits(mut self, bit_offset: u8, bit_width: u8) -> Self {
        self.config.bit_offset = bit_offset;
        self.config.bit_width = bit_width;
        self
    }

    pub fn read_period(mut self, period: Duration) -> Self {
        self.config.read_period = Some(period);
        self
    }

    pub fn read_rate_limit(mut self, interval: Duration) -> Self {
        self.config.read_rate_limit = Some(interval);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn unsupported_value(mut self, raw: u64) -> Self {
        self.config.unsupported_value = Some(raw);
        self
    }

    pub fn error_value(mut self, raw: u64) -> Self {
        self.config.error_value = Some(raw);
        self
    }

    pub fn build(self) -> Result<RegisterConfig> {
        let config = self.config;
        if config.reg_type.is_single_bit() {
            let plain = matches!(config.format, RegisterFormat::U8 | RegisterFormat::U16);
            if !plain || config.bit_offset != 0 || config.bit_width > 1 {
                return Err(SerialError::config(format!(
                    "{} register holds a single bit, format {} is not allowed",
                    config.reg_type.name(),
                    config.format
                )));
            }
        }
        let max_offset = u32::from(config.byte_width()) * 8;
        if u32::from(config.bit_offset) >= max_offset {
            return Err(SerialError::config(format!(
                "bit offset must not exceed {max_offset} bits"
            )));
        }
        if config.scale == 0.0 {
            return Err(SerialError::config("scale must not be zero"));
        }
        Ok(config)
    }
}

/// Whether the device is known to serve a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

/// Error flags of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorState(u8);

impl ErrorState {
    pub const READ_ERROR: u8 = 0b001;
    pub const WRITE_ERROR: u8 = 0b010;
    pub const POLL_INTERVAL_MISS: u8 = 0b100;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn has_io_error(self) -> bool {
        self.contains(Self::READ_ERROR | Self::WRITE_ERROR)
    }

    fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::READ_ERROR) {
            names.push("r");
        }
        if self.contains(Self::WRITE_ERROR) {
            names.push("w");
        }
        if self.contains(Self::POLL_INTERVAL_MISS) {
            names.push("p");
        }
        f.write_str(&names.join(""))
    }
}

#[derive(Debug)]
struct RegisterState {
    value: u64,
    availability: Availability,
    errors: ErrorState,
    last_poll: Option<Instant>,
    poll_interval: MovingAverage,
}

/// A register bound to one device
#[derive(Debug)]
pub struct Register {
    device: DeviceId,
    config: Arc<RegisterConfig>,
    state: Mutex<RegisterState>,
}

impl Register {
    fn new(device: DeviceId, config: Arc<RegisterConfig>) -> Self {
        Self {
            device,
            config,
            state: Mutex::new(RegisterState {
                value: 0,
                availability: Availability::Unknown,
                errors: ErrorState::default(),
                last_poll: None,
                poll_interval: MovingAverage::default(),
            }),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn config(&self) -> &RegisterConfig {
        &self.config
    }

    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    pub fn text_value(&self) -> String {
        self.config.from_raw(self.value())
    }

    /// Store a freshly read raw value and derive availability/error from it
    pub fn set_value(&self, raw: u64) {
        let mut state = self.state.lock();
        if state.value != raw {
            debug!("new val for {}: {:#x}", self, raw);
        }
        state.value = raw;

        let unsupported = self.config.unsupported_value == Some(raw);
        if unsupported {
            state.errors.set(ErrorState::READ_ERROR);
            state.availability = Availability::Unavailable;
        } else {
            state.availability = Availability::Available;
        }

        let error_value = self
            .config
            .error_value
            .map(|v| invert_word_order_if_needed(&self.config, v));
        if error_value == Some(raw) {
            debug!("register {} contains error value", self);
            state.errors.set(ErrorState::READ_ERROR);
        } else if !unsupported {
            state.errors.clear(ErrorState::READ_ERROR);
        }
    }

    /// Store a value the device accepted in a write
    pub fn set_written_value(&self, raw: u64) {
        let mut state = self.state.lock();
        if state.value != raw {
            debug!("written val for {}: {:#x}", self, raw);
        }
        state.value = raw;
        state.errors.clear(ErrorState::WRITE_ERROR);
    }

    pub fn availability(&self) -> Availability {
        self.state.lock().availability
    }

    pub fn set_availability(&self, availability: Availability) {
        self.state.lock().availability = availability;
    }

    pub fn errors(&self) -> ErrorState {
        self.state.lock().errors
    }

    pub fn set_error(&self, flag: u8) {
        self.state.lock().errors.set(flag);
    }

    pub fn clear_error(&self, flag: u8) {
        self.state.lock().errors.clear(flag);
    }

    /// Record the start of a poll; flags a missed poll interval for high priority registers
    pub fn set_last_poll_time(&self, poll_time: Instant) {
        let mut state = self.state.lock();
        if let Some(last) = state.last_poll {
            let interval = poll_time.saturating_duration_since(last);
            state.poll_interval.push(interval);
            if let Some(period) = self.config.read_period {
                if interval > period {
                    state.errors.set(ErrorState::POLL_INTERVAL_MISS);
                } else {
                    state.errors.clear(ErrorState::POLL_INTERVAL_MISS);
                }
            }
        }
        state.last_poll = Some(poll_time);
    }

    pub fn last_poll_time(&self) -> Option<Instant> {
        self.state.lock().last_poll
    }

    /// Moving average of the realized poll interval
    pub fn average_poll_interval(&self) -> Option<Duration> {
        self.state.lock().poll_interval.average()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of device {}", self.config, self.device)
    }
}

/// Interning table for registers
#[derive(Debug, Default)]
pub struct RegisterStore {
    index: HashMap<(DeviceId, RegisterConfig), Arc<Register>>,
    ordered: Vec<Arc<Register>>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the register for (device, config), creating it on first use.
    /// The flag is true when a new register was created.
    pub fn intern(&mut self, device: DeviceId, config: RegisterConfig) -> (Arc<Register>, bool) {
        if let Some(existing) = self.index.get(&(device, config.clone())) {
            return (Arc::clone(existing), false);
        }
        let register = Arc::new(Register::new(device, Arc::new(config.clone())));
        self.index.insert((device, config), Arc::clone(&register));
        self.ordered.push(Arc::clone(&register));
        (register, true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Register>> {
        self.ordered.iter()
    }

    pub fn for_device(&self, device: DeviceId) -> impl Iterator<Item = &Arc<Register>> {
        self.ordered.iter().filter(move |r| r.device() == device)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
