//! Register ranges
//!
//! A [`RegisterRange`] batches registers of one device and one type into a
//! single read request. Ranges live for one poll cycle only.
//!
//! ```text
//!   start                                   start + count
//!     │ reg │ reg │ hole │ reg (2 words) │ reg │
//!     └─────────────── one request ─────────────┘
//! ```
//!
//! Holes (unpolled addresses inside a range) are tolerated up to the
//! device's `max_reg_hole` / `max_bit_hole` until the device proves it
//! rejects them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceId;
use crate::modbus::constants::{
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_UNKNOWN_BITS_PER_READ, POLL_ESTIMATE_OVERHEAD_BYTES,
};
use crate::modbus::read_response_pdu_size;
use crate::port::Port;
use crate::register::{Availability, Register, RegisterType};

/// Per-device bounds applied while building a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeLimits {
    pub max_reg_hole: u16,
    pub max_bit_hole: u16,
    /// 0 means the protocol maximum
    pub max_read_registers: u16,
    /// Cleared once the device rejected a read spanning a hole
    pub supports_holes: bool,
    /// Response timeout counted in poll time estimates
    pub response_timeout: Duration,
    pub request_delay: Duration,
    pub frame_timeout: Duration,
}

impl Default for RangeLimits {
    fn default() -> Self {
        Self {
            max_reg_hole: 0,
            max_bit_hole: 0,
            max_read_registers: 0,
            supports_holes: true,
            response_timeout: Duration::from_millis(500),
            request_delay: Duration::ZERO,
            frame_timeout: Duration::from_millis(20),
        }
    }
}

impl RangeLimits {
    fn max_hole(&self, single_bit: bool) -> u32 {
        if !self.supports_holes {
            return 0;
        }
        u32::from(if single_bit {
            self.max_bit_hole
        } else {
            self.max_reg_hole
        })
    }

    fn max_registers(&self, protocol_max: u16) -> u16 {
        if self.max_read_registers > 0 && self.max_read_registers <= protocol_max {
            self.max_read_registers
        } else {
            protocol_max
        }
    }
}

/// Outcome of the last read of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeStatus {
    #[default]
    Ok,
    /// No usable answer: timeout, garbage, transient exception
    UnknownError,
    /// Device answered with a permanent exception for part of the range
    DeviceError,
}

#[derive(Debug, Clone)]
pub struct RegisterRange {
    limits: RangeLimits,
    registers: Vec<Arc<Register>>,
    start: u32,
    count: u32,
    has_holes: bool,
    status: RangeStatus,
}

impl RegisterRange {
    pub fn new(limits: RangeLimits) -> Self {
        Self {
            limits,
            registers: Vec::new(),
            start: 0,
            count: 0,
            has_holes: false,
            status: RangeStatus::Ok,
        }
    }

    pub fn limits(&self) -> &RangeLimits {
        &self.limits
    }

    pub fn registers(&self) -> &[Arc<Register>] {
        &self.registers
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// First address of the request
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of words (or bits) covered by the request
    pub fn count(&self) -> u16 {
        self.count as u16
    }

    pub fn has_holes(&self) -> bool {
        self.has_holes
    }

    pub fn status(&self) -> RangeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RangeStatus) {
        self.status = status;
    }

    pub fn reg_type(&self) -> Option<RegisterType> {
        self.registers.first().map(|r| r.config().reg_type)
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.registers.first().map(|r| r.device())
    }

    /// Try to add a register; returns false when it belongs to another range.
    ///
    /// Unavailable registers are accepted without being added. A `poll_limit`
    /// of `None` lifts the time budget.
    pub fn add(&mut self, reg: &Arc<Register>, port: &dyn Port, poll_limit: Option<Duration>) -> bool {
        if reg.availability() == Availability::Unavailable {
            return true;
        }

        let config = reg.config();
        let single_bit = config.reg_type.is_single_bit();
        let Ok(addr) = config.address.as_u32() else {
            return false;
        };
        let width = u32::from(config.word16_width());

        let extend = match self.registers.last() {
            None => width,
            Some(last) => {
                if Some(reg.device()) != self.device() || Some(config.reg_type) != self.reg_type() {
                    return false;
                }
                if addr < self.start {
                    return false;
                }
                let end = self.start + self.count;
                if end + self.limits.max_hole(single_bit) < addr {
                    return false;
                }

                if last.availability() == Availability::Unknown {
                    // unknown words are probed one by one
                    if !single_bit {
                        return false;
                    }
                    if end < addr {
                        return false;
                    }
                    let max_unknown = match self.limits.max_read_registers {
                        n if n > 0 && n <= MAX_READ_REGISTERS => u32::from(n),
                        _ => u32::from(MAX_UNKNOWN_BITS_PER_READ),
                    };
                    if reg.availability() == Availability::Unknown
                        && self.registers.len() as u32 >= max_unknown
                    {
                        return false;
                    }
                } else {
                    if reg.availability() == Availability::Unknown {
                        return false;
                    }
                    self.has_holes = self.has_holes || end < addr;
                }

                let extend = (addr + width).saturating_sub(end);
                let protocol_max = if single_bit {
                    MAX_READ_BITS
                } else {
                    MAX_READ_REGISTERS
                };
                if self.count + extend > u32::from(self.limits.max_registers(protocol_max)) {
                    return false;
                }
                extend
            },
        };

        let within_budget = match poll_limit {
            None => true,
            Some(limit) => self.estimate_poll_time(config.reg_type, self.count + extend, port) <= limit,
        };
        if (self.count != 0 && !self.adding_increases_size(single_bit, extend)) || within_budget {
            if self.count == 0 {
                self.start = addr;
            }
            self.registers.push(Arc::clone(reg));
            self.count += extend;
            return true;
        }
        false
    }

    /// Bus time of one read of `count` registers
    pub fn estimate_poll_time(&self, reg_type: RegisterType, count: u32, port: &dyn Port) -> Duration {
        let pdu_size = read_response_pdu_size(reg_type, count.min(u32::from(u16::MAX)) as u16);
        port.send_time(pdu_size + POLL_ESTIMATE_OVERHEAD_BYTES)
            + self.limits.response_timeout
            + self.limits.request_delay
            + 2 * self.limits.frame_timeout
    }

    // bits are packed 16 per request word, extra bits inside the last word are free
    fn adding_increases_size(&self, single_bit: bool, extend: u32) -> bool {
        if !single_bit || self.count % 16 == 0 {
            return true;
        }
        let max_in_words = (self.count / 16 + 1) * 16;
        self.count + extend > max_in_words
    }
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.reg_type(), self.device()) {
            (Some(reg_type), Some(device)) => write!(
                f,
                "{} {}(s) @ {} of device {}",
                self.count,
                reg_type.name(),
                self.start,
                device
            ),
            _ => f.write_str("empty range"),
        }
    }
}

/// Folds sorted registers into ranges
pub struct RangeBuilder;

impl RangeBuilder {
    /// Split registers of one device into ranges without a time budget.
    ///
    /// Registers are sorted by type and address first; unavailable ones are dropped.
    pub fn split(registers: &[Arc<Register>], limits: &RangeLimits, port: &dyn Port) -> Vec<RegisterRange> {
        let mut sorted: Vec<&Arc<Register>> = registers.iter().collect();
        sorted.sort_by(|a, b| {
            let (a, b) = (a.config(), b.config());
            (a.reg_type, &a.address, a.bit_offset).cmp(&(b.reg_type, &b.address, b.bit_offset))
        });

        let mut ranges = Vec::new();
        let mut current = RegisterRange::new(limits.clone());
        for reg in sorted {
            if !current.add(reg, port, None) {
                ranges.push(std::mem::replace(&mut current, RegisterRange::new(limits.clone())));
                // a fresh range accepts any numeric register
                if !current.add(reg, port, None) {
                    continue;
                }
            }
        }
        if !current.is_empty() {
            ranges.push(current);
        }
        ranges.retain(|range| !range.is_empty());
        ranges
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use crate::port::MockPort;
    use crate::register::{RegisterAddress, RegisterConfig, RegisterFormat, RegisterStore};

    fn register(
        store: &mut RegisterStore,
        reg_type: RegisterType,
        addr: u32,
        availability: Availability,
    ) -> Arc<Register> {
        let config = RegisterConfig::builder(reg_type, RegisterAddress::Numeric(addr))
            .build()
            .unwrap();
        let (reg, _) = store.intern(DeviceId(0), config);
        reg.set_availability(availability);
        reg
    }

    fn holding(store: &mut RegisterStore, addrs: &[u32]) -> Vec<Arc<Register>> {
        addrs
            .iter()
            .map(|a| register(store, RegisterType::Holding, *a, Availability::Available))
            .collect()
    }

    #[test]
    fn test_contiguous_registers_form_one_range() {
        let mut store = RegisterStore::new();
        let regs = holding(&mut store, &[10, 11, 12]);
        let ranges = RangeBuilder::split(&regs, &RangeLimits::default(), &MockPort::new());
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start(), 10);
        assert_eq!(ranges[0].count(), 3);
        assert!(!ranges[0].has_holes());
    }

    #[test]
    fn test_gap_above_max_hole_splits() {
        let mut store = RegisterStore::new();
        let regs = holding(&mut store, &[10, 11, 15]);
        let port = MockPort::new();

        let ranges = RangeBuilder::split(&regs, &RangeLimits::default(), &port);
        assert_eq!(ranges.len(), 2);

        let limits = RangeLimits {
            max_reg_hole: 3,
            ..RangeLimits::default()
        };
        let ranges = RangeBuilder::split(&regs, &limits, &port);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].count(), 6);
        assert!(ranges[0].has_holes());

        let limits = RangeLimits {
            supports_holes: false,
            ..limits
        };
        assert_eq!(RangeBuilder::split(&regs, &limits, &port).len(), 2);
    }

    #[test]
    fn test_max_read_registers() {
        let mut store = RegisterStore::new();
        let regs = holding(&mut store, &[0, 1, 2, 3, 4]);
        let limits = RangeLimits {
            max_read_registers: 2,
            ..RangeLimits::default()
        };
        let ranges = RangeBuilder::split(&regs, &limits, &MockPort::new());
        let counts: Vec<_> = ranges.iter().map(|r| r.count()).collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_unknown_words_read_alone() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let a = register(&mut store, RegisterType::Input, 1, Availability::Unknown);
        let b = register(&mut store, RegisterType::Input, 2, Availability::Unknown);
        let mut range = RegisterRange::new(RangeLimits::default());
        assert!(range.add(&a, &port, None));
        assert!(!range.add(&b, &port, None));
    }

    #[test]
    fn test_unknown_bits_batch_up_to_sixteen() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let mut range = RegisterRange::new(RangeLimits::default());
        for addr in 0..16 {
            let coil = register(&mut store, RegisterType::Coil, addr, Availability::Unknown);
            assert!(range.add(&coil, &port, None));
        }
        let coil = register(&mut store, RegisterType::Coil, 16, Availability::Unknown);
        assert!(!range.add(&coil, &port, None));
        assert_eq!(range.count(), 16);
    }

    #[test]
    fn test_available_and_unknown_not_mixed() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let a = register(&mut store, RegisterType::Holding, 1, Availability::Available);
        let b = register(&mut store, RegisterType::Holding, 2, Availability::Unknown);
        let mut range = RegisterRange::new(RangeLimits::default());
        assert!(range.add(&a, &port, None));
        assert!(!range.add(&b, &port, None));
    }

    #[test]
    fn test_unavailable_skipped() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let a = register(&mut store, RegisterType::Holding, 1, Availability::Unavailable);
        let mut range = RegisterRange::new(RangeLimits::default());
        assert!(range.add(&a, &port, None));
        assert!(range.is_empty());
    }

    #[test]
    fn test_other_type_or_device() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let a = register(&mut store, RegisterType::Holding, 1, Availability::Available);
        let b = register(&mut store, RegisterType::Input, 2, Availability::Available);
        let config = RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(2))
            .build()
            .unwrap();
        let (c, _) = store.intern(DeviceId(1), config);
        c.set_availability(Availability::Available);

        let mut range = RegisterRange::new(RangeLimits::default());
        assert!(range.add(&a, &port, None));
        assert!(!range.add(&b, &port, None));
        assert!(!range.add(&c, &port, None));
        assert!(!range.add(&register(&mut store, RegisterType::Holding, 0, Availability::Available), &port, None));
    }

    #[test]
    fn test_poll_limit() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let regs = holding(&mut store, &[1, 2]);
        let mut range = RegisterRange::new(RangeLimits::default());
        // 500ms response + 2 * 20ms frame + send time
        let estimate = range.estimate_poll_time(RegisterType::Holding, 1, &port);
        assert_eq!(estimate, Duration::from_micros(540_000 + 14_167));
        assert!(!range.add(&regs[0], &port, Some(Duration::from_millis(100))));
        assert!(range.add(&regs[0], &port, Some(Duration::from_secs(1))));
        assert!(range.add(&regs[1], &port, None));
        assert_eq!(range.to_string(), "2 holding(s) @ 1 of device #0");
    }

    #[test]
    fn test_multi_word_extends() {
        let mut store = RegisterStore::new();
        let port = MockPort::new();
        let config = RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(4))
            .format(RegisterFormat::U32)
            .build()
            .unwrap();
        let (wide, _) = store.intern(DeviceId(0), config);
        wide.set_availability(Availability::Available);
        let next = register(&mut store, RegisterType::Holding, 6, Availability::Available);

        let mut range = RegisterRange::new(RangeLimits::default());
        assert!(range.add(&wide, &port, None));
        assert!(range.add(&next, &port, None));
        assert_eq!((range.start(), range.count()), (4, 3));
    }
}
