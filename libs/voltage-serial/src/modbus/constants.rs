//! Modbus protocol constants

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header length (transaction id + protocol id + length + unit id)
pub const MBAP_HEADER_LEN: usize = 7;

/// RTU bytes outside the PDU: slave id and CRC
pub const RTU_OVERHEAD: usize = 3;

pub const EXCEPTION_BIT: u8 = 0x80;
pub const EXCEPTION_RESPONSE_PDU_SIZE: usize = 2;
pub const WRITE_RESPONSE_PDU_SIZE: usize = 5;
pub const READ_REQUEST_PDU_SIZE: usize = 5;

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_RW_WRITE_REGISTERS: u16 = 121;

/// Unknown single-bit registers probed per request when the device sets no limit
pub const MAX_UNKNOWN_BITS_PER_READ: u16 = 16;

/// Read request plus response framing overhead used for poll time estimates:
/// 8 request bytes (slave, function, address, count, CRC) and 5 response bytes
/// (slave, function, byte count, CRC)
pub const POLL_ESTIMATE_OVERHEAD_BYTES: usize = 13;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE: u8 = 0x02;
pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_READ_INPUT: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_READ_WRITE_MULTIPLE: u8 = 0x17;

pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;
