//! Modbus RTU and Modbus TCP support
//!
//! ```text
//! codec     read ranges / write registers, degradation on exceptions
//!   │
//! pdu       request building, response parsing, exceptions
//!   │
//! transport RTU (slave + CRC16) or TCP (MBAP header) framing
//!   │
//! Port      byte stream with frame timing
//! ```

pub mod cache;
pub mod codec;
pub mod constants;
pub mod pdu;
pub mod transport;

pub use cache::{RegisterCache, TentativeWrite};
pub use codec::{
    process_request, read_range, read_register_range, validate_register, write_register,
    ModbusContext, RequestTiming,
};
pub use pdu::{
    function_code, is_packing, read_response_pdu_size, ModbusException, ModbusPdu, Operation,
    PduBuilder,
};
pub use transport::{crc16, ModbusTraits, RtuTraits, TcpTraits};
