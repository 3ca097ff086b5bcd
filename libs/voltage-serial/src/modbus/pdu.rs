//! Modbus PDU construction and response parsing

use thiserror::Error;
use tracing::debug;

use super::constants::*;
use crate::error::{Result, SerialError};
use crate::register::{RegisterConfig, RegisterType};

/// Exception codes returned by a device
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    #[error("illegal function")]
    IllegalFunction,
    #[error("illegal data address")]
    IllegalDataAddress,
    #[error("illegal data value")]
    IllegalDataValue,
    #[error("server device failure")]
    ServerDeviceFailure,
    #[error("long operation (acknowledge)")]
    Acknowledge,
    #[error("server device is busy")]
    ServerDeviceBusy,
    #[error("memory parity error")]
    MemoryParityError,
    #[error("gateway path is unavailable")]
    GatewayPathUnavailable,
    #[error("gateway target device failed to respond")]
    GatewayTargetFailedToRespond,
    #[error("invalid modbus error code ({0})")]
    Unknown(u8),
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ModbusException::IllegalFunction,
            0x02 => ModbusException::IllegalDataAddress,
            0x03 => ModbusException::IllegalDataValue,
            0x04 => ModbusException::ServerDeviceFailure,
            0x05 => ModbusException::Acknowledge,
            0x06 => ModbusException::ServerDeviceBusy,
            0x08 => ModbusException::MemoryParityError,
            0x0A => ModbusException::GatewayPathUnavailable,
            0x0B => ModbusException::GatewayTargetFailedToRespond,
            other => ModbusException::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ModbusException::IllegalFunction => 0x01,
            ModbusException::IllegalDataAddress => 0x02,
            ModbusException::IllegalDataValue => 0x03,
            ModbusException::ServerDeviceFailure => 0x04,
            ModbusException::Acknowledge => 0x05,
            ModbusException::ServerDeviceBusy => 0x06,
            ModbusException::MemoryParityError => 0x08,
            ModbusException::GatewayPathUnavailable => 0x0A,
            ModbusException::GatewayTargetFailedToRespond => 0x0B,
            ModbusException::Unknown(code) => code,
        }
    }

    /// The register can never be served by this device
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ModbusException::IllegalFunction
                | ModbusException::IllegalDataAddress
                | ModbusException::IllegalDataValue
        )
    }
}

/// Request PDU of at most [`MAX_PDU_SIZE`] bytes
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(SerialError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(SerialError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_BIT {
            FC_READ_COILS => "Read Coils",
            FC_READ_DISCRETE => "Read Discrete Inputs",
            FC_READ_HOLDING => "Read Holding Registers",
            FC_READ_INPUT => "Read Input Registers",
            FC_WRITE_SINGLE_COIL => "Write Single Coil",
            FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
            FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
            FC_READ_WRITE_MULTIPLE => "Read/Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    pub fn words(mut self, words: &[u16]) -> Result<Self> {
        for word in words {
            self.pdu.push_u16(*word)?;
        }
        Ok(self)
    }

    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// Read request for FC01-04
    pub fn build_read_request(fc: u8, start_address: u16, quantity: u16) -> Result<ModbusPdu> {
        let max = match fc {
            FC_READ_COILS | FC_READ_DISCRETE => MAX_READ_BITS,
            FC_READ_HOLDING | FC_READ_INPUT => MAX_READ_REGISTERS,
            _ => {
                return Err(SerialError::protocol(format!(
                    "build_read_request only supports FC01-04, got FC{fc:02X}"
                )))
            },
        };
        check_quantity(quantity, max)?;
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// FC05 / FC06
    pub fn build_write_single(fc: u8, address: u16, value: u16) -> Result<ModbusPdu> {
        if !matches!(fc, FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER) {
            return Err(SerialError::protocol(format!(
                "build_write_single only supports FC05/06, got FC{fc:02X}"
            )));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// FC16
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> Result<ModbusPdu> {
        let quantity = values.len() as u16;
        check_quantity(quantity, MAX_WRITE_REGISTERS)?;
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(quantity)?
            .byte((quantity * 2) as u8)?
            .words(values)?
            .build())
    }

    /// FC15, coils packed LSB first
    pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> Result<ModbusPdu> {
        let quantity = values.len() as u16;
        check_quantity(quantity, MAX_WRITE_BITS)?;
        let packed: Vec<u8> = values
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |byte, (i, on)| byte | (u8::from(*on) << i))
            })
            .collect();
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(address)?
            .quantity(quantity)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    /// FC23: write `values` at `write_address`, then read `read_quantity` registers
    pub fn build_read_write_multiple(
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<ModbusPdu> {
        let write_quantity = values.len() as u16;
        check_quantity(read_quantity, MAX_READ_REGISTERS)?;
        check_quantity(write_quantity, MAX_RW_WRITE_REGISTERS)?;
        Ok(PduBuilder::new()
            .function_code(FC_READ_WRITE_MULTIPLE)?
            .address(read_address)?
            .quantity(read_quantity)?
            .address(write_address)?
            .quantity(write_quantity)?
            .byte((write_quantity * 2) as u8)?
            .words(values)?
            .build())
    }
}

fn check_quantity(quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(SerialError::protocol(format!(
            "quantity {quantity} out of range 1..={max}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Register needs a single FC16 write instead of per-word writes
pub fn is_packing(config: &RegisterConfig) -> bool {
    config.reg_type == RegisterType::HoldingMulti
        || (config.reg_type == RegisterType::Holding && config.word16_width() > 1)
}

/// Choose the function code for an operation on a register type
pub fn function_code(reg_type: RegisterType, op: Operation, many: bool) -> Result<u8> {
    match (reg_type, op) {
        (
            RegisterType::Holding | RegisterType::HoldingSingle | RegisterType::HoldingMulti,
            Operation::Read,
        ) => Ok(FC_READ_HOLDING),
        (
            RegisterType::Holding | RegisterType::HoldingSingle | RegisterType::HoldingMulti,
            Operation::Write,
        ) => Ok(if many {
            FC_WRITE_MULTIPLE_REGISTERS
        } else {
            FC_WRITE_SINGLE_REGISTER
        }),
        (RegisterType::Input, Operation::Read) => Ok(FC_READ_INPUT),
        (RegisterType::Coil, Operation::Read) => Ok(FC_READ_COILS),
        (RegisterType::Coil, Operation::Write) => Ok(if many {
            FC_WRITE_MULTIPLE_COILS
        } else {
            FC_WRITE_SINGLE_COIL
        }),
        (RegisterType::Discrete, Operation::Read) => Ok(FC_READ_DISCRETE),
        (reg_type, Operation::Write) => Err(SerialError::not_supported(format!(
            "can't write to {}",
            reg_type.name()
        ))),
    }
}

/// Expected PDU size of a read response
pub fn read_response_pdu_size(reg_type: RegisterType, count: u16) -> usize {
    if reg_type.is_single_bit() {
        2 + usize::from(count).div_ceil(8)
    } else {
        2 + usize::from(count) * 2
    }
}

/// Fail with the decoded exception if the response carries one
pub fn check_exception(pdu: &[u8]) -> Result<()> {
    match pdu {
        [fc, code, ..] if fc & EXCEPTION_BIT != 0 => {
            Err(SerialError::DeviceException(ModbusException::from_code(*code)))
        },
        [fc] if fc & EXCEPTION_BIT != 0 => Err(SerialError::malformed("truncated exception")),
        _ => Ok(()),
    }
}

/// Decoded data of a read response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPayload {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

pub fn parse_read_response(pdu: &[u8], reg_type: RegisterType, count: u16) -> Result<ReadPayload> {
    check_exception(pdu)?;
    let Some(&byte_count) = pdu.get(1) else {
        return Err(SerialError::malformed("missing byte count"));
    };
    let byte_count = usize::from(byte_count);
    let available = pdu.len() - 2;
    if available < byte_count {
        return Err(SerialError::malformed(format!(
            "invalid read response byte count: {byte_count}, got {available}"
        )));
    }
    let needed = read_response_pdu_size(reg_type, count) - 2;
    if byte_count < needed {
        return Err(SerialError::malformed(format!(
            "invalid read response byte count: {byte_count}, expected {needed}"
        )));
    }

    let data = &pdu[2..2 + byte_count];
    if reg_type.is_single_bit() {
        let bits = (0..usize::from(count))
            .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
            .collect();
        return Ok(ReadPayload::Bits(bits));
    }
    let words = data
        .chunks_exact(2)
        .take(usize::from(count))
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(ReadPayload::Words(words))
}

/// Validate a write response: exception or an exact echo-sized PDU
pub fn parse_write_response(pdu: &[u8]) -> Result<()> {
    check_exception(pdu)?;
    if pdu.len() != WRITE_RESPONSE_PDU_SIZE {
        return Err(SerialError::malformed(format!(
            "invalid write response PDU size: {}, expected {}",
            pdu.len(),
            WRITE_RESPONSE_PDU_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::register::{RegisterAddress, RegisterFormat};

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());
        pdu.push(0x03).unwrap();
        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();
        assert_eq!(pdu.function_code(), Some(0x03));
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_pdu_overflow() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.extend(&[0xFF; MAX_PDU_SIZE + 1]).is_err());
        pdu.extend(&[0x01; MAX_PDU_SIZE]).unwrap();
        let err = pdu.push(0xFF).unwrap_err();
        assert!(err.to_string().contains("buffer full"));
    }

    #[test]
    fn test_read_request() {
        let pdu = PduBuilder::build_read_request(FC_READ_HOLDING, 10, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x0A, 0x00, 0x03]);
        assert!(PduBuilder::build_read_request(0x05, 0, 1).is_err());
        assert!(PduBuilder::build_read_request(FC_READ_HOLDING, 0, 126).is_err());
        assert!(PduBuilder::build_read_request(FC_READ_COILS, 0, 2000).is_ok());
    }

    #[test]
    fn test_write_requests() {
        let pdu = PduBuilder::build_write_single(FC_WRITE_SINGLE_COIL, 4, COIL_ON).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0x04, 0xFF, 0x00]);

        let pdu = PduBuilder::build_write_multiple_registers(0x20, &[0x1234, 0x5678]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]
        );

        let coils = [true, false, true, true, false, false, false, false, true];
        let pdu = PduBuilder::build_write_multiple_coils(0, &coils).unwrap();
        assert_eq!(pdu.as_slice(), &[0x0F, 0x00, 0x00, 0x00, 0x09, 0x02, 0x0D, 0x01]);

        let pdu = PduBuilder::build_read_write_multiple(1, 2, 3, &[0xAABB]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x17, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x01, 0x02, 0xAA, 0xBB]
        );
        assert!(PduBuilder::build_read_write_multiple(0, 1, 0, &[0; 122]).is_err());
    }

    #[test]
    fn test_exception_taxonomy() {
        for code in [0x01, 0x02, 0x03] {
            assert!(ModbusException::from_code(code).is_permanent());
        }
        for code in [0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B, 0x07, 0x42] {
            assert!(!ModbusException::from_code(code).is_permanent());
        }
        assert_eq!(ModbusException::from_code(0x0B).code(), 0x0B);
        assert_eq!(
            ModbusException::from_code(0x06).to_string(),
            "server device is busy"
        );
        assert_eq!(
            check_exception(&[0x83, 0x02]),
            Err(SerialError::DeviceException(ModbusException::IllegalDataAddress))
        );
        assert!(check_exception(&[0x03, 0x02, 0x00, 0x01]).is_ok());
    }

    #[test]
    fn test_parse_words() {
        let payload =
            parse_read_response(&[0x03, 0x04, 0x00, 0x01, 0xAB, 0xCD], RegisterType::Holding, 2)
                .unwrap();
        assert_eq!(payload, ReadPayload::Words(vec![0x0001, 0xABCD]));

        let err = parse_read_response(&[0x03, 0x04, 0x00, 0x01], RegisterType::Holding, 2)
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_parse_bits() {
        let payload =
            parse_read_response(&[0x01, 0x02, 0b0000_0101, 0b0000_0001], RegisterType::Coil, 9)
                .unwrap();
        let ReadPayload::Bits(bits) = payload else {
            panic!("expected bits");
        };
        assert_eq!(bits.len(), 9);
        assert!(bits[0] && !bits[1] && bits[2] && bits[8]);
    }

    #[test]
    fn test_write_response() {
        assert!(parse_write_response(&[0x06, 0x00, 0x01, 0x00, 0x02]).is_ok());
        assert!(parse_write_response(&[0x06, 0x00, 0x01]).unwrap_err().is_malformed());
        assert!(parse_write_response(&[0x86, 0x03]).unwrap_err().is_permanent());
    }

    #[test]
    fn test_function_codes() {
        let multi = RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(0))
            .format(RegisterFormat::U32)
            .build()
            .unwrap();
        assert!(is_packing(&multi));
        assert_eq!(
            function_code(RegisterType::Holding, Operation::Write, true).unwrap(),
            FC_WRITE_MULTIPLE_REGISTERS
        );
        assert_eq!(
            function_code(RegisterType::Coil, Operation::Write, false).unwrap(),
            FC_WRITE_SINGLE_COIL
        );
        assert_eq!(
            function_code(RegisterType::Discrete, Operation::Read, false).unwrap(),
            FC_READ_DISCRETE
        );
        assert!(function_code(RegisterType::Input, Operation::Write, false).is_err());
        assert_eq!(read_response_pdu_size(RegisterType::Coil, 9), 4);
        assert_eq!(read_response_pdu_size(RegisterType::Input, 3), 8);
    }
}
