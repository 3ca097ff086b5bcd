//! Serial engine error types
//!
//! Every failure the polling engine can observe maps onto one variant here.
//! The classification helpers decide how the client loop reacts: permanent
//! device exceptions exclude registers from polling, malformed responses
//! trigger a noise skip, everything else is retried on schedule.

use thiserror::Error;

use crate::modbus::ModbusException;

/// Result type for voltage-serial operations
pub type Result<T> = std::result::Result<T, SerialError>;

/// Serial engine errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SerialError {
    /// Bad size, CRC or header in a response frame
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Function code, slave id or transaction id mismatch
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Exception code returned by the device
    #[error("{0}")]
    DeviceException(ModbusException),

    /// Device did not answer in time
    #[error("Response timeout: {0}")]
    ResponseTimeout(String),

    /// Request could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device session could not be started or ended
    #[error("Session error: {0}")]
    Session(String),

    /// Port could not be opened or is not open
    #[error("Port error: {0}")]
    Port(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Raw text value could not be converted
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structurally invalid setup (duplicate register, empty register set, ...)
    #[error("Setup error: {0}")]
    Setup(String),

    /// Operation not supported by the device or register type
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl From<std::io::Error> for SerialError {
    fn from(err: std::io::Error) -> Self {
        SerialError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for SerialError {
    fn from(err: tokio_serial::Error) -> Self {
        SerialError::Port(err.to_string())
    }
}

impl From<figment::Error> for SerialError {
    fn from(err: figment::Error) -> Self {
        SerialError::Config(err.to_string())
    }
}

impl From<ModbusException> for SerialError {
    fn from(exception: ModbusException) -> Self {
        SerialError::DeviceException(exception)
    }
}

// Helper methods for creating errors
impl SerialError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        SerialError::MalformedResponse(msg.into())
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        SerialError::UnexpectedResponse(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        SerialError::ResponseTimeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        SerialError::Protocol(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        SerialError::Session(msg.into())
    }

    pub fn port(msg: impl Into<String>) -> Self {
        SerialError::Port(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        SerialError::Io(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        SerialError::Conversion(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SerialError::Config(msg.into())
    }

    pub fn setup(msg: impl Into<String>) -> Self {
        SerialError::Setup(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        SerialError::NotSupported(msg.into())
    }

    /// Register can never be read or written on this device
    pub fn is_permanent(&self) -> bool {
        matches!(self, SerialError::DeviceException(e) if e.is_permanent())
    }

    /// Response bytes were garbage; the line should be drained
    pub fn is_malformed(&self) -> bool {
        matches!(self, SerialError::MalformedResponse(_))
    }

    /// Failure is expected to clear up by itself on a later poll
    pub fn is_transient(&self) -> bool {
        match self {
            SerialError::MalformedResponse(_)
            | SerialError::UnexpectedResponse(_)
            | SerialError::ResponseTimeout(_)
            | SerialError::Io(_) => true,
            SerialError::DeviceException(e) => !e.is_permanent(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let permanent = SerialError::from(ModbusException::from_code(0x02));
        assert!(permanent.is_permanent());
        assert!(!permanent.is_transient());

        let busy = SerialError::from(ModbusException::from_code(0x06));
        assert!(!busy.is_permanent());
        assert!(busy.is_transient());

        let crc = SerialError::malformed("invalid crc");
        assert!(crc.is_malformed());
        assert!(crc.is_transient());

        assert!(!SerialError::session("prepare failed").is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            SerialError::malformed("invalid crc").to_string(),
            "malformed response: invalid crc"
        );
        assert_eq!(
            SerialError::from(ModbusException::from_code(0x02)).to_string(),
            "illegal data address"
        );
        assert_eq!(
            SerialError::from(ModbusException::from_code(0x42)).to_string(),
            "invalid modbus error code (66)"
        );
    }
}
