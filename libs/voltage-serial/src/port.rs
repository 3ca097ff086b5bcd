//! Transport boundary
//!
//! A [`Port`] is the one half-duplex channel shared by every device of a
//! client. The engine never touches raw I/O itself; everything goes through
//! this trait so that serial lines, TCP gateways and the scripted
//! [`MockPort`] are interchangeable.

pub mod mock;
pub mod serial;
mod stream;
pub mod tcp;

pub use mock::{MockPort, MockReply};
pub use serial::{SerialPort, SerialPortSettings};
pub use tcp::{TcpPort, TcpPortSettings};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Result, SerialError};

/// Returns true once the bytes received so far form a complete frame
pub type FrameCompletePredicate = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Baud rate assumed by [`Port::send_time`] when the port has no line settings
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Transmission time of `bits` at `baud_rate`, rounded up to whole microseconds
pub fn bits_send_time(bits: u64, baud_rate: u32) -> Duration {
    let micros = (bits * 1_000_000).div_ceil(u64::from(baud_rate.max(1)));
    Duration::from_micros(micros)
}

#[async_trait]
pub trait Port: Send + Sync {
    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self);

    fn is_open(&self) -> bool;

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SerialError::port(format!("{} is not open", self.description())))
        }
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Read one frame of at most `max_len` bytes.
    ///
    /// Waits up to `response_timeout` for the first byte; after that a gap of
    /// `frame_timeout` ends the frame. Fails with a timeout error when
    /// nothing arrives.
    async fn read_frame(
        &mut self,
        max_len: usize,
        response_timeout: Duration,
        frame_timeout: Duration,
        frame_complete: Option<&FrameCompletePredicate>,
    ) -> Result<Vec<u8>>;

    /// Drain whatever is pending on the line
    async fn skip_noise(&mut self) -> Result<()>;

    /// Sleep until `delay` has passed since the last read or write
    async fn sleep_since_last_interaction(&mut self, delay: Duration);

    /// Time needed to transmit `bytes` bytes
    fn send_time(&self, bytes: usize) -> Duration {
        bits_send_time(bytes as u64 * 8, DEFAULT_BAUD_RATE)
    }

    fn description(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_time() {
        assert_eq!(bits_send_time(8, 9600), Duration::from_micros(834));
        assert_eq!(bits_send_time(9600, 9600), Duration::from_secs(1));
        assert_eq!(MockPort::new().send_time(12), Duration::from_micros(10_000));
    }
}
