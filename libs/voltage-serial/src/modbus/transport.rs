//! RTU and TCP framing
//!
//! ```text
//! RTU: [slave:1][PDU][CRC16-LE:2]
//! TCP: [transaction:2][protocol=0:2][length:2][unit:1][PDU]
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::constants::{EXCEPTION_BIT, EXCEPTION_RESPONSE_PDU_SIZE, MBAP_HEADER_LEN, RTU_OVERHEAD};
use super::pdu::ModbusPdu;
use crate::error::{Result, SerialError};
use crate::port::Port;

const CRC_MODBUS: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Framing variant of a Modbus transport
#[async_trait]
pub trait ModbusTraits: Send + Sync {
    /// Frame size for a PDU of `pdu_size` bytes
    fn packet_size(&self, pdu_size: usize) -> usize;

    /// Wrap a PDU into a frame addressed to `slave_id`
    fn finalize_request(&self, pdu: &ModbusPdu, slave_id: u8) -> Vec<u8>;

    /// Read the response to `request` and return its PDU.
    ///
    /// `expected_pdu_size` is the size of a successful response.
    async fn read_frame(
        &self,
        port: &mut dyn Port,
        response_timeout: Duration,
        frame_timeout: Duration,
        request: &[u8],
        expected_pdu_size: usize,
    ) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct RtuTraits {
    /// Always wait for the frame timeout instead of stopping at the expected size
    force_frame_timeout: bool,
}

impl RtuTraits {
    pub fn new(force_frame_timeout: bool) -> Self {
        Self { force_frame_timeout }
    }
}

#[async_trait]
impl ModbusTraits for RtuTraits {
    fn packet_size(&self, pdu_size: usize) -> usize {
        RTU_OVERHEAD + pdu_size
    }

    fn finalize_request(&self, pdu: &ModbusPdu, slave_id: u8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.packet_size(pdu.len()));
        frame.push(slave_id);
        frame.extend_from_slice(pdu.as_slice());
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    async fn read_frame(
        &self,
        port: &mut dyn Port,
        response_timeout: Duration,
        frame_timeout: Duration,
        request: &[u8],
        expected_pdu_size: usize,
    ) -> Result<Vec<u8>> {
        let expected = self.packet_size(expected_pdu_size);
        let complete = move |buf: &[u8]| {
            if buf.len() < 2 {
                return false;
            }
            if buf[1] & EXCEPTION_BIT != 0 {
                return buf.len() >= EXCEPTION_RESPONSE_PDU_SIZE + RTU_OVERHEAD;
            }
            buf.len() >= expected
        };
        let predicate: Option<&crate::port::FrameCompletePredicate> = if self.force_frame_timeout {
            None
        } else {
            Some(&complete)
        };

        let frame = port
            .read_frame(expected, response_timeout + frame_timeout, frame_timeout, predicate)
            .await?;

        // slave id and CRC at least
        if frame.len() < RTU_OVERHEAD {
            return Err(SerialError::malformed("invalid data size"));
        }
        let crc_pos = frame.len() - 2;
        let received = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
        if received != crc16(&frame[..crc_pos]) {
            return Err(SerialError::malformed("invalid crc"));
        }
        if request.first() != frame.first() {
            return Err(SerialError::unexpected("request and response slave id mismatch"));
        }
        Ok(frame[1..crc_pos].to_vec())
    }
}

/// TCP framing; the transaction counter is shared by all devices of one port
#[derive(Debug, Clone, Default)]
pub struct TcpTraits {
    transaction_id: Arc<AtomicU16>,
}

impl TcpTraits {
    pub fn new(transaction_id: Arc<AtomicU16>) -> Self {
        Self { transaction_id }
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

#[async_trait]
impl ModbusTraits for TcpTraits {
    fn packet_size(&self, pdu_size: usize) -> usize {
        MBAP_HEADER_LEN + pdu_size
    }

    fn finalize_request(&self, pdu: &ModbusPdu, slave_id: u8) -> Vec<u8> {
        let transaction_id = self.next_transaction_id();
        // length counts the unit id byte
        let length = (pdu.len() + 1) as u16;
        let mut frame = Vec::with_capacity(self.packet_size(pdu.len()));
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(slave_id);
        frame.extend_from_slice(pdu.as_slice());
        frame
    }

    async fn read_frame(
        &self,
        port: &mut dyn Port,
        response_timeout: Duration,
        frame_timeout: Duration,
        request: &[u8],
        _expected_pdu_size: usize,
    ) -> Result<Vec<u8>> {
        let total_timeout = response_timeout + frame_timeout;
        let start = Instant::now();
        while start.elapsed() < total_timeout {
            let header = port
                .read_frame(MBAP_HEADER_LEN, total_timeout, frame_timeout, None)
                .await?;
            if header.len() < MBAP_HEADER_LEN {
                return Err(SerialError::malformed("can't read full MBAP"));
            }

            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if length == 0 {
                return Err(SerialError::malformed("wrong MBAP length value: 0"));
            }
            // unit id is already in the header
            let pdu_len = length - 1;
            let pdu = if pdu_len == 0 {
                Vec::new()
            } else {
                port.read_frame(pdu_len, frame_timeout, frame_timeout, None).await?
            };
            if pdu.len() != pdu_len {
                return Err(SerialError::malformed(format!(
                    "wrong PDU size: {}, expected {pdu_len}",
                    pdu.len()
                )));
            }

            if request.get(..2) == header.get(..2) {
                if request.get(6) != header.get(6) {
                    return Err(SerialError::unexpected(
                        "request and response unit identifier mismatch",
                    ));
                }
                return Ok(pdu);
            }
            debug!("Transaction id mismatch");
        }
        Err(SerialError::timeout("request timed out"))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use crate::modbus::pdu::PduBuilder;
    use crate::port::MockPort;

    fn timeouts() -> (Duration, Duration) {
        (Duration::from_millis(500), Duration::from_millis(20))
    }

    #[test]
    fn test_crc16() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        let pdu = PduBuilder::build_read_request(0x03, 0, 1).unwrap();
        let frame = RtuTraits::default().finalize_request(&pdu, 1);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_crc_detects_single_bit_flip() {
        let frame = [0x01, 0x03, 0x02, 0x12, 0x34];
        let crc = crc16(&frame);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[byte] ^= 1 << bit;
                assert_ne!(crc16(&corrupted), crc);
            }
        }
    }

    fn rtu_response(pdu: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x01];
        frame.extend_from_slice(pdu);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_read_frame() {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        let traits = RtuTraits::default();
        let request = traits.finalize_request(&PduBuilder::build_read_request(0x03, 0, 1).unwrap(), 1);
        let (response_timeout, frame_timeout) = timeouts();

        port.push_frame(rtu_response(&[0x03, 0x02, 0x12, 0x34]));
        let pdu = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x12, 0x34]);

        let mut corrupted = rtu_response(&[0x03, 0x02, 0x12, 0x34]);
        corrupted[6] ^= 0xFF;
        port.push_frame(corrupted);
        let err = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap_err();
        assert_eq!(err, SerialError::malformed("invalid crc"));

        port.push_frame(vec![0x01, 0x03]);
        let err = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap_err();
        assert_eq!(err, SerialError::malformed("invalid data size"));

        let mut other_slave = rtu_response(&[0x03, 0x02, 0x12, 0x34]);
        other_slave[0] = 0x02;
        let crc = crc16(&other_slave[..5]);
        other_slave[5..].copy_from_slice(&crc.to_le_bytes());
        port.push_frame(other_slave);
        let err = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::UnexpectedResponse(_)));
    }

    #[test]
    fn test_tcp_finalize_shares_counter() {
        let counter = Arc::new(AtomicU16::new(0));
        let a = TcpTraits::new(Arc::clone(&counter));
        let b = TcpTraits::new(counter);
        let pdu = PduBuilder::build_read_request(0x04, 0x10, 2).unwrap();

        let first = a.finalize_request(&pdu, 5);
        assert_eq!(first, vec![0, 1, 0, 0, 0, 6, 5, 0x04, 0x00, 0x10, 0x00, 0x02]);
        let second = b.finalize_request(&pdu, 5);
        assert_eq!(&second[..2], &[0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_read_frame_skips_stale_transactions() {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        let traits = TcpTraits::default();
        let pdu = PduBuilder::build_read_request(0x03, 0, 1).unwrap();
        let request = traits.finalize_request(&pdu, 7);
        let (response_timeout, frame_timeout) = timeouts();

        // stale answer to transaction 0, then the real one
        port.push_frame(vec![0, 0, 0, 0, 0, 5, 7, 0x03, 0x02, 0xAA, 0xBB]);
        port.push_frame(vec![0, 1, 0, 0, 0, 5, 7, 0x03, 0x02, 0x12, 0x34]);
        let pdu = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x12, 0x34]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_read_frame_errors() {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        let traits = TcpTraits::default();
        let request = traits.finalize_request(&PduBuilder::build_read_request(0x03, 0, 1).unwrap(), 7);
        let (response_timeout, frame_timeout) = timeouts();

        port.push_frame(vec![0, 1, 0, 0, 0, 0, 7]);
        let err = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap_err();
        assert!(err.is_malformed());

        port.push_frame(vec![0, 1, 0, 0, 0, 3, 8, 0x83, 0x02]);
        let err = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::UnexpectedResponse(_)));

        let err = traits
            .read_frame(&mut port, response_timeout, frame_timeout, &request, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::ResponseTimeout(_)));
    }
}
