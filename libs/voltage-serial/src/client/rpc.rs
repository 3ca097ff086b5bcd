//! Raw pass-through requests

use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::modbus::constants::WRITE_RESPONSE_PDU_SIZE;
use crate::modbus::{ModbusPdu, ModbusTraits, PduBuilder};
use crate::port::Port;

const DEFAULT_RPC_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_RPC_FRAME_TIMEOUT: Duration = Duration::from_millis(20);
const DEFAULT_RPC_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes to send as-is and the shape of the expected answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub message: Vec<u8>,
    /// Maximal number of response bytes
    pub response_size: usize,
    pub response_timeout: Duration,
    pub frame_timeout: Duration,
    /// Bound on queueing plus execution
    pub total_timeout: Duration,
}

impl RawRequest {
    pub fn new(message: Vec<u8>, response_size: usize) -> Self {
        Self {
            message,
            response_size,
            response_timeout: DEFAULT_RPC_RESPONSE_TIMEOUT,
            frame_timeout: DEFAULT_RPC_FRAME_TIMEOUT,
            total_timeout: DEFAULT_RPC_TOTAL_TIMEOUT,
        }
    }

    /// Frame `pdu` for `slave_id`; `response_pdu_size` bounds the answer
    pub fn from_pdu(
        traits: &dyn ModbusTraits,
        slave_id: u8,
        pdu: &ModbusPdu,
        response_pdu_size: usize,
    ) -> Self {
        Self::new(
            traits.finalize_request(pdu, slave_id),
            traits.packet_size(response_pdu_size),
        )
    }

    /// FC15 over the raw channel
    pub fn write_coils(
        traits: &dyn ModbusTraits,
        slave_id: u8,
        address: u16,
        values: &[bool],
    ) -> Result<Self> {
        let pdu = PduBuilder::build_write_multiple_coils(address, values)?;
        Ok(Self::from_pdu(traits, slave_id, &pdu, WRITE_RESPONSE_PDU_SIZE))
    }

    /// FC23 over the raw channel, the answer carries `read_quantity` words
    pub fn read_write_registers(
        traits: &dyn ModbusTraits,
        slave_id: u8,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<Self> {
        let pdu = PduBuilder::build_read_write_multiple(
            read_address,
            read_quantity,
            write_address,
            values,
        )?;
        let response_pdu_size = 2 + usize::from(read_quantity) * 2;
        Ok(Self::from_pdu(traits, slave_id, &pdu, response_pdu_size))
    }

    pub fn with_timeouts(mut self, response: Duration, frame: Duration, total: Duration) -> Self {
        self.response_timeout = response;
        self.frame_timeout = frame;
        self.total_timeout = total;
        self
    }
}

#[derive(Debug)]
pub(crate) struct PendingRpc {
    pub(crate) request: RawRequest,
    pub(crate) reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Execute one raw exchange on an idle bus
pub(crate) async fn execute(port: &mut dyn Port, request: &RawRequest) -> Result<Vec<u8>> {
    port.check_open()?;
    port.sleep_since_last_interaction(request.frame_timeout).await;
    port.write_bytes(&request.message).await?;
    port.read_frame(
        request.response_size,
        request.response_timeout,
        request.frame_timeout,
        None,
    )
    .await
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use crate::modbus::{crc16, RtuTraits, TcpTraits};
    use crate::port::MockPort;
    use std::sync::atomic::AtomicU16;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_execute() {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        port.set_responder(|frame| Some(frame.iter().rev().copied().collect()));

        let request = RawRequest::new(vec![1, 2, 3], 8);
        assert_eq!(execute(&mut port, &request).await.unwrap(), vec![3, 2, 1]);
        assert_eq!(port.written(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_write_coils_request() {
        let traits = RtuTraits::new(false);
        let request =
            RawRequest::write_coils(&traits, 3, 0x13, &[true, false, true, true]).unwrap();

        let mut expected = vec![0x03, 0x0F, 0x00, 0x13, 0x00, 0x04, 0x01, 0b0000_1101];
        let crc = crc16(&expected);
        expected.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(request.message, expected);
        // slave + echo + crc
        assert_eq!(request.response_size, 8);

        assert!(RawRequest::write_coils(&traits, 3, 0, &[]).is_err());
    }

    #[test]
    fn test_read_write_registers_request() {
        let traits = TcpTraits::new(Arc::new(AtomicU16::new(0)));
        let request =
            RawRequest::read_write_registers(&traits, 1, 0x10, 2, 0x20, &[0xABCD]).unwrap();

        // MBAP header, then the FC23 PDU
        assert_eq!(
            &request.message[7..],
            &[0x17, 0x00, 0x10, 0x00, 0x02, 0x00, 0x20, 0x00, 0x01, 0x02, 0xAB, 0xCD]
        );
        assert_eq!(request.message[6], 1);
        assert_eq!(request.response_size, 7 + 6);

        assert!(RawRequest::read_write_registers(&traits, 1, 0, 200, 0, &[1]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_on_closed_port() {
        let mut port = MockPort::new();
        let request = RawRequest::new(vec![1], 8);
        assert!(execute(&mut port, &request).await.is_err());
        assert!(port.written().is_empty());
    }
}
