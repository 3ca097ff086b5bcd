//! RS-485 / RS-232 line via tokio-serial

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

use super::stream::{self, Interaction};
use super::{bits_send_time, FrameCompletePredicate, Port};
use crate::error::{Result, SerialError};

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    2
}

fn default_parity() -> String {
    "N".to_string()
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortSettings {
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// "N", "E" or "O"
    #[serde(default = "default_parity")]
    pub parity: String,
}

impl SerialPortSettings {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
        }
    }

    /// Start bit, data bits, optional parity bit and stop bits
    pub fn bits_per_byte(&self) -> u64 {
        let parity = u64::from(!self.parity.eq_ignore_ascii_case("N"));
        1 + u64::from(self.data_bits) + u64::from(self.stop_bits) + parity
    }
}

impl std::fmt::Display for SerialPortSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<{} {} {} {} {}>",
            self.device, self.baud_rate, self.parity, self.data_bits, self.stop_bits
        )
    }
}

pub struct SerialPort {
    settings: SerialPortSettings,
    stream: Option<SerialStream>,
    interaction: Interaction,
}

impl SerialPort {
    pub fn new(settings: SerialPortSettings) -> Self {
        Self {
            settings,
            stream: None,
            interaction: Interaction::default(),
        }
    }

    fn stream(&mut self) -> Result<&mut SerialStream> {
        let description = self.description();
        self.stream
            .as_mut()
            .ok_or_else(|| SerialError::port(format!("{description} is not open")))
    }
}

#[async_trait]
impl Port for SerialPort {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(SerialError::port(format!("{} already open", self.description())));
        }
        debug!("RTU: {} @{}baud", self.settings.device, self.settings.baud_rate);

        let parity = match self.settings.parity.to_ascii_uppercase().as_str() {
            "E" => tokio_serial::Parity::Even,
            "O" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };
        let data_bits = match self.settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.settings.stop_bits {
            1 => tokio_serial::StopBits::One,
            _ => tokio_serial::StopBits::Two,
        };

        match tokio_serial::new(&self.settings.device, self.settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
        {
            Ok(stream) => {
                info!("RTU opened: {}", self.settings);
                self.stream = Some(stream);
                self.interaction.touch();
                Ok(())
            },
            Err(e) => {
                error!("RTU err: {} - {}", self.settings.device, e);
                Err(SerialError::port(format!(
                    "failed to open {}: {e}",
                    self.settings.device
                )))
            },
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("RTU closed: {}", self.settings.device);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let send_time = self.send_time(buf.len());
        let stream = self.stream()?;
        trace!("RTU TX: {:02X?}", buf);
        stream.write_all(buf).await?;
        stream.flush().await?;
        // the line is busy until the last byte leaves the UART
        tokio::time::sleep(send_time).await;
        self.interaction.touch();
        Ok(())
    }

    async fn read_frame(
        &mut self,
        max_len: usize,
        response_timeout: Duration,
        frame_timeout: Duration,
        frame_complete: Option<&FrameCompletePredicate>,
    ) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let frame =
            stream::read_frame(stream, max_len, response_timeout, frame_timeout, frame_complete)
                .await?;
        self.interaction.touch();
        Ok(frame)
    }

    async fn skip_noise(&mut self) -> Result<()> {
        let stream = self.stream()?;
        stream::skip_noise(stream).await?;
        self.interaction.touch();
        Ok(())
    }

    async fn sleep_since_last_interaction(&mut self, delay: Duration) {
        self.interaction.sleep_since(delay).await;
    }

    fn send_time(&self, bytes: usize) -> Duration {
        bits_send_time(
            self.settings.bits_per_byte() * bytes as u64,
            self.settings.baud_rate,
        )
    }

    fn description(&self) -> String {
        self.settings.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_per_byte() {
        let mut settings = SerialPortSettings::new("/dev/ttyRS485-1");
        assert_eq!(settings.bits_per_byte(), 11);
        settings.stop_bits = 1;
        settings.parity = "E".into();
        assert_eq!(settings.bits_per_byte(), 11);
        settings.parity = "N".into();
        assert_eq!(settings.bits_per_byte(), 10);
    }

    #[test]
    fn test_send_time_uses_line_settings() {
        let mut settings = SerialPortSettings::new("/dev/ttyRS485-1");
        settings.baud_rate = 115_200;
        settings.stop_bits = 1;
        let port = SerialPort::new(settings);
        // 10 bits per byte
        assert_eq!(port.send_time(8), Duration::from_micros(695));
        assert!(!port.is_open());
        assert!(port.check_open().is_err());
    }
}
