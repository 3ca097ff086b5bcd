//! Serial-over-TCP gateway connection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::stream::{self, Interaction};
use super::{FrameCompletePredicate, Port};
use crate::error::{Result, SerialError};

fn default_connection_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPortSettings {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl TcpPortSettings {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

pub struct TcpPort {
    settings: TcpPortSettings,
    stream: Option<TcpStream>,
    interaction: Interaction,
}

impl TcpPort {
    pub fn new(settings: TcpPortSettings) -> Self {
        Self {
            settings,
            stream: None,
            interaction: Interaction::default(),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        let description = self.description();
        self.stream
            .as_mut()
            .ok_or_else(|| SerialError::port(format!("{description} is not open")))
    }
}

#[async_trait]
impl Port for TcpPort {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(SerialError::port(format!("{} already open", self.description())));
        }
        let addr = format!("{}:{}", self.settings.address, self.settings.port);
        debug!("TCP connecting: {}", addr);

        let connect_timeout = Duration::from_millis(self.settings.connection_timeout_ms);
        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                self.stream = Some(stream);
                self.interaction.touch();
                Ok(())
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                Err(SerialError::port(format!("failed to connect to {addr}: {e}")))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(SerialError::port(format!("connection to {addr} timed out")))
            },
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown: {}", e);
            }
            info!("TCP closed: {}", self.description());
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        trace!("TCP TX: {:02X?}", buf);
        stream.write_all(buf).await?;
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

    fn description(&self) -> String {
        format!("<{}:{}>", self.settings.address, self.settings.port)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(&[request[3], request[2]]).await.unwrap();
        });

        let mut port = TcpPort::new(TcpPortSettings::new("127.0.0.1", local.port()));
        assert!(port.check_open().is_err());
        port.open().await.unwrap();
        assert!(port.open().await.is_err());

        port.write_bytes(&[1, 2, 3, 4]).await.unwrap();
        let frame = port
            .read_frame(2, Duration::from_secs(1), Duration::from_millis(50), None)
            .await
            .unwrap();
        assert_eq!(frame, vec![4, 3]);

        server.await.unwrap();
        port.close().await;
        assert!(!port.is_open());
    }
}
