//! Frame reading over any async byte stream

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace};

use super::FrameCompletePredicate;
use crate::error::{Result, SerialError};

/// Quiet period that ends noise skipping
const NOISE_QUIET_PERIOD: Duration = Duration::from_millis(10);
/// Data still arriving after this long is treated as a babbling line
const CONTINUOUS_NOISE_TIMEOUT: Duration = Duration::from_millis(100);

/// Last interaction bookkeeping shared by stream based ports
#[derive(Debug, Default)]
pub(crate) struct Interaction {
    last: Option<Instant>,
}

impl Interaction {
    pub fn touch(&mut self) {
        self.last = Some(Instant::now());
    }

    pub async fn sleep_since(&self, delay: Duration) {
        if let Some(last) = self.last {
            sleep_until(last + delay).await;
        }
    }
}

pub(crate) async fn read_frame<S>(
    stream: &mut S,
    max_len: usize,
    response_timeout: Duration,
    frame_timeout: Duration,
    frame_complete: Option<&FrameCompletePredicate>,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; max_len];
    let mut nread = 0;
    // first byte may take up to the response timeout
    let mut wait = response_timeout;

    while nread < max_len {
        if frame_complete.is_some_and(|complete| complete(&buf[..nread])) {
            break;
        }
        match timeout(wait, stream.read(&mut buf[nread..])).await {
            Err(_) => break,
            Ok(Ok(0)) => return Err(SerialError::io("connection closed by peer")),
            Ok(Ok(n)) => {
                nread += n;
                wait = frame_timeout;
            },
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    if nread == 0 {
        return Err(SerialError::timeout("request timed out"));
    }
    buf.truncate(nread);
    trace!("RX: {:02X?}", buf);
    Ok(buf)
}

pub(crate) async fn skip_noise<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 256];
    let start = Instant::now();
    loop {
        match timeout(NOISE_QUIET_PERIOD, stream.read(&mut buf)).await {
            Err(_) | Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => {
                debug!("Noise: {:02X?}", &buf[..n]);
                if start.elapsed() > CONTINUOUS_NOISE_TIMEOUT {
                    return Err(SerialError::io("continuous unsolicited data flow"));
                }
            },
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_frame_stops_on_predicate() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[1, 2, 3, 4, 5]).await.unwrap();

        let complete = |buf: &[u8]| buf.len() >= 3;
        let frame = read_frame(
            &mut client,
            3,
            Duration::from_millis(100),
            Duration::from_millis(10),
            Some(&complete),
        )
        .await
        .unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_timeout() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = read_frame(
            &mut client,
            8,
            Duration::from_millis(100),
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err, SerialError::timeout("request timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_noise_drains() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0xFF, 0x00, 0x13]).await.unwrap();
        skip_noise(&mut client).await.unwrap();

        server.write_all(&[0x01]).await.unwrap();
        let frame = read_frame(
            &mut client,
            8,
            Duration::from_millis(100),
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();
        assert_eq!(frame, vec![0x01]);
    }
}
