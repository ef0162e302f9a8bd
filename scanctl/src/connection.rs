/*!
Transport layer: one ordered, full-duplex byte channel to a scan-control
endpoint.

Outbound writes are append-only and order-preserving; inbound data is a
continuous unframed sample stream. Command acknowledgement happens only
through the `Synchronize` cookie handshake: the hardware echoes `0xFFFF`
followed by the cookie, and everything before that marker is stale output
from an earlier (possibly aborted) scan and gets discarded.
*/

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use shared::protocol::SYNC_MARKER;
use shared::{Command, OutputMode};

/// Errors from the transport channel
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// I/O errors on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The scan server closed the channel
    #[error("connection closed by scan server")]
    Closed,

    /// A previous fault ended the session; a new connection is required
    #[error("connection previously faulted")]
    Faulted,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open duplex channel to one scan-control endpoint
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    inbound: BytesMut,
    next_cookie: u16,
    faulted: bool,
}

impl Connection {
    /// Connect to a networked scan server
    pub async fn open(host: &str, port: u16) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        // Large receive buffer: the pixel stream arrives faster than the
        // capture loop drains it during bursts.
        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_recv_buffer_size(1024 * 1024)?;

        let peer = stream.peer_addr()?;
        info!("connected to scan server at {}", peer);

        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(Box::new(reader), Box::new(writer)))
    }

    /// Build a connection over any duplex byte stream (local hardware
    /// bridge, or an in-process mock in tests)
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer))
    }

    fn from_parts(reader: BoxedReader, writer: BoxedWriter) -> Self {
        // Even seed; synchronize cookies stay even, like the hardware
        // expects for its marker scan.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(0);
        Self {
            reader,
            writer,
            inbound: BytesMut::with_capacity(64 * 1024),
            next_cookie: seed & 0xFFFE,
            faulted: false,
        }
    }

    fn check(&self) -> Result<(), ConnectionError> {
        if self.faulted {
            return Err(ConnectionError::Faulted);
        }
        Ok(())
    }

    fn allocate_cookie(&mut self) -> u16 {
        let cookie = self.next_cookie;
        self.next_cookie = self.next_cookie.wrapping_add(2);
        debug!("allocating cookie {:#06x}", cookie);
        cookie
    }

    /// Submit raw wire bytes, order-preserving, and flush
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.check()?;
        trace!("send: data=<{}>", hex::encode(data));
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Encode and submit a command sequence
    pub async fn send(&mut self, commands: &[Command]) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::with_capacity(commands.len() * 16);
        for command in commands {
            command.encode_to(&mut buf);
        }
        debug!(
            "submitting {} command(s), {} byte(s)",
            commands.len(),
            buf.len()
        );
        self.send_bytes(&buf).await
    }

    /// Run the cookie handshake.
    ///
    /// Writes `Synchronize + Flush`, then scans the inbound stream for the
    /// `0xFFFF ++ cookie` marker, discarding any stale bytes in front of
    /// it. Returns the cookie on success.
    pub async fn synchronize(
        &mut self,
        raster: bool,
        output: OutputMode,
    ) -> Result<u16, ConnectionError> {
        self.check()?;
        let cookie = self.allocate_cookie();
        debug!("synchronizing with cookie {:#06x}", cookie);

        self.send(&[
            Command::Synchronize {
                cookie,
                raster,
                output,
            },
            Command::Flush,
        ])
        .await?;

        let marker = [
            SYNC_MARKER[0],
            SYNC_MARKER[1],
            (cookie >> 8) as u8,
            cookie as u8,
        ];
        let mut discarded = 0usize;
        loop {
            if let Some(at) = find_subsequence(&self.inbound, &marker) {
                discarded += at;
                self.inbound.advance(at + marker.len());
                if discarded > 0 {
                    debug!("discarded {} stale byte(s) before sync marker", discarded);
                }
                return Ok(cookie);
            }
            // No marker yet; anything more than a partial-marker tail is
            // definitively stale.
            let keep = self.inbound.len().saturating_sub(marker.len() - 1);
            if keep > 0 {
                discarded += keep;
                self.inbound.advance(keep);
            }
            self.fill().await?;
        }
    }

    /// Move all currently available inbound bytes into `out`, reading from
    /// the channel if none are staged. Returns the number of bytes moved.
    pub async fn read_samples(&mut self, out: &mut BytesMut) -> Result<usize, ConnectionError> {
        if self.inbound.is_empty() {
            self.fill().await?;
        }
        let n = self.inbound.len();
        out.extend_from_slice(&self.inbound);
        self.inbound.clear();
        Ok(n)
    }

    async fn fill(&mut self) -> Result<usize, ConnectionError> {
        self.check()?;
        let n = self.reader.read_buf(&mut self.inbound).await?;
        if n == 0 {
            self.faulted = true;
            return Err(ConnectionError::Closed);
        }
        trace!("recv: {} byte(s)", n);
        Ok(n)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_synchronize_discards_stale_bytes() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut conn = Connection::from_stream(near);

        let peer = tokio::spawn(async move {
            // Synchronize (3 bytes) + Flush (1 byte)
            let mut cmd = [0u8; 4];
            far.read_exact(&mut cmd).await.unwrap();
            assert_eq!(cmd[0] >> 4, 0x0);
            assert_eq!(cmd[3], 0x20);
            let cookie = u16::from_be_bytes([cmd[1], cmd[2]]);

            // Stale pixels from a previous scan, then the marker, then
            // fresh sample data.
            let mut response = vec![0xDE, 0xAD, 0xBE];
            response.extend_from_slice(&[0xFF, 0xFF]);
            response.extend_from_slice(&cookie.to_be_bytes());
            response.push(0xAB);
            far.write_all(&response).await.unwrap();
            far
        });

        let cookie = conn
            .synchronize(true, OutputMode::EightBit)
            .await
            .unwrap();
        assert_eq!(cookie % 2, 0);

        let mut out = BytesMut::new();
        let n = conn.read_samples(&mut out).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(out.as_ref(), &[0xAB]);

        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_channel_faults_the_session() {
        let (near, far) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(near);
        drop(far);

        let mut out = BytesMut::new();
        assert!(matches!(
            conn.read_samples(&mut out).await,
            Err(ConnectionError::Closed)
        ));
        // Every operation after the fault fails fast
        assert!(matches!(
            conn.send(&[Command::Flush]).await,
            Err(ConnectionError::Faulted)
        ));
        assert!(matches!(
            conn.synchronize(true, OutputMode::SixteenBit).await,
            Err(ConnectionError::Faulted)
        ));
    }
}
