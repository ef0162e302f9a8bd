/*!
In-process stand-in for the scan-control hardware.

Speaks the command protocol over any duplex byte stream: decodes the
inbound command stream, answers the `Synchronize` cookie at the next
`Flush`, and emits a deterministic ramp of samples for pixel commands at
the session's output width. Backs the `--mock` CLI flag and the capture
tests, where it sits on the far end of a `tokio::io::duplex` pair.
*/

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use shared::command::CommandError;
use shared::protocol::SYNC_MARKER;
use shared::{Command, OutputMode};

/// Samples a free-running scan emits per pacing tick
const FREE_RUN_CHUNK: u64 = 4096;

/// Simulated scan hardware driving one duplex stream
pub struct MockScanEngine<S> {
    stream: S,
    inbound: BytesMut,
    output: OutputMode,
    /// Cookie awaiting the next `Flush`
    pending_cookie: Option<u16>,
    /// Ramp counter; the first sample of a session reads 1
    ramp: u64,
    emitted: u64,
    sample_limit: Option<u64>,
    region_pixels: u64,
    free_running: bool,
}

impl<S> MockScanEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            inbound: BytesMut::with_capacity(4096),
            output: OutputMode::SixteenBit,
            pending_cookie: None,
            ramp: 0,
            emitted: 0,
            sample_limit: None,
            region_pixels: 0,
            free_running: false,
        }
    }

    /// Stop emitting after `limit` samples per session; the engine keeps
    /// servicing commands. Lets tests freeze a scan mid-frame.
    pub fn with_sample_limit(mut self, limit: u64) -> Self {
        self.sample_limit = Some(limit);
        self
    }

    /// Service the stream until the client side closes it
    pub async fn run(mut self) -> Result<()> {
        let mut staging = BytesMut::with_capacity(8192);
        loop {
            if self.free_running {
                tokio::select! {
                    read = self.stream.read_buf(&mut self.inbound) => {
                        if read? == 0 {
                            return Ok(());
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {
                        self.emit_samples(FREE_RUN_CHUNK, &mut staging);
                    }
                }
            } else if self.stream.read_buf(&mut self.inbound).await? == 0 {
                return Ok(());
            }
            self.drain_commands(&mut staging)?;
            if !staging.is_empty() {
                self.stream.write_all(&staging).await?;
                self.stream.flush().await?;
                staging.clear();
            }
        }
    }

    fn drain_commands(&mut self, out: &mut BytesMut) -> Result<()> {
        while !self.inbound.is_empty() {
            match Command::decode(&self.inbound) {
                Ok((command, used)) => {
                    self.inbound.advance(used);
                    trace!("mock executing {:?}", command);
                    self.execute(&command, out);
                }
                // Wait for the rest of the command to arrive
                Err(CommandError::Truncated { .. }) => break,
                Err(err) => bail!("mock received invalid command stream: {err}"),
            }
        }
        Ok(())
    }

    fn execute(&mut self, command: &Command, out: &mut BytesMut) {
        match command {
            Command::Synchronize { cookie, output, .. } => {
                debug!("mock session start, cookie {:#06x}", cookie);
                self.output = *output;
                self.pending_cookie = Some(*cookie);
                self.ramp = 0;
                self.emitted = 0;
                self.free_running = false;
            }
            Command::Flush => {
                if let Some(cookie) = self.pending_cookie.take() {
                    out.extend_from_slice(&SYNC_MARKER);
                    out.put_u16(cookie);
                }
            }
            Command::Abort => self.free_running = false,
            Command::RasterRegion { x, y, .. } => {
                self.region_pixels = x.count() as u64 * y.count() as u64;
            }
            Command::RasterPixelRun { length, .. } => {
                self.emit_samples(*length as u64 + 1, out);
            }
            Command::RasterPixel { .. }
            | Command::VectorPixel { .. }
            | Command::VectorPixelMinDwell { .. } => {
                self.emit_samples(1, out);
            }
            Command::RasterPixelFill { .. } => {
                self.emit_samples(self.region_pixels, out);
            }
            Command::RasterPixelFreeRun { .. } => self.free_running = true,
            Command::Array { command, length } => {
                for _ in 0..=*length as u32 {
                    self.execute(command, out);
                }
            }
            Command::ExternalCtrl { .. }
            | Command::BeamSelect { .. }
            | Command::Blank { .. }
            | Command::Delay { .. } => {}
        }
    }

    fn emit_samples(&mut self, requested: u64, out: &mut BytesMut) {
        let n = match self.sample_limit {
            Some(limit) => requested.min(limit.saturating_sub(self.emitted)),
            None => requested,
        };
        for _ in 0..n {
            self.ramp = self.ramp.wrapping_add(1);
            match self.output {
                OutputMode::SixteenBit => out.put_u16(self.ramp as u16),
                OutputMode::EightBit => out.put_u8(self.ramp as u8),
                OutputMode::NoOutput => {}
            }
        }
        self.emitted += n;
    }
}
