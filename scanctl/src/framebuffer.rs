/*!
Frame accumulation and the capture state machine.

A [`Frame`] is a fixed-shape 2-D sample buffer; a [`FrameBuffer`] owns the
connection for one scan session and runs captures against it, one at a
time: Idle -> Scanning -> Complete or Aborted. All frame mutation happens
on the single task consuming the inbound pixel stream; aborting a scan is
a cooperative request that the consumer observes, acts on (sending `Abort`
itself), and reports through the `is_aborted` latch together with the
partial frame.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use shared::transform::TransformError;
use shared::{AxisTransforms, Command, DACCodeRange, DwellTime, OutputMode, ScanRegion};

use crate::connection::{Connection, ConnectionError};
use crate::raster::RasterScan;

/// Errors from capture operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Another capture is already scanning on this frame buffer
    #[error("a capture is already scanning")]
    Busy,

    /// The selected output mode returns no samples
    #[error("cannot capture with OutputMode::NoOutput")]
    NoOutput,

    /// The requested geometry cannot be mapped to DAC code ranges
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The transport channel failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Sample storage at the capture's bit depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
    Eight(Vec<u8>),
    Sixteen(Vec<u16>),
}

/// A 2-D image buffer positioned within the full addressable scan space
///
/// The buffer always holds exactly `x_count * y_count` samples, row-major
/// by y, zero-initialized; positions no data has reached read back as
/// zero. A frame is never resized or mutated after the capture that
/// produced it returns.
#[derive(Debug, Clone)]
pub struct Frame {
    x_start: u16,
    y_start: u16,
    x_res: u16,
    y_res: u16,
    x_count: u16,
    y_count: u16,
    samples: Samples,
    cursor: usize,
    delivered: u64,
}

impl Frame {
    fn new(region: ScanRegion, x_res: u16, y_res: u16, output: OutputMode) -> Self {
        let len = region.x_count as usize * region.y_count as usize;
        let samples = match output {
            OutputMode::EightBit => Samples::Eight(vec![0; len]),
            _ => Samples::Sixteen(vec![0; len]),
        };
        Self {
            x_start: region.x_start,
            y_start: region.y_start,
            x_res,
            y_res,
            x_count: region.x_count,
            y_count: region.y_count,
            samples,
            cursor: 0,
            delivered: 0,
        }
    }

    /// Buffer shape as `(x_count, y_count)`
    pub fn shape(&self) -> (u16, u16) {
        (self.x_count, self.y_count)
    }

    /// Pixel offset of this frame's top-left corner within the full frame
    pub fn origin(&self) -> (u16, u16) {
        (self.x_start, self.y_start)
    }

    /// Resolution of the full frame this buffer sits inside
    pub fn resolution(&self) -> (u16, u16) {
        (self.x_res, self.y_res)
    }

    pub fn pixel_count(&self) -> usize {
        self.x_count as usize * self.y_count as usize
    }

    /// Raster positions holding delivered data, from the top-left
    pub fn filled(&self) -> usize {
        (self.delivered as usize).min(self.pixel_count())
    }

    pub fn is_full(&self) -> bool {
        self.filled() == self.pixel_count()
    }

    pub fn pixels(&self) -> &Samples {
        &self.samples
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.samples {
            Samples::Eight(data) => Some(data),
            Samples::Sixteen(_) => None,
        }
    }

    pub fn as_u16(&self) -> Option<&[u16]> {
        match &self.samples {
            Samples::Eight(_) => None,
            Samples::Sixteen(data) => Some(data),
        }
    }

    /// Read one sample, widened to 16 bits. `None` outside the buffer.
    pub fn sample(&self, x: u16, y: u16) -> Option<u16> {
        if x >= self.x_count || y >= self.y_count {
            return None;
        }
        let index = y as usize * self.x_count as usize + x as usize;
        Some(match &self.samples {
            Samples::Eight(data) => data[index] as u16,
            Samples::Sixteen(data) => data[index],
        })
    }

    fn remaining(&self) -> usize {
        self.pixel_count() - self.cursor
    }

    /// Consume whole samples from `buf` into the buffer at the write
    /// cursor. In wrapping mode (free-running scans) the cursor rolls
    /// over to the top of the frame; otherwise input past the last
    /// position is left in `buf`. A trailing half sample stays in `buf`
    /// until its other byte arrives.
    fn extend_from_wire(&mut self, buf: &mut BytesMut, wrap: bool) -> usize {
        let cap = self.pixel_count();
        if cap == 0 {
            return 0;
        }
        let taken = match &mut self.samples {
            Samples::Eight(data) => {
                let take = if wrap {
                    buf.len()
                } else {
                    buf.len().min(cap - self.cursor)
                };
                for &byte in &buf[..take] {
                    data[self.cursor] = byte;
                    self.cursor += 1;
                    if self.cursor == cap && wrap {
                        self.cursor = 0;
                    }
                }
                buf.advance(take);
                take
            }
            Samples::Sixteen(data) => {
                let avail = buf.len() / 2;
                let take = if wrap {
                    avail
                } else {
                    avail.min(cap - self.cursor)
                };
                for i in 0..take {
                    data[self.cursor] = u16::from_be_bytes([buf[2 * i], buf[2 * i + 1]]);
                    self.cursor += 1;
                    if self.cursor == cap && wrap {
                        self.cursor = 0;
                    }
                }
                buf.advance(take * 2);
                take
            }
        };
        self.delivered += taken as u64;
        taken
    }
}

/// Options for the general [`FrameBuffer::capture_frame`] entry point
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Full-frame resolution in X
    pub x_res: u16,
    /// Full-frame resolution in Y
    pub y_res: u16,
    /// Sub-rectangle to scan; `None` captures the whole frame
    pub region: Option<ScanRegion>,
    pub dwell: DwellTime,
    pub output: OutputMode,
    /// Scan until aborted instead of for one frame
    pub free_run: bool,
}

enum Outcome {
    Complete,
    Aborted,
    Lost,
}

/// Session-scoped capture engine: owns the connection and runs one
/// capture at a time against it
pub struct FrameBuffer {
    conn: Mutex<Connection>,
    transforms: AxisTransforms,
    scanning: AtomicBool,
    abort_requested: AtomicBool,
    abort: Notify,
    aborted: AtomicBool,
}

impl FrameBuffer {
    pub fn new(conn: Connection, transforms: AxisTransforms) -> Self {
        Self {
            conn: Mutex::new(conn),
            transforms,
            scanning: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            abort: Notify::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Request that the scanning capture stop early.
    ///
    /// A normal control operation, not an error: the capture call returns
    /// with `is_aborted() == true` and whatever samples had arrived.
    pub fn abort_scan(&self) {
        debug!("abort requested");
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort.notify_one();
    }

    /// Whether the most recent capture ended early
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Capture a frame spanning the entire addressable scan range
    pub async fn capture_full_frame(
        &self,
        x_res: u16,
        y_res: u16,
        dwell: DwellTime,
        output: OutputMode,
    ) -> Result<Frame, CaptureError> {
        self.capture_frame(&CaptureOptions {
            x_res,
            y_res,
            region: None,
            dwell,
            output,
            free_run: false,
        })
        .await
    }

    /// Capture a region of interest of a frame
    pub async fn capture_frame_roi(
        &self,
        region: ScanRegion,
        x_res: u16,
        y_res: u16,
        dwell: DwellTime,
        output: OutputMode,
    ) -> Result<Frame, CaptureError> {
        self.capture_frame(&CaptureOptions {
            x_res,
            y_res,
            region: Some(region),
            dwell,
            output,
            free_run: false,
        })
        .await
    }

    /// General capture entry point selecting raster or free-run mode.
    ///
    /// The returned frame is assembled in emission order: with axis
    /// transforms configured, its origin, shape and resolution are the
    /// transformed geometry the hardware scanned.
    pub async fn capture_frame(&self, opts: &CaptureOptions) -> Result<Frame, CaptureError> {
        if opts.output == OutputMode::NoOutput {
            return Err(CaptureError::NoOutput);
        }
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::Busy);
        }
        let _guard = ScanGuard(&self.scanning);

        self.aborted.store(false, Ordering::SeqCst);
        self.abort_requested.store(false, Ordering::SeqCst);

        let region = opts
            .region
            .unwrap_or_else(|| ScanRegion::full(opts.x_res, opts.y_res));
        if !region.within(opts.x_res, opts.y_res) {
            // Name the axis that actually overruns
            let (start, count, resolution) =
                if region.x_start as u32 + region.x_count as u32 > opts.x_res as u32 {
                    (region.x_start, region.x_count, opts.x_res)
                } else {
                    (region.y_start, region.y_count, opts.y_res)
                };
            return Err(TransformError::RoiOutOfBounds {
                start,
                count,
                resolution,
            }
            .into());
        }

        // Axis mapping happens in pixel space, before DAC ranges exist
        let (hw_region, hw_x_res, hw_y_res) =
            self.transforms.apply(region, opts.x_res, opts.y_res);
        let x_range = DACCodeRange::from_roi(hw_region.x_start, hw_region.x_count, hw_x_res)?;
        let y_range = DACCodeRange::from_roi(hw_region.y_start, hw_region.y_count, hw_y_res)?;

        let mut conn = self.conn.try_lock().map_err(|_| CaptureError::Busy)?;

        let started = Instant::now();
        let cookie = conn.synchronize(true, opts.output).await?;
        debug!("capture synchronized with cookie {:#06x}", cookie);

        let plan = if opts.free_run {
            RasterScan::free_run(x_range, y_range, opts.dwell)
        } else {
            RasterScan::new(x_range, y_range, opts.dwell)
        };
        // The full command sequence is queued before any sample counting
        // begins; the ordered channel then guarantees samples arrive in
        // raster emission order.
        conn.send(&plan.commands()).await?;

        let expected = plan.expected_samples();
        // Samples arrive in emission order, so the frame takes the
        // transformed geometry: its rows are the lines the hardware scans.
        let mut frame = Frame::new(hw_region, hw_x_res, hw_y_res, opts.output);
        let mut staging = BytesMut::with_capacity(64 * 1024);

        let outcome = loop {
            if expected.is_some() && frame.remaining() == 0 {
                break Outcome::Complete;
            }
            if self.abort_requested.load(Ordering::SeqCst) {
                break Outcome::Aborted;
            }
            tokio::select! {
                _ = self.abort.notified() => continue,
                read = conn.read_samples(&mut staging) => match read {
                    Ok(_) => {
                        frame.extend_from_wire(&mut staging, opts.free_run);
                    }
                    Err(ConnectionError::Closed) => break Outcome::Lost,
                    Err(err) => return Err(err.into()),
                },
            }
        };

        match outcome {
            Outcome::Complete => {
                info!(
                    "capture complete: {} samples in {:.1?} ({}x{})",
                    frame.filled(),
                    started.elapsed(),
                    frame.shape().0,
                    frame.shape().1,
                );
            }
            Outcome::Aborted => {
                frame.extend_from_wire(&mut staging, opts.free_run);
                if let Err(err) = conn.send(&[Command::Abort, Command::Flush]).await {
                    warn!("failed to send abort to scan server: {}", err);
                }
                self.aborted.store(true, Ordering::SeqCst);
                info!(
                    "scan aborted after {} of {} samples",
                    frame.filled(),
                    expected.map_or_else(|| "unbounded".into(), |n| n.to_string()),
                );
            }
            Outcome::Lost => {
                self.aborted.store(true, Ordering::SeqCst);
                warn!(
                    "connection lost mid-capture; returning partial frame ({} samples)",
                    frame.filled()
                );
            }
        }

        Ok(frame)
    }
}

struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockScanEngine;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dwell(cycles: u16) -> DwellTime {
        DwellTime::new(cycles).unwrap()
    }

    fn mock_frame_buffer_with(
        limit: Option<u64>,
        transforms: AxisTransforms,
    ) -> Arc<FrameBuffer> {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let mut engine = MockScanEngine::new(far);
        if let Some(limit) = limit {
            engine = engine.with_sample_limit(limit);
        }
        tokio::spawn(async move {
            let _ = engine.run().await;
        });
        Arc::new(FrameBuffer::new(Connection::from_stream(near), transforms))
    }

    fn mock_frame_buffer(limit: Option<u64>) -> Arc<FrameBuffer> {
        mock_frame_buffer_with(limit, AxisTransforms::default())
    }

    #[tokio::test]
    async fn test_capture_full_frame_completes() {
        let fb = mock_frame_buffer(None);
        let frame = fb
            .capture_full_frame(256, 256, dwell(1), OutputMode::EightBit)
            .await
            .unwrap();

        assert_eq!(frame.shape(), (256, 256));
        assert_eq!(frame.origin(), (0, 0));
        assert!(frame.is_full());
        assert!(!fb.is_aborted());

        // The mock emits a ramp starting at 1
        let data = frame.as_u8().unwrap();
        assert_eq!(data.len(), 256 * 256);
        assert_eq!(&data[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(frame.sample(0, 0), Some(1));
        assert_eq!(frame.sample(255, 0), Some(0)); // ramp wraps at 256
    }

    #[tokio::test]
    async fn test_capture_roi_sixteen_bit() {
        let fb = mock_frame_buffer(None);
        let region = ScanRegion {
            x_start: 32,
            y_start: 16,
            x_count: 64,
            y_count: 32,
        };
        let frame = fb
            .capture_frame_roi(region, 256, 256, dwell(2), OutputMode::SixteenBit)
            .await
            .unwrap();

        assert_eq!(frame.shape(), (64, 32));
        assert_eq!(frame.origin(), (32, 16));
        assert_eq!(frame.resolution(), (256, 256));
        assert_eq!(frame.filled(), 64 * 32);
        assert!(!fb.is_aborted());

        let data = frame.as_u16().unwrap();
        assert_eq!(data[0], 1);
        assert_eq!(data[2047], 2048);
    }

    #[tokio::test]
    async fn test_rotate90_frame_matches_scanned_lines() {
        let fb = mock_frame_buffer_with(
            None,
            AxisTransforms {
                x_flip: false,
                y_flip: false,
                rotate90: true,
            },
        );
        let frame = fb
            .capture_full_frame(128, 256, dwell(1), OutputMode::EightBit)
            .await
            .unwrap();

        // The rotation swaps the axes, so the hardware scans 128 lines of
        // 256 samples; the frame's rows must be exactly that wide.
        assert_eq!(frame.shape(), (256, 128));
        assert_eq!(frame.resolution(), (256, 128));
        assert!(frame.is_full());
        assert!(!fb.is_aborted());

        // Ramp sample 257 opens the second scanned line (wraps to 1 in
        // 8 bits), never the middle of one
        assert_eq!(frame.sample(255, 0), Some(0));
        assert_eq!(frame.sample(0, 1), Some(1));
    }

    #[tokio::test]
    async fn test_abort_returns_partial_frame() {
        let fb = mock_frame_buffer(Some(50));

        let worker = {
            let fb = Arc::clone(&fb);
            tokio::spawn(async move {
                fb.capture_full_frame(256, 256, dwell(1), OutputMode::EightBit)
                    .await
            })
        };

        // Give the mock time to deliver its 50 samples, then abort
        tokio::time::sleep(Duration::from_millis(100)).await;
        fb.abort_scan();

        let frame = worker.await.unwrap().unwrap();
        assert!(fb.is_aborted());
        assert_eq!(frame.filled(), 50);

        let data = frame.as_u8().unwrap();
        for (i, &value) in data[..50].iter().enumerate() {
            assert_eq!(value as usize, i + 1);
        }
        assert!(data[50..].iter().all(|&v| v == 0));
    }

    #[tokio::test]
    async fn test_second_capture_rejected_while_scanning() {
        let fb = mock_frame_buffer(Some(0));

        let worker = {
            let fb = Arc::clone(&fb);
            tokio::spawn(async move {
                fb.capture_full_frame(128, 128, dwell(1), OutputMode::EightBit)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = fb
            .capture_full_frame(128, 128, dwell(1), OutputMode::EightBit)
            .await;
        assert!(matches!(second, Err(CaptureError::Busy)));

        // The first capture is unaffected and still aborts cleanly
        fb.abort_scan();
        let frame = worker.await.unwrap().unwrap();
        assert!(fb.is_aborted());
        assert_eq!(frame.filled(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_resolves_as_aborted_partial() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let fb = FrameBuffer::new(Connection::from_stream(near), AxisTransforms::default());

        let stub = tokio::spawn(async move {
            // Synchronize + Flush
            let mut sync = [0u8; 4];
            far.read_exact(&mut sync).await.unwrap();
            let cookie = u16::from_be_bytes([sync[1], sync[2]]);
            far.write_all(&[0xFF, 0xFF]).await.unwrap();
            far.write_all(&cookie.to_be_bytes()).await.unwrap();

            // Blank + RasterRegion + one run + Blank + Flush = 23 bytes
            let mut plan = [0u8; 23];
            far.read_exact(&mut plan).await.unwrap();

            // 10 of 65536 samples, then the server goes away
            far.write_all(&[7u8; 10]).await.unwrap();
        });

        let frame = fb
            .capture_full_frame(256, 256, dwell(1), OutputMode::EightBit)
            .await
            .unwrap();
        stub.await.unwrap();

        assert!(fb.is_aborted());
        assert_eq!(frame.filled(), 10);
        assert!(frame.as_u8().unwrap()[..10].iter().all(|&v| v == 7));

        // The session is faulted; the next capture reports it
        let next = fb
            .capture_full_frame(256, 256, dwell(1), OutputMode::EightBit)
            .await;
        assert!(matches!(
            next,
            Err(CaptureError::Connection(ConnectionError::Faulted))
        ));
    }

    #[tokio::test]
    async fn test_roi_out_of_bounds_rejected() {
        let fb = mock_frame_buffer(None);
        let region = ScanRegion {
            x_start: 200,
            y_start: 0,
            x_count: 100,
            y_count: 64,
        };
        let result = fb
            .capture_frame_roi(region, 256, 256, dwell(1), OutputMode::EightBit)
            .await;
        assert!(matches!(result, Err(CaptureError::Transform(_))));
    }

    #[tokio::test]
    async fn test_roi_bounds_error_names_offending_axis() {
        let fb = mock_frame_buffer(None);
        let region = ScanRegion {
            x_start: 0,
            y_start: 200,
            x_count: 64,
            y_count: 100,
        };
        let err = fb
            .capture_frame_roi(region, 512, 256, dwell(1), OutputMode::EightBit)
            .await
            .unwrap_err();
        match err {
            CaptureError::Transform(TransformError::RoiOutOfBounds {
                start,
                count,
                resolution,
            }) => {
                assert_eq!((start, count, resolution), (200, 100, 256));
            }
            other => panic!("expected an ROI bounds error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_output_mode_rejected() {
        let fb = mock_frame_buffer(None);
        let result = fb
            .capture_full_frame(128, 128, dwell(1), OutputMode::NoOutput)
            .await;
        assert!(matches!(result, Err(CaptureError::NoOutput)));
    }

    #[test]
    fn test_empty_frame_reads_zero() {
        let frame = Frame::new(
            ScanRegion::full(16, 16),
            16,
            16,
            OutputMode::SixteenBit,
        );
        assert_eq!(frame.filled(), 0);
        assert_eq!(frame.sample(0, 0), Some(0));
        assert_eq!(frame.sample(15, 15), Some(0));
        assert_eq!(frame.sample(16, 0), None);
    }

    #[test]
    fn test_frame_wire_fill_keeps_half_samples() {
        let mut frame = Frame::new(
            ScanRegion::full(4, 4),
            4,
            4,
            OutputMode::SixteenBit,
        );
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x02, 0x03]);
        assert_eq!(frame.extend_from_wire(&mut buf, false), 1);
        assert_eq!(frame.sample(0, 0), Some(0x0102));
        // The odd byte waits for its partner
        assert_eq!(buf.len(), 1);
        buf.extend_from_slice(&[0x04]);
        assert_eq!(frame.extend_from_wire(&mut buf, false), 1);
        assert_eq!(frame.sample(1, 0), Some(0x0304));
    }

    #[test]
    fn test_frame_wrapping_fill_rolls_over() {
        let mut frame = Frame::new(
            ScanRegion::full(2, 2),
            2,
            2,
            OutputMode::EightBit,
        );
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(frame.extend_from_wire(&mut buf, true), 5);
        // Fifth sample wrapped back over the first position
        assert_eq!(frame.sample(0, 0), Some(5));
        assert_eq!(frame.sample(1, 1), Some(4));
        assert_eq!(frame.filled(), 4);
    }
}
