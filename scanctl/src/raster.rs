/*!
Raster scan planning.

Turns a pair of DAC code ranges plus a dwell time into the ordered command
sequence for one frame: unblank in sync with the first pixel, establish
the raster region, cover the frame with pixel runs (the run length field
is 16 bits, so long frames are chunked), then blank and flush. Free-running
scans replace the runs with a single `RasterPixelFreeRun` that only an
`Abort` ends.
*/

use shared::{Command, DACCodeRange, DwellTime};

/// Longest pixel run one `RasterPixelRun` can encode
const MAX_RUN_PIXELS: u64 = 65536;

/// Plan for a single raster scan over a two-axis region
#[derive(Debug, Clone)]
pub struct RasterScan {
    x: DACCodeRange,
    y: DACCodeRange,
    dwell: DwellTime,
    free_run: bool,
}

impl RasterScan {
    pub fn new(x: DACCodeRange, y: DACCodeRange, dwell: DwellTime) -> Self {
        Self {
            x,
            y,
            dwell,
            free_run: false,
        }
    }

    pub fn free_run(x: DACCodeRange, y: DACCodeRange, dwell: DwellTime) -> Self {
        Self {
            x,
            y,
            dwell,
            free_run: true,
        }
    }

    /// Samples the hardware will emit, or `None` for a free run
    pub fn expected_samples(&self) -> Option<u64> {
        if self.free_run {
            None
        } else {
            Some(self.x.count() as u64 * self.y.count() as u64)
        }
    }

    /// The full command sequence for this scan, in submission order.
    ///
    /// The caller is expected to have synchronized the connection first;
    /// the sequence starts at the region setup.
    pub fn commands(&self) -> Vec<Command> {
        let mut commands = vec![
            Command::Blank {
                enable: false,
                inline: true,
            },
            Command::RasterRegion {
                x: self.x,
                y: self.y,
                dwell: self.dwell,
            },
        ];

        if self.free_run {
            commands.push(Command::RasterPixelFreeRun { dwell: self.dwell });
        } else {
            let mut remaining = self.x.count() as u64 * self.y.count() as u64;
            while remaining > MAX_RUN_PIXELS {
                commands.push(Command::RasterPixelRun {
                    length: (MAX_RUN_PIXELS - 1) as u16,
                    dwell: self.dwell,
                });
                remaining -= MAX_RUN_PIXELS;
            }
            if remaining > 0 {
                commands.push(Command::RasterPixelRun {
                    length: (remaining - 1) as u16,
                    dwell: self.dwell,
                });
            }
            // Return to a blanked state once the last pixel executes
            commands.push(Command::Blank {
                enable: true,
                inline: true,
            });
        }

        commands.push(Command::Flush);
        commands
    }
}
