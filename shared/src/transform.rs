/*!
Coordinate transform layer.

This module converts a requested resolution or region of interest into the
DAC code ranges the scan generator executes. All reasoning happens in
logical pixel space first (including axis flips and rotation); DAC codes
are only produced at the very end, which keeps the transforms composable
and testable independent of hardware limits.

Rounding policy: both the 8.8 step derivation and the ROI origin
translation round half to even. The original hardware's DAC mapping is not
documented to the last LSB, so this is a compatibility-sensitive choice;
it is pinned here and in the tests.
*/

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DAC_CODE_MAX, DAC_RANGE};
use crate::value::{Fp8_8, U14};

/// A requested scan geometry cannot be mapped to valid DAC code ranges
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("scan range must cover at least one pixel")]
    ZeroCount,

    #[error("resolution {resolution} exceeds the DAC code space ({DAC_RANGE} codes)")]
    ResolutionTooLarge { resolution: u16 },

    #[error("resolution {resolution} needs a step outside the 8.8 fixed point range")]
    StepOutOfRange { resolution: u16 },

    #[error("ROI {start}+{count} extends beyond resolution {resolution}")]
    RoiOutOfBounds {
        start: u16,
        count: u16,
        resolution: u16,
    },

    #[error("scan span ends at DAC code {end_code}, past the last code {DAC_CODE_MAX}")]
    SpanOverflow { end_code: u32 },
}

/// One axis of a scan: starting DAC code, step count and per-step increment
///
/// Invariant: `start + step * (count - 1)` resolves to a valid 14-bit DAC
/// code. Construction enforces this, so a range that exists is always
/// executable by the scan generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DACCodeRange {
    start: U14,
    count: u16,
    step: Fp8_8,
}

impl DACCodeRange {
    pub fn new(start: U14, count: u16, step: Fp8_8) -> Result<Self, TransformError> {
        if count == 0 {
            return Err(TransformError::ZeroCount);
        }
        // End position in 8.8 fixed point; the DAC truncates sub-code bits.
        let end_fp = (start.get() as u64) * 256 + (step.to_bits() as u64) * (count as u64 - 1);
        let end_code = (end_fp >> 8) as u32;
        if end_code > DAC_CODE_MAX as u32 {
            return Err(TransformError::SpanOverflow { end_code });
        }
        Ok(Self { start, count, step })
    }

    /// Subdivide the full DAC span into `resolution` evenly spaced codes.
    ///
    /// The returned range always reads back `count() == resolution`.
    /// Resolutions above 16384 exceed the code space; resolutions below 65
    /// need a step coarser than 8.8 fixed point can carry.
    pub fn from_resolution(resolution: u16) -> Result<Self, TransformError> {
        let step = Self::step_for_resolution(resolution)?;
        Self::new(U14::MIN, resolution, step)
    }

    /// Map a one-axis slice of a region of interest into DAC codes.
    ///
    /// `start` and `count` are in the pixel coordinates of a full frame of
    /// `resolution` pixels; the per-pixel spacing is the same one
    /// [`from_resolution`](Self::from_resolution) would derive, so an ROI
    /// capture lands on the same grid as the full frame it came from.
    pub fn from_roi(start: u16, count: u16, resolution: u16) -> Result<Self, TransformError> {
        if count == 0 {
            return Err(TransformError::ZeroCount);
        }
        if start as u32 + count as u32 > resolution as u32 {
            return Err(TransformError::RoiOutOfBounds {
                start,
                count,
                resolution,
            });
        }
        let step = Self::step_for_resolution(resolution)?;
        let origin = (start as f64 * step.to_f64()).round_ties_even() as u32;
        let origin = U14::new(origin.min(u16::MAX as u32) as u16)
            .map_err(|_| TransformError::SpanOverflow { end_code: origin })?;
        Self::new(origin, count, step)
    }

    fn step_for_resolution(resolution: u16) -> Result<Fp8_8, TransformError> {
        if resolution == 0 {
            return Err(TransformError::ZeroCount);
        }
        if resolution as u32 > DAC_RANGE {
            return Err(TransformError::ResolutionTooLarge { resolution });
        }
        let step = Fp8_8::from_f64(DAC_RANGE as f64 / resolution as f64)
            .map_err(|_| TransformError::StepOutOfRange { resolution })?;
        if step.to_bits() < 256 {
            return Err(TransformError::StepOutOfRange { resolution });
        }
        Ok(step)
    }

    pub fn start(&self) -> U14 {
        self.start
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn step(&self) -> Fp8_8 {
        self.step
    }
}

/// A sub-rectangle of the full scan space, in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRegion {
    pub x_start: u16,
    pub y_start: u16,
    pub x_count: u16,
    pub y_count: u16,
}

impl ScanRegion {
    /// The region covering an entire frame of the given resolution
    pub fn full(x_res: u16, y_res: u16) -> Self {
        Self {
            x_start: 0,
            y_start: 0,
            x_count: x_res,
            y_count: y_res,
        }
    }

    pub fn within(&self, x_res: u16, y_res: u16) -> bool {
        self.x_start as u32 + self.x_count as u32 <= x_res as u32
            && self.y_start as u32 + self.y_count as u32 <= y_res as u32
    }
}

/// Per-microscope axis mapping: flips and 90 degree rotation
///
/// Applied by permuting and reflecting the logical pixel-space region
/// before any DAC code range is constructed; DAC codes are never mutated
/// after the fact. Rotation is applied first (transpose plus X
/// reflection), then the X and Y flips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisTransforms {
    #[serde(default)]
    pub x_flip: bool,
    #[serde(default)]
    pub y_flip: bool,
    #[serde(default)]
    pub rotate90: bool,
}

impl AxisTransforms {
    /// Transform a pixel-space region. Returns the mapped region and the
    /// (possibly swapped) per-axis resolutions.
    ///
    /// The region must lie within `x_res` x `y_res`.
    pub fn apply(&self, region: ScanRegion, x_res: u16, y_res: u16) -> (ScanRegion, u16, u16) {
        let mut r = region;
        let (mut xr, mut yr) = (x_res, y_res);
        if self.rotate90 {
            r = ScanRegion {
                x_start: r.y_start,
                y_start: r.x_start,
                x_count: r.y_count,
                y_count: r.x_count,
            };
            std::mem::swap(&mut xr, &mut yr);
            r.x_start = xr - r.x_start - r.x_count;
        }
        if self.x_flip {
            r.x_start = xr - r.x_start - r.x_count;
        }
        if self.y_flip {
            r.y_start = yr - r.y_start - r.y_count;
        }
        (r, xr, yr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_resolution_counts() {
        for res in [65u16, 256, 512, 1024, 4096, 16384] {
            let range = DACCodeRange::from_resolution(res).unwrap();
            assert_eq!(range.count(), res);
            assert_eq!(range.start().get(), 0);

            // start + step*(count-1) stays inside the DAC span
            let end = range.start().get() as f64 + range.step().to_f64() * (res as f64 - 1.0);
            assert!(end <= DAC_CODE_MAX as f64, "res {res} ends at {end}");
        }
    }

    #[test]
    fn test_from_resolution_step_values() {
        // 16384 codes over 1024 pixels = 16 codes per pixel
        let range = DACCodeRange::from_resolution(1024).unwrap();
        assert_eq!(range.step().to_f64(), 16.0);

        let full = DACCodeRange::from_resolution(16384).unwrap();
        assert_eq!(full.step(), Fp8_8::ONE);
    }

    #[test]
    fn test_from_resolution_rejects_bad_resolutions() {
        assert_eq!(
            DACCodeRange::from_resolution(0),
            Err(TransformError::ZeroCount)
        );
        assert_eq!(
            DACCodeRange::from_resolution(16385),
            Err(TransformError::ResolutionTooLarge { resolution: 16385 })
        );
        // 16384 / 32 = 512 codes per step, outside 8.8 range
        assert!(matches!(
            DACCodeRange::from_resolution(32),
            Err(TransformError::StepOutOfRange { .. })
        ));
    }

    #[test]
    fn test_from_roi_recovers_origin() {
        // 256-pixel frame, ROI starting at pixel 32: one step is 64 codes
        let range = DACCodeRange::from_roi(32, 64, 256).unwrap();
        assert_eq!(range.count(), 64);
        assert_eq!(range.start().get(), 32 * 64);

        // inverse mapping lands back on the original pixel
        let recovered = range.start().get() as f64 / range.step().to_f64();
        assert!((recovered - 32.0).abs() < 1.0);
    }

    #[test]
    fn test_from_roi_rejects_out_of_bounds() {
        assert_eq!(
            DACCodeRange::from_roi(200, 100, 256),
            Err(TransformError::RoiOutOfBounds {
                start: 200,
                count: 100,
                resolution: 256
            })
        );
        assert_eq!(
            DACCodeRange::from_roi(0, 0, 256),
            Err(TransformError::ZeroCount)
        );
    }

    #[test]
    fn test_span_overflow_rejected() {
        // start 16000 with 100 steps of 16 codes runs off the end
        let start = U14::new(16000).unwrap();
        let step = Fp8_8::from_f64(16.0).unwrap();
        assert!(matches!(
            DACCodeRange::new(start, 100, step),
            Err(TransformError::SpanOverflow { .. })
        ));
        // a single point at the last code is fine
        assert!(DACCodeRange::new(U14::MAX, 1, step).is_ok());
    }

    #[test]
    fn test_axis_flips() {
        let region = ScanRegion {
            x_start: 10,
            y_start: 20,
            x_count: 30,
            y_count: 40,
        };
        let flips = AxisTransforms {
            x_flip: true,
            y_flip: true,
            rotate90: false,
        };
        let (r, xr, yr) = flips.apply(region, 256, 512);
        assert_eq!((xr, yr), (256, 512));
        assert_eq!(r.x_start, 256 - 10 - 30);
        assert_eq!(r.y_start, 512 - 20 - 40);
        assert_eq!((r.x_count, r.y_count), (30, 40));
    }

    #[test]
    fn test_rotation_swaps_axes() {
        let region = ScanRegion {
            x_start: 10,
            y_start: 20,
            x_count: 30,
            y_count: 40,
        };
        let rot = AxisTransforms {
            x_flip: false,
            y_flip: false,
            rotate90: true,
        };
        let (r, xr, yr) = rot.apply(region, 256, 512);
        assert_eq!((xr, yr), (512, 256));
        assert_eq!((r.x_count, r.y_count), (40, 30));
        assert_eq!(r.x_start, 512 - 20 - 40);
        assert_eq!(r.y_start, 10);
        assert!(r.within(xr, yr));
    }

    #[test]
    fn test_identity_transform() {
        let region = ScanRegion::full(128, 128);
        let (r, xr, yr) = AxisTransforms::default().apply(region, 128, 128);
        assert_eq!(r, region);
        assert_eq!((xr, yr), (128, 128));
    }
}
