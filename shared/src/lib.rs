/*!
# Shared Protocol Types

This crate contains the command protocol shared between all Rust components
of the OBI scan control system: validated numeric value types, the command
model with its wire encoding, and the coordinate transform layer that maps
resolutions and regions of interest onto DAC code ranges.

## Core Types

- [`U14`], [`Fp8_8`], [`DwellTime`] - Range-enforced numeric base types
- [`Command`] - Tagged command variants with stable wire encoding
- [`DACCodeRange`] - One axis of a scan in DAC code space
- [`ScanRegion`] / [`AxisTransforms`] - Pixel-space ROI and axis mapping

## Modules

- [`value`] - Numeric base types and range enforcement
- [`command`] - Command model and wire encoding
- [`transform`] - Resolution/ROI to DAC code range conversion
- [`error`] - Common error types
*/

pub mod command;
pub mod error;
pub mod transform;
pub mod value;

// Re-export commonly used types
pub use command::{BeamType, Command, CommandError, OutputMode};
pub use error::{ProtocolError, Result};
pub use transform::{AxisTransforms, DACCodeRange, ScanRegion, TransformError};
pub use value::{DwellTime, Fp8_8, RangeError, U14};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Number of addressable DAC codes per axis (14-bit DACs)
    pub const DAC_RANGE: u32 = 16384;

    /// Highest valid DAC code
    pub const DAC_CODE_MAX: u16 = 16383;

    /// Scale factor of the 8.8 fixed point step format (2^8 = 256)
    pub const STEP_SCALE_FACTOR: f64 = 256.0;

    /// Marker preceding the cookie in a synchronize response
    pub const SYNC_MARKER: [u8; 2] = [0xFF, 0xFF];
}
