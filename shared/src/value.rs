/*!
Numeric base types with explicit range enforcement.

Every value that crosses the wire is either a plain `u16` or one of the
newtypes in this module. Out-of-range input fails construction with a
[`RangeError`] instead of silently wrapping, so a value that exists is
always valid to transmit.
*/

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DAC_CODE_MAX, STEP_SCALE_FACTOR};

/// A numeric value fell outside the bounds of its target type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{value} out of range for {type_name}: expected {min}..={max}")]
pub struct RangeError {
    pub type_name: &'static str,
    pub value: u32,
    pub min: u32,
    pub max: u32,
}

impl RangeError {
    fn new(type_name: &'static str, value: u32, min: u32, max: u32) -> Self {
        Self {
            type_name,
            value,
            min,
            max,
        }
    }
}

/// A 14-bit unsigned DAC code (0..=16383)
///
/// DAC codes address one discrete deflection position on an axis. On the
/// wire a `U14` occupies a big-endian 16-bit field with the top two bits
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct U14(u16);

impl U14 {
    /// Highest valid DAC code
    pub const MAX: U14 = U14(DAC_CODE_MAX);

    /// First DAC code
    pub const MIN: U14 = U14(0);

    pub fn new(value: u16) -> Result<Self, RangeError> {
        if value > DAC_CODE_MAX {
            return Err(RangeError::new("u14", value as u32, 0, DAC_CODE_MAX as u32));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for U14 {
    type Error = RangeError;

    fn try_from(value: u16) -> Result<Self, RangeError> {
        Self::new(value)
    }
}

impl From<U14> for u16 {
    fn from(value: U14) -> u16 {
        value.0
    }
}

/// An unsigned 8.8 fixed point value (0..=255.996)
///
/// Stored as raw bits; the represented value is `bits / 256`. Used for the
/// per-step DAC code increment of a scan range, where sub-code precision
/// keeps long scans from accumulating rounding drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fp8_8(u16);

impl Fp8_8 {
    /// One DAC code per step
    pub const ONE: Fp8_8 = Fp8_8(256);

    /// Construct from the raw 16-bit wire representation
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn to_bits(self) -> u16 {
        self.0
    }

    /// Convert a rational value to 8.8 fixed point.
    ///
    /// Rounding is round-half-to-even so that computed DAC codes are
    /// reproducible across implementations.
    pub fn from_f64(value: f64) -> Result<Self, RangeError> {
        let scaled = (value * STEP_SCALE_FACTOR).round_ties_even();
        if !(0.0..=u16::MAX as f64).contains(&scaled) || !scaled.is_finite() {
            return Err(RangeError::new(
                "fp8_8",
                scaled.max(0.0).min(u32::MAX as f64) as u32,
                0,
                u16::MAX as u32,
            ));
        }
        Ok(Self(scaled as u16))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / STEP_SCALE_FACTOR
    }
}

/// Number of clock cycles the beam rests at one scan position
///
/// One dwell unit is one ADC cycle (125 ns at 8 MHz). A dwell of zero would
/// produce no sample, so it is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct DwellTime(u16);

impl DwellTime {
    /// Shortest representable dwell
    pub const MIN: DwellTime = DwellTime(1);

    pub fn new(cycles: u16) -> Result<Self, RangeError> {
        if cycles == 0 {
            return Err(RangeError::new("dwell_time", 0, 1, u16::MAX as u32));
        }
        Ok(Self(cycles))
    }

    /// Clamp below the floor dwell instead of failing.
    ///
    /// Used by vector patterns that request the minimum dwell: a requested
    /// dwell of zero becomes [`DwellTime::MIN`].
    pub fn clamped(cycles: u16) -> Self {
        Self(cycles.max(1))
    }

    pub fn cycles(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for DwellTime {
    type Error = RangeError;

    fn try_from(cycles: u16) -> Result<Self, RangeError> {
        Self::new(cycles)
    }
}

impl From<DwellTime> for u16 {
    fn from(value: DwellTime) -> u16 {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u14_bounds() {
        assert_eq!(U14::new(0).unwrap().get(), 0);
        assert_eq!(U14::new(16383).unwrap().get(), 16383);

        let err = U14::new(16384).unwrap_err();
        assert_eq!(err.type_name, "u14");
        assert_eq!(err.value, 16384);
        assert!(U14::new(u16::MAX).is_err());
    }

    #[test]
    fn test_fp8_8_roundtrip() {
        // 1.5 encodes as 384 and decodes back exactly
        let step = Fp8_8::from_f64(1.5).unwrap();
        assert_eq!(step.to_bits(), 384);
        assert_eq!(step.to_f64(), 1.5);

        assert_eq!(Fp8_8::from_bits(384), step);
        assert_eq!(Fp8_8::ONE.to_f64(), 1.0);
    }

    #[test]
    fn test_fp8_8_rounds_half_to_even() {
        // 0.001953125 * 256 = 0.5 exactly: rounds down to the even 0
        assert_eq!(Fp8_8::from_f64(0.5 / 256.0).unwrap().to_bits(), 0);
        // 1.5 / 256 scales to 1.5: rounds up to the even 2
        assert_eq!(Fp8_8::from_f64(1.5 / 256.0).unwrap().to_bits(), 2);
    }

    #[test]
    fn test_fp8_8_range() {
        assert!(Fp8_8::from_f64(-0.5).is_err());
        assert!(Fp8_8::from_f64(256.0).is_err());
        assert_eq!(Fp8_8::from_f64(255.99609375).unwrap().to_bits(), u16::MAX);
    }

    #[test]
    fn test_dwell_time() {
        assert_eq!(DwellTime::new(1).unwrap().cycles(), 1);
        assert_eq!(DwellTime::new(u16::MAX).unwrap().cycles(), u16::MAX);
        assert!(DwellTime::new(0).is_err());

        assert_eq!(DwellTime::clamped(0), DwellTime::MIN);
        assert_eq!(DwellTime::clamped(7).cycles(), 7);
    }
}
