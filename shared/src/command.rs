/*!
Command model and wire encoding.

Each command serializes as a single header byte (command type in the high
nibble, flag bits in the low nibble) followed by its fields in declaration
order, each as a big-endian 16-bit word. 14-bit DAC codes are packed into
16-bit fields with the top two bits zero; 8.8 fixed point steps travel as
their raw bits. The encode direction (client to hardware) is the
authoritative one; [`Command::decode`] exists for the mock scan engine and
for round-trip tests.
*/

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::transform::DACCodeRange;
use crate::value::{DwellTime, RangeError, U14};

/// Command type tags, fixed by the scan generator gateware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmdType {
    Synchronize = 0x0,
    Abort = 0x1,
    Flush = 0x2,
    ExternalCtrl = 0x3,
    BeamSelect = 0x4,
    Blank = 0x5,
    Delay = 0x6,
    Array = 0x8,
    RasterPixelFill = 0x9,
    RasterRegion = 0xa,
    RasterPixel = 0xb,
    RasterPixelRun = 0xc,
    RasterPixelFreeRun = 0xd,
    VectorPixel = 0xe,
    VectorPixelMinDwell = 0xf,
}

impl CmdType {
    /// Parse a command type from the high nibble of a header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Synchronize),
            0x1 => Some(Self::Abort),
            0x2 => Some(Self::Flush),
            0x3 => Some(Self::ExternalCtrl),
            0x4 => Some(Self::BeamSelect),
            0x5 => Some(Self::Blank),
            0x6 => Some(Self::Delay),
            0x8 => Some(Self::Array),
            0x9 => Some(Self::RasterPixelFill),
            0xa => Some(Self::RasterRegion),
            0xb => Some(Self::RasterPixel),
            0xc => Some(Self::RasterPixelRun),
            0xd => Some(Self::RasterPixelFreeRun),
            0xe => Some(Self::VectorPixel),
            0xf => Some(Self::VectorPixelMinDwell),
            _ => None,
        }
    }
}

/// Sample bit depth returned by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputMode {
    SixteenBit = 0,
    EightBit = 1,
    NoOutput = 2,
}

impl OutputMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::SixteenBit),
            1 => Some(Self::EightBit),
            2 => Some(Self::NoOutput),
            _ => None,
        }
    }

    /// Width of one sample on the inbound stream
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::SixteenBit => 2,
            Self::EightBit => 1,
            Self::NoOutput => 0,
        }
    }
}

/// Which physical beam a command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BeamType {
    NoBeam = 0,
    Electron = 1,
    Ion = 2,
}

impl BeamType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoBeam),
            1 => Some(Self::Electron),
            2 => Some(Self::Ion),
            _ => None,
        }
    }
}

/// Errors from decoding a command byte stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("truncated command: needed {needed} more byte(s)")]
    Truncated { needed: usize },

    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },

    #[error(transparent)]
    Range(#[from] RangeError),
}

/// A single scan generator command
///
/// Commands are immutable once constructed and opaque units of work to the
/// hardware; they are built per operation, serialized, and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Barrier: no later command starts until all earlier ones have
    /// completed and their side effects (DAC settling) are visible. The
    /// hardware answers with `0xFFFF` followed by the cookie.
    Synchronize {
        cookie: u16,
        raster: bool,
        output: OutputMode,
    },
    /// Stop the current scan immediately. Samples already in flight may
    /// still arrive.
    Abort,
    /// Emit any buffered pixel output now instead of waiting for a full
    /// buffer.
    Flush,
    /// Toggle the auxiliary digital control line
    ExternalCtrl { enable: bool },
    /// Select the active beam
    BeamSelect { beam: BeamType },
    /// Suppress (or restore) beam exposure while the scan keeps running.
    /// `inline` delays the change until the next pixel boundary.
    Blank { enable: bool, inline: bool },
    /// Pure time delay, in clock cycles, with no beam motion
    Delay { cycles: u16 },
    /// Repeat an embedded command `length + 1` times without
    /// re-transmitting it
    Array { command: Box<Command>, length: u16 },
    /// Emit a constant-dwell sample without beam motion
    RasterPixelFill { dwell: DwellTime },
    /// Establish the two-axis scan ranges and dwell for subsequent raster
    /// pixel commands. Must precede any `RasterPixel*` command.
    RasterRegion {
        x: DACCodeRange,
        y: DACCodeRange,
        dwell: DwellTime,
    },
    /// One raster pixel at the current raster position
    RasterPixel { dwell: DwellTime },
    /// A run of `length + 1` raster pixels at a fixed dwell
    RasterPixelRun { length: u16, dwell: DwellTime },
    /// Raster pixels forever, terminated only by [`Command::Abort`]
    RasterPixelFreeRun { dwell: DwellTime },
    /// Direct-addressed single pixel at (x, y)
    VectorPixel {
        x: U14,
        y: U14,
        dwell: DwellTime,
    },
    /// Direct-addressed single pixel at the minimum dwell
    VectorPixelMinDwell { x: U14, y: U14 },
}

impl Command {
    /// Build the cheapest vector pixel command for a requested dwell.
    ///
    /// Dwells at or below the one-cycle floor use the dedicated
    /// minimum-dwell form, which saves the dwell field on the wire.
    pub fn vector_pixel(x: U14, y: U14, cycles: u16) -> Command {
        let dwell = DwellTime::clamped(cycles);
        if dwell == DwellTime::MIN {
            Command::VectorPixelMinDwell { x, y }
        } else {
            Command::VectorPixel { x, y, dwell }
        }
    }

    pub fn cmd_type(&self) -> CmdType {
        match self {
            Command::Synchronize { .. } => CmdType::Synchronize,
            Command::Abort => CmdType::Abort,
            Command::Flush => CmdType::Flush,
            Command::ExternalCtrl { .. } => CmdType::ExternalCtrl,
            Command::BeamSelect { .. } => CmdType::BeamSelect,
            Command::Blank { .. } => CmdType::Blank,
            Command::Delay { .. } => CmdType::Delay,
            Command::Array { .. } => CmdType::Array,
            Command::RasterPixelFill { .. } => CmdType::RasterPixelFill,
            Command::RasterRegion { .. } => CmdType::RasterRegion,
            Command::RasterPixel { .. } => CmdType::RasterPixel,
            Command::RasterPixelRun { .. } => CmdType::RasterPixelRun,
            Command::RasterPixelFreeRun { .. } => CmdType::RasterPixelFreeRun,
            Command::VectorPixel { .. } => CmdType::VectorPixel,
            Command::VectorPixelMinDwell { .. } => CmdType::VectorPixelMinDwell,
        }
    }

    /// Header byte: command type in the high nibble, flag bits in the low
    /// nibble, flag fields packed from bit 0 up in declaration order.
    fn header_byte(&self) -> u8 {
        let flags = match self {
            Command::Synchronize { raster, output, .. } => {
                (*raster as u8) | ((*output as u8) << 1)
            }
            Command::ExternalCtrl { enable } => *enable as u8,
            Command::BeamSelect { beam } => *beam as u8,
            Command::Blank { enable, inline } => (*enable as u8) | ((*inline as u8) << 1),
            _ => 0,
        };
        ((self.cmd_type() as u8) << 4) | flags
    }

    fn put_body(&self, buf: &mut BytesMut) {
        match self {
            Command::Synchronize { cookie, .. } => buf.put_u16(*cookie),
            Command::Abort
            | Command::Flush
            | Command::ExternalCtrl { .. }
            | Command::BeamSelect { .. }
            | Command::Blank { .. } => {}
            Command::Delay { cycles } => buf.put_u16(*cycles),
            Command::Array { command, length } => {
                buf.put_u8(command.header_byte());
                buf.put_u16(*length);
                command.put_body(buf);
            }
            Command::RasterPixelFill { dwell } => buf.put_u16(dwell.cycles()),
            Command::RasterRegion { x, y, dwell } => {
                buf.put_u16(x.start().get());
                buf.put_u16(x.count());
                buf.put_u16(x.step().to_bits());
                buf.put_u16(y.start().get());
                buf.put_u16(y.count());
                buf.put_u16(y.step().to_bits());
                buf.put_u16(dwell.cycles());
            }
            Command::RasterPixel { dwell } => buf.put_u16(dwell.cycles()),
            Command::RasterPixelRun { length, dwell } => {
                buf.put_u16(*length);
                buf.put_u16(dwell.cycles());
            }
            Command::RasterPixelFreeRun { dwell } => buf.put_u16(dwell.cycles()),
            Command::VectorPixel { x, y, dwell } => {
                buf.put_u16(x.get());
                buf.put_u16(y.get());
                buf.put_u16(dwell.cycles());
            }
            Command::VectorPixelMinDwell { x, y } => {
                buf.put_u16(x.get());
                buf.put_u16(y.get());
            }
        }
    }

    /// Append this command's wire bytes to `buf`
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.header_byte());
        self.put_body(buf);
    }

    /// Encode into a freshly allocated buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Number of samples the hardware will emit for this command, if it
    /// can be known without scan-region context. Free runs return `None`.
    pub fn expected_samples(&self) -> Option<u64> {
        match self {
            Command::RasterPixel { .. }
            | Command::VectorPixel { .. }
            | Command::VectorPixelMinDwell { .. } => Some(1),
            Command::RasterPixelRun { length, .. } => Some(*length as u64 + 1),
            Command::RasterPixelFreeRun { .. } | Command::RasterPixelFill { .. } => None,
            Command::Array { command, length } => command
                .expected_samples()
                .map(|n| n * (*length as u64 + 1)),
            _ => Some(0),
        }
    }

    /// Decode one command from the front of `data`.
    ///
    /// Returns the command and the number of bytes consumed. Round-trip
    /// consistent with [`Command::encode`].
    pub fn decode(data: &[u8]) -> Result<(Command, usize), CommandError> {
        let header = *data.first().ok_or(CommandError::Truncated { needed: 1 })?;
        let (cmd, body_len) = Self::decode_with_header(header, &data[1..])?;
        Ok((cmd, body_len + 1))
    }

    fn decode_with_header(header: u8, body: &[u8]) -> Result<(Command, usize), CommandError> {
        let cmd_type =
            CmdType::from_u8(header >> 4).ok_or(CommandError::UnknownOpcode(header))?;
        let flags = header & 0x0F;

        let take_u16 = |offset: usize| -> Result<u16, CommandError> {
            if body.len() < offset + 2 {
                return Err(CommandError::Truncated {
                    needed: offset + 2 - body.len(),
                });
            }
            Ok(u16::from_be_bytes([body[offset], body[offset + 1]]))
        };

        let cmd = match cmd_type {
            CmdType::Synchronize => {
                let output = OutputMode::from_u8((flags >> 1) & 0b11).ok_or(
                    CommandError::InvalidField {
                        field: "output_mode",
                        value: (flags >> 1) & 0b11,
                    },
                )?;
                let cmd = Command::Synchronize {
                    cookie: take_u16(0)?,
                    raster: flags & 1 != 0,
                    output,
                };
                return Ok((cmd, 2));
            }
            CmdType::Abort => Command::Abort,
            CmdType::Flush => Command::Flush,
            CmdType::ExternalCtrl => Command::ExternalCtrl {
                enable: flags & 1 != 0,
            },
            CmdType::BeamSelect => {
                let beam =
                    BeamType::from_u8(flags & 0b11).ok_or(CommandError::InvalidField {
                        field: "beam_type",
                        value: flags & 0b11,
                    })?;
                Command::BeamSelect { beam }
            }
            CmdType::Blank => Command::Blank {
                enable: flags & 1 != 0,
                inline: flags & 2 != 0,
            },
            CmdType::Delay => {
                return Ok((
                    Command::Delay {
                        cycles: take_u16(0)?,
                    },
                    2,
                ));
            }
            CmdType::Array => {
                let sub_header = *body.first().ok_or(CommandError::Truncated { needed: 1 })?;
                let length = take_u16(1)?;
                let (sub, sub_body_len) = Self::decode_with_header(sub_header, &body[3..])?;
                return Ok((
                    Command::Array {
                        command: Box::new(sub),
                        length,
                    },
                    3 + sub_body_len,
                ));
            }
            CmdType::RasterPixelFill => {
                return Ok((
                    Command::RasterPixelFill {
                        dwell: DwellTime::new(take_u16(0)?)?,
                    },
                    2,
                ));
            }
            CmdType::RasterRegion => {
                let x = DACCodeRange::new(
                    U14::new(take_u16(0)?)?,
                    take_u16(2)?,
                    crate::value::Fp8_8::from_bits(take_u16(4)?),
                )
                .map_err(|_| CommandError::InvalidField {
                    field: "x_range",
                    value: 0,
                })?;
                let y = DACCodeRange::new(
                    U14::new(take_u16(6)?)?,
                    take_u16(8)?,
                    crate::value::Fp8_8::from_bits(take_u16(10)?),
                )
                .map_err(|_| CommandError::InvalidField {
                    field: "y_range",
                    value: 0,
                })?;
                let dwell = DwellTime::new(take_u16(12)?)?;
                return Ok((Command::RasterRegion { x, y, dwell }, 14));
            }
            CmdType::RasterPixel => {
                return Ok((
                    Command::RasterPixel {
                        dwell: DwellTime::new(take_u16(0)?)?,
                    },
                    2,
                ));
            }
            CmdType::RasterPixelRun => {
                return Ok((
                    Command::RasterPixelRun {
                        length: take_u16(0)?,
                        dwell: DwellTime::new(take_u16(2)?)?,
                    },
                    4,
                ));
            }
            CmdType::RasterPixelFreeRun => {
                return Ok((
                    Command::RasterPixelFreeRun {
                        dwell: DwellTime::new(take_u16(0)?)?,
                    },
                    2,
                ));
            }
            CmdType::VectorPixel => {
                return Ok((
                    Command::VectorPixel {
                        x: U14::new(take_u16(0)?)?,
                        y: U14::new(take_u16(2)?)?,
                        dwell: DwellTime::new(take_u16(4)?)?,
                    },
                    6,
                ));
            }
            CmdType::VectorPixelMinDwell => {
                return Ok((
                    Command::VectorPixelMinDwell {
                        x: U14::new(take_u16(0)?)?,
                        y: U14::new(take_u16(2)?)?,
                    },
                    4,
                ));
            }
        };
        Ok((cmd, 0))
    }
}
