//! Tensor size primitives
//!
//! `FloatType` enumerates the storage formats the engine moves between nodes
//! and reads from model files. `Size3D` is the rank-≤3 shape descriptor used
//! by pipes, buffers, and op weights; its byte counts are derived once at
//! construction so downstream code never re-runs the block arithmetic.

use crate::error::{RepartirError, Result};

/// Block size (elements) of the Q40 format
pub const Q40_BLOCK_SIZE: u32 = 32;
/// Block size (elements) of the Q80 format
pub const Q80_BLOCK_SIZE: u32 = 32;

/// Bytes of one Q40 block: f16 scale + 16 packed nibble bytes
pub const Q40_BLOCK_BYTES: usize = 2 + 16;
/// Bytes of one Q80 block: f16 scale + 32 i8 values
pub const Q80_BLOCK_BYTES: usize = 2 + 32;

/// Storage format of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FloatType {
    /// 32-bit IEEE 754
    F32 = 0,
    /// 16-bit IEEE 754 half
    F16 = 1,
    /// 4-bit block quantization (32-element blocks)
    Q40 = 2,
    /// 8-bit block quantization (32-element blocks)
    Q80 = 3,
    /// Sentinel for zero-sized slots
    Unk = 4,
}

impl FloatType {
    /// Decode from the integer stored in model headers and wire packets
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(FloatType::F32),
            1 => Ok(FloatType::F16),
            2 => Ok(FloatType::Q40),
            3 => Ok(FloatType::Q80),
            4 => Ok(FloatType::Unk),
            _ => Err(RepartirError::ModelFormat(format!(
                "Unknown float type code: {code}"
            ))),
        }
    }

    /// Elements per quantization block (1 for scalar formats)
    pub fn block_size(self) -> u32 {
        match self {
            FloatType::F32 | FloatType::F16 => 1,
            FloatType::Q40 => Q40_BLOCK_SIZE,
            FloatType::Q80 => Q80_BLOCK_SIZE,
            FloatType::Unk => 1,
        }
    }

    /// Bytes occupied by `n` elements of this type
    ///
    /// # Panics
    ///
    /// Panics when `n` is not a multiple of the quantization block size;
    /// callers are required to keep quantized extents block-aligned.
    pub fn bytes(self, n: usize) -> usize {
        match self {
            FloatType::F32 => n * 4,
            FloatType::F16 => n * 2,
            FloatType::Q40 => {
                assert!(
                    n % Q40_BLOCK_SIZE as usize == 0,
                    "Q40 extent {n} not block aligned"
                );
                (n / Q40_BLOCK_SIZE as usize) * Q40_BLOCK_BYTES
            }
            FloatType::Q80 => {
                assert!(
                    n % Q80_BLOCK_SIZE as usize == 0,
                    "Q80 extent {n} not block aligned"
                );
                (n / Q80_BLOCK_SIZE as usize) * Q80_BLOCK_BYTES
            }
            FloatType::Unk => 0,
        }
    }

    /// Short lowercase name used by the CLI and diagnostics
    pub fn name(self) -> &'static str {
        match self {
            FloatType::F32 => "f32",
            FloatType::F16 => "f16",
            FloatType::Q40 => "q40",
            FloatType::Q80 => "q80",
            FloatType::Unk => "unk",
        }
    }
}

/// Shape descriptor of a pipe, buffer, or weight slot (rank ≤ 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size3D {
    /// Element storage format
    pub float_type: FloatType,
    /// Outermost extent (1 for 2D/1D)
    pub z: u32,
    /// Row extent
    pub y: u32,
    /// Column extent
    pub x: u32,
    /// Total element count (`z * y * x`)
    pub length: usize,
    /// Total byte count
    pub n_bytes: usize,
    /// Byte count of one z-plane (`y * x` elements)
    pub n_bytes_xy: usize,
}

impl Size3D {
    /// Zero-sized slot (used for ops without weights)
    pub fn none() -> Self {
        Size3D {
            float_type: FloatType::Unk,
            z: 0,
            y: 0,
            x: 0,
            length: 0,
            n_bytes: 0,
            n_bytes_xy: 0,
        }
    }

    /// Rank-3 size
    pub fn d3(float_type: FloatType, z: u32, y: u32, x: u32) -> Self {
        let length = z as usize * y as usize * x as usize;
        let length_xy = y as usize * x as usize;
        Size3D {
            float_type,
            z,
            y,
            x,
            length,
            n_bytes: float_type.bytes(length),
            n_bytes_xy: float_type.bytes(length_xy),
        }
    }

    /// Rank-2 size (`z = 1`)
    pub fn d2(float_type: FloatType, y: u32, x: u32) -> Self {
        Size3D::d3(float_type, 1, y, x)
    }

    /// Rank-1 size (`z = y = 1`)
    pub fn d1(float_type: FloatType, x: u32) -> Self {
        Size3D::d3(float_type, 1, 1, x)
    }

    /// Bytes of a single row (`x` elements)
    pub fn row_bytes(&self) -> usize {
        self.float_type.bytes(self.x as usize)
    }
}
