//! Tile data formats and their L1 footprint.

use std::fmt;

/// Element format of a tile as stored in L1 or DRAM.
///
/// Discriminants match the hardware encoding written into CB descriptors
/// and passed to format-aware address helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataFormat {
    Float32 = 0,
    Float16 = 1,
    Bfp8 = 2,
    Bfp4 = 3,
    Tf32 = 4,
    Float16B = 5,
    Bfp8B = 6,
    Bfp4B = 7,
    Int32 = 8,
    Int16 = 9,
    Lf8 = 10,
    Bfp2 = 11,
    UInt16 = 12,
    Int8 = 14,
    Bfp2B = 15,
    UInt8 = 30,
    Invalid = 0xff,
}

impl DataFormat {
    /// Decode a raw format id. Unknown ids map to [`DataFormat::Invalid`].
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => DataFormat::Float32,
            1 => DataFormat::Float16,
            2 => DataFormat::Bfp8,
            3 => DataFormat::Bfp4,
            4 => DataFormat::Tf32,
            5 => DataFormat::Float16B,
            6 => DataFormat::Bfp8B,
            7 => DataFormat::Bfp4B,
            8 => DataFormat::Int32,
            9 => DataFormat::Int16,
            10 => DataFormat::Lf8,
            11 => DataFormat::Bfp2,
            12 => DataFormat::UInt16,
            14 => DataFormat::Int8,
            15 => DataFormat::Bfp2B,
            30 => DataFormat::UInt8,
            _ => DataFormat::Invalid,
        }
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Size of one 32x32 tile in bytes.
    ///
    /// Block-float formats carry 64 bytes of shared exponents on top of the
    /// mantissas. Formats without a dedicated entry use the Bfp8 size.
    pub fn tile_size(self) -> u32 {
        match self {
            DataFormat::Float16 | DataFormat::Float16B => 2048,
            DataFormat::Bfp8 | DataFormat::Bfp8B => 1024 + 64,
            DataFormat::Float32 => 4096,
            DataFormat::Bfp4 | DataFormat::Bfp4B => 512 + 64,
            DataFormat::Bfp2 | DataFormat::Bfp2B => 256 + 64,
            _ => 1024 + 64,
        }
    }

    /// Tile size in 16-byte L1 words.
    #[inline]
    pub fn tile_words(self) -> u32 {
        self.tile_size() >> 4
    }
}

impl Default for DataFormat {
    fn default() -> Self {
        DataFormat::Float32
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
