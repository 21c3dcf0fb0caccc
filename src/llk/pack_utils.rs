//! Tile layout conversion and data-format codecs.
//!
//! Math works on row-major 32x32 tiles. L1 holds tiles split into four
//! 16x16 faces stored one after another:
//!
//! ```text
//!   row-major tile              face layout in L1
//!   ┌─────────┬─────────┐
//!   │ face 0  │ face 1  │       [ face 0 | face 1 | face 2 | face 3 ]
//!   ├─────────┼─────────┤         256 elements each, rows of 16
//!   │ face 2  │ face 3  │
//!   └─────────┴─────────┘
//! ```
//!
//! Codecs exist for Float32, Float16 and Float16_b. Block-float and integer
//! formats report [`EmuError::Unsupported`].

use byteorder::{ByteOrder, LittleEndian};
use half::f16;

use crate::device::format::DataFormat;
use crate::error::{EmuError, Result};

/// Rows and columns of a tile.
pub const TILE_DIM: usize = 32;

/// Elements of a tile.
pub const TILE_SIZE: usize = TILE_DIM * TILE_DIM;

const FACE_DIM: usize = 16;

// ============================================================================
// Face layout
// ============================================================================

/// Split a row-major tile into four faces.
pub fn tile_to_faces(src: &[f32], dst: &mut [f32]) {
    for_each_face_element(|tile_pos, face_pos| dst[face_pos] = src[tile_pos]);
}

/// Merge four faces back into a row-major tile.
pub fn faces_to_tile(src: &[f32], dst: &mut [f32]) {
    for_each_face_element(|tile_pos, face_pos| dst[tile_pos] = src[face_pos]);
}

fn for_each_face_element(mut f: impl FnMut(usize, usize)) {
    for fh in 0..2 {
        for fw in 0..2 {
            for ih in 0..FACE_DIM {
                for iw in 0..FACE_DIM {
                    let face_pos = fh * 512 + fw * 256 + ih * FACE_DIM + iw;
                    let tile_pos = fh * 512 + ih * TILE_DIM + fw * FACE_DIM + iw;
                    f(tile_pos, face_pos);
                }
            }
        }
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Bytes per element, or `Unsupported` for formats without a codec.
pub fn element_size(df: DataFormat) -> Result<usize> {
    match df {
        DataFormat::Float32 => Ok(4),
        DataFormat::Float16 | DataFormat::Float16B => Ok(2),
        other => Err(EmuError::unsupported(format!("no codec for data format {:?}", other))),
    }
}

/// Encode one tile. `src` holds [`TILE_SIZE`] elements.
pub fn pack_tile(df: DataFormat, src: &[f32]) -> Result<Vec<u8>> {
    pack_raw(df, &src[..TILE_SIZE])
}

/// Decode one tile into `dst`.
pub fn unpack_tile(df: DataFormat, src: &[u8], dst: &mut [f32]) -> Result<()> {
    unpack_raw(df, src, &mut dst[..TILE_SIZE])
}

/// Encode `src.len()` elements back to back.
pub fn pack_raw(df: DataFormat, src: &[f32]) -> Result<Vec<u8>> {
    let size = element_size(df)?;
    let mut out = vec![0u8; src.len() * size];
    match df {
        DataFormat::Float32 => LittleEndian::write_f32_into(src, &mut out),
        DataFormat::Float16B => {
            for (chunk, &x) in out.chunks_exact_mut(2).zip(src) {
                LittleEndian::write_u16(chunk, (x.to_bits() >> 16) as u16);
            }
        }
        _ => {
            for (chunk, &x) in out.chunks_exact_mut(2).zip(src) {
                LittleEndian::write_u16(chunk, f32_to_f16_bits(x));
            }
        }
    }
    Ok(out)
}

/// Decode `dst.len()` elements from `src`.
pub fn unpack_raw(df: DataFormat, src: &[u8], dst: &mut [f32]) -> Result<()> {
    let size = element_size(df)?;
    let need = dst.len() * size;
    if src.len() < need {
        return Err(EmuError::invariant(format!(
            "{:?} decode needs {} bytes, got {}",
            df,
            need,
            src.len()
        )));
    }
    match df {
        DataFormat::Float32 => LittleEndian::read_f32_into(&src[..need], dst),
        DataFormat::Float16B => {
            for (x, chunk) in dst.iter_mut().zip(src.chunks_exact(2)) {
                *x = u16b_as_float(LittleEndian::read_u16(chunk) as u32);
            }
        }
        _ => {
            for (x, chunk) in dst.iter_mut().zip(src.chunks_exact(2)) {
                *x = f16_bits_to_f32(LittleEndian::read_u16(chunk));
            }
        }
    }
    Ok(())
}

/// Byte offset of element `index` in a raw (untiled) row of format `df`.
pub fn get_raw_offset(df: DataFormat, index: u32) -> Result<u32> {
    Ok(index * element_size(df)? as u32)
}

/// Round-to-nearest-even conversion to IEEE binary16.
#[inline]
pub fn f32_to_f16_bits(x: f32) -> u16 {
    f16::from_f32(x).to_bits()
}

#[inline]
pub fn f16_bits_to_f32(h: u16) -> f32 {
    f16::from_bits(h).to_f32()
}

// ============================================================================
// Scalar parameter decoders
// ============================================================================

/// Float16 ("a") bit pattern to float.
///
/// Exponent rebias only: zero and denormal patterns are not special-cased,
/// which matches how relu thresholds are encoded in pack configuration.
pub fn u16a_as_float(x: u32) -> f32 {
    let m = (x & 0x3ff) << 13;
    let e = (((x & 0x7c00) >> 10) + 112) << 23;
    let s = (x & 0x8000) << 16;
    f32::from_bits(s | e | m)
}

/// Float16_b bit pattern to float.
#[inline]
pub fn u16b_as_float(x: u32) -> f32 {
    f32::from_bits(x << 16)
}

#[inline]
pub fn u32_as_float(x: u32) -> f32 {
    f32::from_bits(x)
}

#[inline]
pub fn float_as_u32(x: f32) -> u32 {
    x.to_bits()
}
