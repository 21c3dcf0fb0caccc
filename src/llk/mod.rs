//! Reference LLK math engine.
//!
//! A software model of the tile math pipeline behind the compute API:
//!
//! ```text
//!   CB (L1) ──unpack──▶ src_a / src_b ──math──▶ dst[0..8] ──pack──▶ CB (L1)
//!                           │                      ▲
//!                           └──tilize/untilize──▶ block
//! ```
//!
//! Registers hold row-major 32x32 `f32` tiles. Unpack decodes the CB data
//! format and undoes face splitting; pack applies the optional relu filter,
//! splits into faces and encodes. The SFPU operations in [`sfpu`] work in
//! place on one DST tile.

pub mod pack_utils;
pub mod sfpu;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::device::cb::Cb;
use crate::device::memory::Memory;
use crate::error::{EmuError, Result};

pub use pack_utils::{TILE_DIM, TILE_SIZE};
pub use sfpu::{SfpuBinaryOp, SfpuUnaryOp};

use pack_utils::{faces_to_tile, get_raw_offset, pack_raw, pack_tile, tile_to_faces, u16a_as_float, unpack_tile};

/// Number of DST tile registers.
pub const DST_COUNT: usize = 8;

/// Tiles the tilize scratch block holds before growing.
const INITIAL_BLOCK_TILES: usize = 32;

// ============================================================================
// Operation selectors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReluType {
    #[default]
    NoRelu,
    MinThresholdRelu,
    MaxThresholdRelu,
}

/// How the B operand is spread over the tile during unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastType {
    None,
    /// Column 0 of B fills every column.
    Col,
    /// Row 0 of B fills every row.
    Row,
    /// Element 0 of B fills the tile.
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseBinaryType {
    Mul,
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolType {
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceDim {
    /// Reduce each row into column 0.
    Row,
    /// Reduce each column into row 0.
    Col,
    /// Reduce the whole tile into element 0.
    Scalar,
}

fn max_threshold_relu(x: f32, threshold: f32) -> f32 {
    if x > threshold {
        threshold
    } else if x < 0.0 {
        0.0
    } else {
        x
    }
}

fn add(a: f32, b: f32) -> f32 {
    a + b
}

fn min_threshold_relu(x: f32, threshold: f32) -> f32 {
    if x < threshold {
        0.0
    } else {
        x
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Math engine of one tile. Owned by the compute API of that tile.
pub struct Llk {
    l1: Arc<dyn Memory>,
    cb: Arc<dyn Cb>,
    src_a: Vec<f32>,
    src_b: Vec<f32>,
    dst: Vec<f32>,
    dst_valid: [bool; DST_COUNT],
    relu_mode: ReluType,
    relu_threshold: f32,
    /// face-layout staging between L1 and registers
    tile: Vec<f32>,
    temp: Vec<f32>,
    block: Vec<f32>,
}

impl Llk {
    pub fn new(l1: Arc<dyn Memory>, cb: Arc<dyn Cb>) -> Self {
        Self {
            l1,
            cb,
            src_a: vec![0.0; TILE_SIZE],
            src_b: vec![0.0; TILE_SIZE],
            dst: vec![0.0; DST_COUNT * TILE_SIZE],
            dst_valid: [false; DST_COUNT],
            relu_mode: ReluType::NoRelu,
            relu_threshold: 0.0,
            tile: vec![0.0; TILE_SIZE],
            temp: vec![0.0; TILE_SIZE],
            block: vec![0.0; INITIAL_BLOCK_TILES * TILE_SIZE],
        }
    }

    /// Clear per-kernel pack configuration.
    pub fn reset(&mut self) {
        self.relu_mode = ReluType::NoRelu;
        self.relu_threshold = 0.0;
    }

    /// Zero every DST tile and mark it invalid.
    pub fn acquire_dst(&mut self) {
        self.dst.fill(0.0);
        self.dst_valid = [false; DST_COUNT];
    }

    pub fn relu_mode(&self) -> ReluType {
        self.relu_mode
    }

    pub fn relu_threshold(&self) -> f32 {
        self.relu_threshold
    }

    /// Contents of one DST tile, row-major.
    pub fn dst_tile(&self, index: u32) -> Result<&[f32]> {
        let range = dst_range(index)?;
        Ok(&self.dst[range])
    }

    pub fn dst_tile_mut(&mut self, index: u32) -> Result<&mut [f32]> {
        let range = dst_range(index)?;
        Ok(&mut self.dst[range])
    }

    pub fn is_dst_valid(&self, index: u32) -> Result<bool> {
        dst_range(index)?;
        Ok(self.dst_valid[index as usize])
    }

    // ========================================================================
    // Pack
    // ========================================================================

    /// Write DST tile `dst_index` to the next tile slot of CB `output`.
    pub fn pack(&mut self, dst_index: u32, output: u32) -> Result<()> {
        let range = dst_range(dst_index)?;
        let threshold = self.relu_threshold;
        let filter: Option<fn(f32, f32) -> f32> = match self.relu_mode {
            ReluType::NoRelu => None,
            ReluType::MaxThresholdRelu => Some(max_threshold_relu),
            ReluType::MinThresholdRelu => Some(min_threshold_relu),
        };
        match filter {
            None => tile_to_faces(&self.dst[range], &mut self.tile),
            Some(f) => {
                for (t, &x) in self.temp.iter_mut().zip(&self.dst[range]) {
                    *t = f(x, threshold);
                }
                tile_to_faces(&self.temp, &mut self.tile);
            }
        }
        self.store_next_tile(output, &self.tile)
    }

    pub fn matmul_pack(&mut self, dst_index: u32, output: u32, ntiles: u32) -> Result<()> {
        for i in 0..ntiles {
            self.pack(dst_index + i, output)?;
        }
        Ok(())
    }

    /// Decode a packer relu configuration word.
    ///
    /// Bits 3:0 select the mode (0 none, 3 max threshold, anything else min
    /// threshold); bits 31:16 hold the threshold as a Float16 pattern.
    pub fn pack_relu_config(&mut self, config: u32) {
        self.relu_mode = match config & 0xf {
            0 => ReluType::NoRelu,
            3 => ReluType::MaxThresholdRelu,
            _ => ReluType::MinThresholdRelu,
        };
        self.relu_threshold = u16a_as_float(config >> 16);
        log::trace!("pack relu {:?} threshold {}", self.relu_mode, self.relu_threshold);
    }

    /// Pack tile `block_index` of the tilize block through DST 0.
    pub fn pack_block(&mut self, block_index: u32, output: u32) -> Result<()> {
        let from = block_range(block_index);
        self.check_block(&from)?;
        let (dst, block) = (&mut self.dst, &self.block);
        dst[..TILE_SIZE].copy_from_slice(&block[from]);
        self.pack(0, output)
    }

    /// Write tile `block_index` of the block as is, without face splitting.
    pub fn pack_block_raw(&mut self, block_index: u32, output: u32) -> Result<()> {
        let from = block_range(block_index);
        self.check_block(&from)?;
        self.store_next_tile(output, &self.block[from])
    }

    /// Write DST rows untilized into CB `output`.
    ///
    /// DST is read sequentially from tile 0, one 32-element row at a time,
    /// into the `block_c_index`-th column block of a row band that is
    /// `full_ct_dim` tiles wide.
    pub fn pack_untilize(
        &mut self,
        block_rt_dim: u32,
        output: u32,
        block_c_index: u32,
        block_ct_dim: u32,
        full_ct_dim: u32,
    ) -> Result<()> {
        self.pack_untilize_rows(0..block_rt_dim, output, block_c_index, block_ct_dim, full_ct_dim)
    }

    /// [`pack_untilize`](Self::pack_untilize) for a sub-range of tile rows.
    /// DST is still consumed from tile 0.
    pub(crate) fn pack_untilize_rows(
        &mut self,
        rows: Range<u32>,
        output: u32,
        block_c_index: u32,
        block_ct_dim: u32,
        full_ct_dim: u32,
    ) -> Result<()> {
        let tiles = (rows.end.saturating_sub(rows.start) * block_ct_dim) as usize;
        if tiles > DST_COUNT {
            return Err(EmuError::invariant(format!(
                "pack_untilize of {} tiles exceeds {} DST tiles",
                tiles, DST_COUNT
            )));
        }
        let df = self.cb.get_pack_dst_format(output)?;
        let base = self.cb.get_write_ptr(output)?;
        let offset = block_c_index * 32;
        let stride_rt = full_ct_dim * 1024;
        let stride_ct = 32;
        let stride_r = full_ct_dim * 32;

        let mut pos = 0;
        for block_rt in rows {
            for block_ct in 0..block_ct_dim {
                for r in 0..32 {
                    let index = offset + block_rt * stride_rt + block_ct * stride_ct + r * stride_r;
                    let bytes = pack_raw(df, &self.dst[pos..pos + TILE_DIM])?;
                    self.l1.write(base + get_raw_offset(df, index)?, &bytes)?;
                    pos += TILE_DIM;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Unpack
    // ========================================================================

    /// Load one tile of CB `operand` into src A, optionally transposed.
    pub fn unpack_a(&mut self, operand: u32, tile_index: u32, transpose: bool) -> Result<()> {
        self.load_tile(operand, tile_index)?;
        if !transpose {
            faces_to_tile(&self.tile, &mut self.src_a);
            return Ok(());
        }
        faces_to_tile(&self.tile, &mut self.temp);
        for h in 0..TILE_DIM {
            for w in 0..TILE_DIM {
                self.src_a[h * TILE_DIM + w] = self.temp[w * TILE_DIM + h];
            }
        }
        Ok(())
    }

    /// Load src A and src B, broadcasting B as requested.
    pub fn unpack_ab(
        &mut self,
        bcast: BroadcastType,
        operand_a: u32,
        operand_b: u32,
        tile_index_a: u32,
        tile_index_b: u32,
    ) -> Result<()> {
        self.load_tile(operand_a, tile_index_a)?;
        faces_to_tile(&self.tile, &mut self.src_a);

        self.load_tile(operand_b, tile_index_b)?;
        if bcast == BroadcastType::None {
            faces_to_tile(&self.tile, &mut self.src_b);
            return Ok(());
        }
        faces_to_tile(&self.tile, &mut self.temp);
        let b = &self.temp;
        for h in 0..TILE_DIM {
            for w in 0..TILE_DIM {
                self.src_b[h * TILE_DIM + w] = match bcast {
                    BroadcastType::Col => b[h * TILE_DIM],
                    BroadcastType::Row => b[w],
                    _ => b[0],
                };
            }
        }
        Ok(())
    }

    pub fn unpack_ab_matmul(
        &mut self,
        operand_a: u32,
        operand_b: u32,
        tile_index_a: u32,
        tile_index_b: u32,
    ) -> Result<()> {
        self.unpack_ab(BroadcastType::None, operand_a, operand_b, tile_index_a, tile_index_b)
    }

    // Position bookkeeping for tilize/untilize. A row band of `block`
    // 32x32 tiles stored untiled is `block * 32` elements wide. For an
    // element at tile t, row r, column c:
    //
    //     untiled offset  p = r * (block * 32) + t * 32 + c
    //     tiled offset    q = t * 1024 + r * 32 + c
    //
    // The untiled band arrives in 1024-element chunks, so chunk b element i
    // sits at p = b * 1024 + i.

    /// Tilize `block` untiled chunks of CB `icb` into the block buffer.
    pub fn unpack_tilize(&mut self, icb: u32, block: u32) -> Result<()> {
        self.reserve_block(block);
        let n = block as usize;
        for idst in 0..block {
            self.load_tile(icb, idst)?;
            let b = idst as usize * TILE_SIZE;
            for i in 0..TILE_SIZE {
                let mut p = b + i;
                let c = p % TILE_DIM;
                p /= TILE_DIM;
                let t = p % n;
                let r = p / n;
                self.block[t * TILE_SIZE + r * TILE_DIM + c] = self.tile[i];
            }
        }
        Ok(())
    }

    /// Untilize `block` tiles of CB `icb` into the block buffer.
    pub fn unpack_untilize(&mut self, icb: u32, block: u32) -> Result<()> {
        self.reserve_block(block);
        let width = block as usize * TILE_DIM;
        for idst in 0..block {
            self.load_tile(icb, idst)?;
            faces_to_tile(&self.tile, &mut self.src_a);
            for i in 0..TILE_SIZE {
                let r = i / TILE_DIM;
                let c = i % TILE_DIM;
                self.block[r * width + idst as usize * TILE_DIM + c] = self.src_a[i];
            }
        }
        Ok(())
    }

    // ========================================================================
    // Math
    // ========================================================================

    /// `dst = a op b`. Broadcasting already happened in unpack.
    pub fn math_eltwise_binary(&mut self, op: EltwiseBinaryType, _bcast: BroadcastType, dst_index: u32) -> Result<()> {
        let range = dst_range(dst_index)?;
        let dst = &mut self.dst[range];
        let pairs = self.src_a.iter().zip(&self.src_b);
        match op {
            EltwiseBinaryType::Mul => dst.iter_mut().zip(pairs).for_each(|(d, (a, b))| *d = a * b),
            EltwiseBinaryType::Add => dst.iter_mut().zip(pairs).for_each(|(d, (a, b))| *d = a + b),
            EltwiseBinaryType::Sub => dst.iter_mut().zip(pairs).for_each(|(d, (a, b))| *d = a - b),
        }
        self.dst_valid[dst_index as usize] = true;
        Ok(())
    }

    pub fn math_eltwise_unary_datacopy(&mut self, dst_index: u32) -> Result<()> {
        let range = dst_range(dst_index)?;
        self.dst[range].copy_from_slice(&self.src_a);
        self.dst_valid[dst_index as usize] = true;
        Ok(())
    }

    /// `dst += a x b`, or `a x b^T` when `transpose` is set.
    pub fn math_matmul(&mut self, dst_index: u32, transpose: bool) -> Result<()> {
        let range = dst_range(dst_index)?;
        let (a, b) = (&self.src_a, &self.src_b);
        let dst = &mut self.dst[range];
        for h in 0..TILE_DIM {
            for w in 0..TILE_DIM {
                let mut acc = 0.0f32;
                for d in 0..TILE_DIM {
                    let bv = if transpose { b[w * TILE_DIM + d] } else { b[d * TILE_DIM + w] };
                    acc += a[h * TILE_DIM + d] * bv;
                }
                dst[h * TILE_DIM + w] += acc;
            }
        }
        self.dst_valid[dst_index as usize] = true;
        Ok(())
    }

    /// Reduce src A into DST, scaled by element 0 of src B.
    ///
    /// Sums accumulate into DST. Max keeps a running maximum; an invalid DST
    /// tile is first filled with the lowest finite float.
    pub fn math_reduce(&mut self, pool: PoolType, dim: ReduceDim, dst_index: u32) -> Result<()> {
        let range = dst_range(dst_index)?;
        let valid = self.dst_valid[dst_index as usize];
        let a = &self.src_a;
        let scaler = self.src_b[0];
        let dst = &mut self.dst[range];

        let (init, combine): (f32, fn(f32, f32) -> f32) = match pool {
            PoolType::Sum => (0.0, add as fn(f32, f32) -> f32),
            PoolType::Max => (f32::MIN, f32::max as fn(f32, f32) -> f32),
        };
        let store = |slot: &mut f32, acc: f32| match pool {
            PoolType::Sum => *slot += scaler * acc,
            PoolType::Max => *slot = slot.max(scaler * acc),
        };

        if pool == PoolType::Max && !valid {
            dst.fill(f32::MIN);
        }
        match dim {
            ReduceDim::Row => {
                for h in 0..TILE_DIM {
                    let acc = a[h * TILE_DIM..(h + 1) * TILE_DIM].iter().fold(init, |acc, &x| combine(acc, x));
                    store(&mut dst[h * TILE_DIM], acc);
                }
            }
            ReduceDim::Col => {
                for w in 0..TILE_DIM {
                    let acc = (0..TILE_DIM).fold(init, |acc, h| combine(acc, a[h * TILE_DIM + w]));
                    store(&mut dst[w], acc);
                }
            }
            ReduceDim::Scalar => {
                let acc = a.iter().fold(init, |acc, &x| combine(acc, x));
                store(&mut dst[0], acc);
            }
        }
        self.dst_valid[dst_index as usize] = true;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Decode tile `tile_index` of CB `operand` at its read pointer into the
    /// staging tile. Layout is left as stored.
    fn load_tile(&mut self, operand: u32, tile_index: u32) -> Result<()> {
        let df = self.cb.get_unpack_src_format(operand)?;
        let addr = self.cb.get_read_ptr(operand)? + self.cb.get_tile_size(operand)? * tile_index;
        let mut bytes = vec![0u8; pack_utils::element_size(df)? * TILE_SIZE];
        self.l1.read(addr, &mut bytes)?;
        unpack_tile(df, &bytes, &mut self.tile)
    }

    /// Encode `data` into the next tile slot of CB `output`.
    fn store_next_tile(&self, output: u32, data: &[f32]) -> Result<()> {
        let df = self.cb.get_pack_dst_format(output)?;
        let slot = self.cb.get_write_tile_ptr(output)?;
        let addr = self.cb.get_write_ptr(output)? + slot * self.cb.get_tile_size(output)?;
        self.cb.incr_write_tile_ptr(output, 1)?;
        let bytes = pack_tile(df, data)?;
        self.l1.write(addr, &bytes)
    }

    fn reserve_block(&mut self, tiles: u32) {
        let size = tiles as usize * TILE_SIZE;
        if self.block.len() < size {
            self.block.resize(size, 0.0);
        }
    }

    fn check_block(&self, range: &Range<usize>) -> Result<()> {
        if range.end > self.block.len() {
            return Err(EmuError::invariant(format!(
                "block tile {} is past the tilize block",
                range.start / TILE_SIZE
            )));
        }
        Ok(())
    }
}

fn dst_range(index: u32) -> Result<Range<usize>> {
    let index = index as usize;
    if index >= DST_COUNT {
        return Err(EmuError::invariant(format!("DST index {} out of range (max {})", index, DST_COUNT - 1)));
    }
    Ok(index * TILE_SIZE..(index + 1) * TILE_SIZE)
}

fn block_range(index: u32) -> Range<usize> {
    let index = index as usize;
    index * TILE_SIZE..(index + 1) * TILE_SIZE
}

impl fmt::Debug for Llk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Llk")
            .field("relu_mode", &self.relu_mode)
            .field("relu_threshold", &self.relu_threshold)
            .field("dst_valid", &self.dst_valid)
            .field("block_tiles", &(self.block.len() / TILE_SIZE))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cb::CbEngine;
    use crate::device::format::DataFormat;
    use crate::device::memory::MemoryBank;
    use crate::schedule::Scheduler;

    const CB_IN0: u32 = 0;
    const CB_IN1: u32 = 1;
    const CB_OUT: u32 = 16;

    struct Fixture {
        l1: Arc<MemoryBank>,
        cb: Arc<CbEngine>,
        llk: Llk,
    }

    /// Three 8-tile Float32 channels at 64K, 128K and 192K.
    fn fixture() -> Fixture {
        let l1 = Arc::new(MemoryBank::new("l1", 1024 * 1024));
        let cb = Arc::new(CbEngine::new(Arc::new(Scheduler::new())));
        for (i, id) in [CB_IN0, CB_IN1, CB_OUT].into_iter().enumerate() {
            let addr = (64 * 1024 * (i as u32 + 1)) >> 4;
            cb.setup_read_write_interfaces(id, addr, 8 * 256, 8, 256).unwrap();
        }
        let llk = Llk::new(l1.clone(), cb.clone());
        Fixture { l1, cb, llk }
    }

    /// Store a row-major tile in face layout at tile slot `index` of `cb_id`.
    fn put_tile(f: &Fixture, cb_id: u32, index: u32, tile: &[f32]) {
        let mut faces = vec![0.0; TILE_SIZE];
        tile_to_faces(tile, &mut faces);
        let addr = f.cb.get_read_ptr(cb_id).unwrap() + index * 4096;
        f.l1.write_f32_slice(addr, &faces).unwrap();
    }

    /// Read back a packed tile from slot `index` of `cb_id` as row-major.
    fn get_tile(f: &Fixture, cb_id: u32, index: u32) -> Vec<f32> {
        let addr = f.cb.get_write_ptr(cb_id).unwrap() + index * 4096;
        let faces = f.l1.read_f32_slice(addr, TILE_SIZE).unwrap();
        let mut tile = vec![0.0; TILE_SIZE];
        faces_to_tile(&faces, &mut tile);
        tile
    }

    fn pattern(seed: f32) -> Vec<f32> {
        (0..TILE_SIZE).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.25 + seed).collect()
    }

    #[test]
    fn test_dst_index_out_of_range() {
        let mut f = fixture();
        let err = f.llk.math_eltwise_unary_datacopy(8).unwrap_err();
        assert!(matches!(err, EmuError::InvariantViolation(_)));
        assert!(f.llk.pack(9, CB_OUT).is_err());
    }

    #[test]
    fn test_copy_and_pack_round_trip() {
        let mut f = fixture();
        let a = pattern(1.0);
        put_tile(&f, CB_IN0, 2, &a);

        f.llk.acquire_dst();
        f.llk.unpack_a(CB_IN0, 2, false).unwrap();
        f.llk.math_eltwise_unary_datacopy(3).unwrap();
        assert!(f.llk.is_dst_valid(3).unwrap());
        f.llk.pack(3, CB_OUT).unwrap();
        f.llk.pack(3, CB_OUT).unwrap();

        assert_eq!(f.cb.get_write_tile_ptr(CB_OUT).unwrap(), 2);
        assert_eq!(get_tile(&f, CB_OUT, 0), a);
        assert_eq!(get_tile(&f, CB_OUT, 1), a);
    }

    #[test]
    fn test_transpose_unpack() {
        let mut f = fixture();
        let a: Vec<f32> = (0..TILE_SIZE).map(|i| i as f32).collect();
        put_tile(&f, CB_IN0, 0, &a);

        f.llk.acquire_dst();
        f.llk.unpack_a(CB_IN0, 0, true).unwrap();
        f.llk.math_eltwise_unary_datacopy(0).unwrap();
        let d = f.llk.dst_tile(0).unwrap();
        assert_eq!(d[1], 32.0);
        assert_eq!(d[32], 1.0);
        assert_eq!(d[5 * 32 + 7], (7 * 32 + 5) as f32);
    }

    #[test]
    fn test_matmul_matches_reference() {
        let mut f = fixture();
        let a = pattern(0.5);
        let b = pattern(-0.25);
        put_tile(&f, CB_IN0, 0, &a);
        put_tile(&f, CB_IN1, 0, &b);

        f.llk.acquire_dst();
        // accumulate twice to check dst += a x b
        for _ in 0..2 {
            f.llk.unpack_ab_matmul(CB_IN0, CB_IN1, 0, 0).unwrap();
            f.llk.math_matmul(1, false).unwrap();
        }
        let d = f.llk.dst_tile(1).unwrap();
        for h in [0, 7, 31] {
            for w in [0, 13, 31] {
                let mut expected = 0.0f32;
                for k in 0..TILE_DIM {
                    expected += a[h * 32 + k] * b[k * 32 + w];
                }
                let got = d[h * 32 + w];
                assert!((got - 2.0 * expected).abs() < 1e-3, "({}, {}): {} vs {}", h, w, got, 2.0 * expected);
            }
        }

        f.llk.acquire_dst();
        f.llk.unpack_ab_matmul(CB_IN0, CB_IN1, 0, 0).unwrap();
        f.llk.math_matmul(0, true).unwrap();
        let mut expected = 0.0f32;
        for k in 0..TILE_DIM {
            expected += a[3 * 32 + k] * b[5 * 32 + k];
        }
        assert!((f.llk.dst_tile(0).unwrap()[3 * 32 + 5] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_broadcast_binary() {
        let mut f = fixture();
        let a = vec![1.0; TILE_SIZE];
        let b: Vec<f32> = (0..TILE_SIZE).map(|i| i as f32).collect();
        put_tile(&f, CB_IN0, 0, &a);
        put_tile(&f, CB_IN1, 0, &b);

        f.llk.acquire_dst();
        f.llk.unpack_ab(BroadcastType::Col, CB_IN0, CB_IN1, 0, 0).unwrap();
        f.llk.math_eltwise_binary(EltwiseBinaryType::Add, BroadcastType::Col, 0).unwrap();
        f.llk.unpack_ab(BroadcastType::Row, CB_IN0, CB_IN1, 0, 0).unwrap();
        f.llk.math_eltwise_binary(EltwiseBinaryType::Mul, BroadcastType::Row, 1).unwrap();
        f.llk.unpack_ab(BroadcastType::Scalar, CB_IN0, CB_IN1, 0, 0).unwrap();
        f.llk.math_eltwise_binary(EltwiseBinaryType::Sub, BroadcastType::Scalar, 2).unwrap();

        // column broadcast: b[h * 32]
        assert_eq!(f.llk.dst_tile(0).unwrap()[2 * 32 + 9], 1.0 + 64.0);
        // row broadcast: b[w]
        assert_eq!(f.llk.dst_tile(1).unwrap()[2 * 32 + 9], 9.0);
        // scalar: b[0]
        assert_eq!(f.llk.dst_tile(2).unwrap()[700], 1.0);
    }

    #[test]
    fn test_reduce_sum_and_max() {
        let mut f = fixture();
        let a: Vec<f32> = (0..TILE_SIZE).map(|i| (i % 32) as f32).collect();
        let mut scaler = vec![0.0; TILE_SIZE];
        scaler[0] = 0.5;
        put_tile(&f, CB_IN0, 0, &a);
        put_tile(&f, CB_IN1, 0, &scaler);

        f.llk.acquire_dst();
        f.llk.unpack_ab(BroadcastType::None, CB_IN0, CB_IN1, 0, 0).unwrap();
        f.llk.math_reduce(PoolType::Sum, ReduceDim::Row, 0).unwrap();
        f.llk.math_reduce(PoolType::Sum, ReduceDim::Col, 1).unwrap();
        f.llk.math_reduce(PoolType::Sum, ReduceDim::Scalar, 2).unwrap();
        f.llk.math_reduce(PoolType::Max, ReduceDim::Row, 3).unwrap();

        // each row sums 0..31 = 496
        assert_eq!(f.llk.dst_tile(0).unwrap()[5 * 32], 248.0);
        assert_eq!(f.llk.dst_tile(0).unwrap()[5 * 32 + 1], 0.0);
        // column w sums to 32 * w
        assert_eq!(f.llk.dst_tile(1).unwrap()[3], 0.5 * 96.0);
        assert_eq!(f.llk.dst_tile(2).unwrap()[0], 0.5 * 496.0 * 32.0);

        let max = f.llk.dst_tile(3).unwrap();
        assert_eq!(max[4 * 32], 15.5);
        // untouched elements keep the fill value
        assert_eq!(max[1], f32::MIN);
    }

    #[test]
    fn test_relu_pack_filters() {
        let mut f = fixture();
        let tile: Vec<f32> = (0..TILE_SIZE).map(|i| i as f32 - 512.0).collect();
        f.llk.acquire_dst();
        f.llk.dst_tile_mut(0).unwrap().copy_from_slice(&tile);

        // max threshold 2.0 (Float16 0x4000)
        f.llk.pack_relu_config(0x4000_0003);
        assert_eq!(f.llk.relu_mode(), ReluType::MaxThresholdRelu);
        f.llk.pack(0, CB_OUT).unwrap();

        // min threshold 2.0
        f.llk.pack_relu_config(0x4000_0001);
        assert_eq!(f.llk.relu_mode(), ReluType::MinThresholdRelu);
        f.llk.pack(0, CB_OUT).unwrap();

        let max = get_tile(&f, CB_OUT, 0);
        assert_eq!(max[0], 0.0);
        assert_eq!(max[513], 1.0);
        assert_eq!(max[600], 2.0);

        let min = get_tile(&f, CB_OUT, 1);
        assert_eq!(min[513], 0.0);
        assert_eq!(min[514], 2.0);
        assert_eq!(min[600], 88.0);

        f.llk.reset();
        assert_eq!(f.llk.relu_mode(), ReluType::NoRelu);
    }

    #[test]
    fn test_untilize_then_tilize_is_identity() {
        let mut f = fixture();
        let tiles: Vec<Vec<f32>> = (0..3).map(|t| pattern(t as f32 * 10.0)).collect();
        for (i, t) in tiles.iter().enumerate() {
            put_tile(&f, CB_IN0, i as u32, t);
        }

        // untilize three tiles into CB_IN1 as a raw row band
        f.llk.unpack_untilize(CB_IN0, 3).unwrap();
        for i in 0..3 {
            f.llk.pack_block_raw(i, CB_IN1).unwrap();
        }
        // row 1 of the band starts with row 1 of tile 0, then tile 1
        let band = f.l1.read_f32_slice(f.cb.get_write_ptr(CB_IN1).unwrap(), 3 * TILE_SIZE).unwrap();
        assert_eq!(band[96], tiles[0][32]);
        assert_eq!(band[96 + 32], tiles[1][32]);

        // and back
        f.llk.unpack_tilize(CB_IN1, 3).unwrap();
        for i in 0..3 {
            f.llk.pack_block(i, CB_OUT).unwrap();
        }
        for (i, t) in tiles.iter().enumerate() {
            assert_eq!(&get_tile(&f, CB_OUT, i as u32), t);
        }
    }

    #[test]
    fn test_pack_untilize_rows() {
        let mut f = fixture();
        f.llk.acquire_dst();
        for t in 0..2 {
            let tile: Vec<f32> = (0..TILE_SIZE).map(|i| (t * 10_000 + i) as f32).collect();
            f.llk.dst_tile_mut(t as u32).unwrap().copy_from_slice(&tile);
        }
        // two tiles of one row, second column block of a 4-tile-wide band
        f.llk.pack_untilize(1, CB_OUT, 2, 2, 4).unwrap();
        let base = f.cb.get_write_ptr(CB_OUT).unwrap();
        let row_bytes = 4 * 32 * 4;
        let read = |row: u32, col: u32| f.l1.read_f32(base + row * row_bytes + col * 4).unwrap();
        assert_eq!(read(0, 64), 0.0);
        assert_eq!(read(0, 96), 10_000.0);
        assert_eq!(read(3, 64 + 5), (3 * 32 + 5) as f32);
        assert_eq!(read(0, 0), 0.0);

        assert!(f.llk.pack_untilize(3, CB_OUT, 0, 3, 3).is_err());
    }

    #[test]
    fn test_float16b_channels() {
        let mut f = fixture();
        for id in [CB_IN0, CB_OUT] {
            f.cb.setup_data_formats(id, DataFormat::Float16B, DataFormat::Float16B, DataFormat::Float16B, DataFormat::Float16B)
                .unwrap();
        }
        let faces: Vec<u32> = (0..TILE_SIZE / 2).map(|_| 0x3f80_3f80).collect();
        f.l1.write_u32_slice(f.cb.get_read_ptr(CB_IN0).unwrap() + 2048, &faces).unwrap();

        f.llk.acquire_dst();
        f.llk.unpack_a(CB_IN0, 1, false).unwrap();
        f.llk.math_eltwise_unary_datacopy(0).unwrap();
        assert!(f.llk.dst_tile(0).unwrap().iter().all(|&x| x == 1.0));

        f.llk.pack(0, CB_OUT).unwrap();
        f.llk.pack(0, CB_OUT).unwrap();
        let base = f.cb.get_write_ptr(CB_OUT).unwrap();
        assert_eq!(f.l1.read_u32(base + 2048).unwrap(), 0x3f80_3f80);
    }
}
