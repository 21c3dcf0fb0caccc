//! Compute API: what math kernels on TRISC call.
//!
//! Each call is a fixed unpack/math/pack sequence on the tile's [`Llk`]
//! engine. Configuration calls (`*_init`, `*_uninit`, data format
//! reconfiguration) have no effect on a functional model and all go through
//! [`Compute::init_op`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::base_addr::{self, RiscKind};
use crate::device::cb::Cb;
use crate::device::memory::Memory;
use crate::error::{EmuError, Result};
use crate::llk::{BroadcastType, EltwiseBinaryType, Llk, PoolType, ReduceDim, SfpuBinaryOp, SfpuUnaryOp, DST_COUNT};

/// Hardware configuration calls a compute kernel may issue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitOp {
    BinaryOpCommon { icb0: u32, icb1: u32, ocb: u32 },
    UnaryOpCommon { icb: u32 },
    EltwiseBinary { op: EltwiseBinaryType, icb0: u32, icb1: u32, acc_to_dest: bool },
    Bcast { op: EltwiseBinaryType, dim: BroadcastType, icb0: u32, icb1: u32, ocb: u32 },
    Matmul { icb0: u32, icb1: u32, ocb: u32, transpose: bool },
    MatmulBlock { icb0: u32, icb1: u32, ocb: u32, transpose: bool, ct_dim: u32, rt_dim: u32, kt_dim: u32 },
    Reduce { pool: PoolType, dim: ReduceDim, icb: u32, icb_scaler: u32, ocb: u32 },
    ReduceRevert { dim: ReduceDim, ocb: u32 },
    CopyTile { icb: u32, transpose: bool },
    TransposeWh { icb: u32, ocb: u32 },
    Tilize { icb: u32, block: u32, ocb: u32 },
    Untilize { icb: u32, ocb: u32 },
    PackUntilize { icb: u32, ocb: u32, block_ct_dim: u32 },
    PackUntilizeDst { ocb: u32, block_ct_dim: u32, full_ct_dim: u32 },
    Uninit { cb: u32 },
    Sfpu(SfpuUnaryOp),
    PackReconfig { ocb: u32 },
    UnpackReconfig { icb_a: u32, icb_b: u32 },
}

/// Kernel-facing compute interface.
///
/// Required methods map onto the math engine; the named tile operations
/// are provided on top of them.
pub trait Compute: Send + Sync + fmt::Debug {
    /// Prepare for a new kernel.
    fn reset(&self);

    fn get_arg_uint32(&self, arg_idx: u32) -> Result<u32>;

    /// Configuration call. No state changes.
    fn init_op(&self, op: InitOp) -> Result<()> {
        log::trace!("compute init {:?}", op);
        Ok(())
    }

    // ========================================================================
    // DST registers
    // ========================================================================

    fn acquire_dst(&self) -> Result<()>;

    fn tile_regs_acquire(&self) -> Result<()> {
        self.acquire_dst()
    }

    fn tile_regs_wait(&self) -> Result<()> {
        Ok(())
    }

    fn tile_regs_commit(&self) -> Result<()> {
        Ok(())
    }

    fn tile_regs_release(&self) -> Result<()> {
        Ok(())
    }

    fn release_dst(&self) -> Result<()> {
        Ok(())
    }

    // ========================================================================
    // Circular buffers
    // ========================================================================

    fn cb_wait_front(&self, cb_id: u32, ntiles: u32) -> Result<()>;
    fn cb_pop_front(&self, cb_id: u32, ntiles: u32) -> Result<()>;
    fn cb_reserve_back(&self, cb_id: u32, ntiles: u32) -> Result<()>;
    fn cb_push_back(&self, cb_id: u32, ntiles: u32) -> Result<()>;

    // ========================================================================
    // Pack
    // ========================================================================

    /// Pack DST tile `idst` to the next slot of `ocb`. Output is always in
    /// order.
    fn pack_tile(&self, idst: u32, ocb: u32) -> Result<()>;
    fn matmul_pack_tile(&self, idst: u32, ocb: u32, ntiles: u32) -> Result<()>;
    fn pack_relu_config(&self, config: u32) -> Result<()>;

    // ========================================================================
    // Unpack + math
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn any_tiles_bcast(
        &self,
        op: EltwiseBinaryType,
        dim: BroadcastType,
        icb0: u32,
        icb1: u32,
        itile0: u32,
        itile1: u32,
        idst: u32,
    ) -> Result<()>;

    fn matmul_tiles(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32, transpose: bool) -> Result<()>;

    /// `rt_dim x ct_dim` output tiles from an `rt_dim x kt_dim` block of
    /// `icb0` and the matching columns of `icb1`.
    #[allow(clippy::too_many_arguments)]
    fn matmul_block(
        &self,
        icb0: u32,
        icb1: u32,
        itile0: u32,
        itile1: u32,
        idst: u32,
        transpose: bool,
        ct_dim: u32,
        rt_dim: u32,
        kt_dim: u32,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn reduce_tile(
        &self,
        pool: PoolType,
        dim: ReduceDim,
        icb0: u32,
        icb1: u32,
        itile0: u32,
        itile1: u32,
        idst: u32,
    ) -> Result<()>;

    fn copy_tile(&self, icb: u32, itile: u32, idst: u32) -> Result<()>;
    fn copy_block_matmul_partials(&self, icb: u32, start_itile: u32, start_idst: u32, ntiles: u32) -> Result<()>;
    fn transpose_wh_tile(&self, icb: u32, itile: u32, idst: u32) -> Result<()>;

    /// Tilize `block` untiled chunks from `icb` into `block` tiles of `ocb`.
    fn tilize_block(&self, icb: u32, block: u32, ocb: u32) -> Result<()>;

    /// Untilize `block` tiles from `icb` into a raw row band in `ocb`.
    fn untilize_block(&self, icb: u32, block: u32, ocb: u32) -> Result<()>;

    /// Untilize `block_rt_dim` rows of `block_ct_dim` tiles each through DST.
    fn pack_untilize_block(&self, icb: u32, block_rt_dim: u32, ocb: u32, block_ct_dim: u32) -> Result<()>;

    /// Untilize what already sits in DST into column block `block_c_index`
    /// of a band `full_ct_dim` tiles wide.
    fn pack_untilize_dst(
        &self,
        ocb: u32,
        block_rt_dim: u32,
        block_c_index: u32,
        block_ct_dim: u32,
        full_ct_dim: u32,
    ) -> Result<()>;

    // ========================================================================
    // SFPU
    // ========================================================================

    fn sfpu_tile(&self, op: SfpuUnaryOp, idst: u32) -> Result<()>;
    fn binop_tile(&self, op: SfpuBinaryOp, idst0: u32, idst1: u32) -> Result<()>;
    fn copy_dest_values(&self, idst0: u32, idst1: u32) -> Result<()>;
    fn max_tile(&self, idst0: u32, idst1: u32) -> Result<()>;
    fn typecast_tile(&self, in_dtype: u32, out_dtype: u32, idst: u32) -> Result<()>;

    // ========================================================================
    // Named tile operations
    // ========================================================================

    fn add_tiles(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.any_tiles_bcast(EltwiseBinaryType::Add, BroadcastType::None, icb0, icb1, itile0, itile1, idst)
    }

    fn sub_tiles(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.any_tiles_bcast(EltwiseBinaryType::Sub, BroadcastType::None, icb0, icb1, itile0, itile1, idst)
    }

    fn mul_tiles(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.any_tiles_bcast(EltwiseBinaryType::Mul, BroadcastType::None, icb0, icb1, itile0, itile1, idst)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_tiles_bcast(&self, dim: BroadcastType, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.any_tiles_bcast(EltwiseBinaryType::Add, dim, icb0, icb1, itile0, itile1, idst)
    }

    #[allow(clippy::too_many_arguments)]
    fn sub_tiles_bcast(&self, dim: BroadcastType, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.any_tiles_bcast(EltwiseBinaryType::Sub, dim, icb0, icb1, itile0, itile1, idst)
    }

    #[allow(clippy::too_many_arguments)]
    fn mul_tiles_bcast(&self, dim: BroadcastType, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.any_tiles_bcast(EltwiseBinaryType::Mul, dim, icb0, icb1, itile0, itile1, idst)
    }

    fn add_tiles_bcast_rows(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.add_tiles_bcast(BroadcastType::Row, icb0, icb1, itile0, itile1, idst)
    }

    fn add_tiles_bcast_cols(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.add_tiles_bcast(BroadcastType::Col, icb0, icb1, itile0, itile1, idst)
    }

    fn sub_tiles_bcast_cols(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.sub_tiles_bcast(BroadcastType::Col, icb0, icb1, itile0, itile1, idst)
    }

    fn mul_tiles_bcast_rows(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.mul_tiles_bcast(BroadcastType::Row, icb0, icb1, itile0, itile1, idst)
    }

    fn mul_tiles_bcast_cols(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.mul_tiles_bcast(BroadcastType::Col, icb0, icb1, itile0, itile1, idst)
    }

    fn mul_tiles_bcast_scalar(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32) -> Result<()> {
        self.mul_tiles_bcast(BroadcastType::Scalar, icb0, icb1, itile0, itile1, idst)
    }

    fn rsqrt_tile(&self, idst: u32, _fast_and_approx: bool) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Rsqrt, idst)
    }

    fn sigmoid_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Sigmoid, idst)
    }

    fn log_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Log, idst)
    }

    fn log_with_base_tile(&self, idst: u32, base_scale: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::LogWithBase(base_scale), idst)
    }

    fn tanh_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Tanh, idst)
    }

    fn signbit_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Signbit, idst)
    }

    fn abs_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Abs, idst)
    }

    fn sign_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Sign, idst)
    }

    fn square_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Square, idst)
    }

    fn ltz_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Ltz, idst)
    }

    fn eqz_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Eqz, idst)
    }

    fn lez_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Lez, idst)
    }

    fn gtz_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Gtz, idst)
    }

    fn nez_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Nez, idst)
    }

    fn gez_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Gez, idst)
    }

    fn power_tile(&self, idst: u32, power: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Power(power), idst)
    }

    fn exp2_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Exp2, idst)
    }

    fn heaviside_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Heaviside(param0), idst)
    }

    fn expm1_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Expm1, idst)
    }

    fn asin_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Asin, idst)
    }

    fn atan_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Atan, idst)
    }

    fn acos_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Acos, idst)
    }

    fn add_unary_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::AddScalar(param0), idst)
    }

    fn sub_unary_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::SubScalar(param0), idst)
    }

    fn mul_unary_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::MulScalar(param0), idst)
    }

    fn div_unary_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::DivScalar(param0), idst)
    }

    fn rsub_unary_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::RsubScalar(param0), idst)
    }

    fn ceil_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Ceil, idst)
    }

    fn ceil_tile_float32(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::CeilFloat32, idst)
    }

    fn elu_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Elu(param0), idst)
    }

    fn erf_tile(&self, idst: u32, _fast_and_approx: bool) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Erf, idst)
    }

    fn erfc_tile(&self, idst: u32, _fast_and_approx: bool) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Erfc, idst)
    }

    fn erfinv_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Erfinv, idst)
    }

    fn exp_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Exp, idst)
    }

    fn fill_tile_bitcast(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::FillBitcast(param0), idst)
    }

    fn floor_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Floor, idst)
    }

    fn floor_tile_float32(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::FloorFloat32, idst)
    }

    fn gelu_tile(&self, idst: u32, _fast_and_approx: bool) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Gelu, idst)
    }

    fn i0_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::I0, idst)
    }

    fn isinf_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Isinf, idst)
    }

    fn isposinf_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Isposinf, idst)
    }

    fn isneginf_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Isneginf, idst)
    }

    fn isnan_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Isnan, idst)
    }

    fn isfinite_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Isfinite, idst)
    }

    fn logical_not_unary_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::LogicalNot, idst)
    }

    fn recip_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Reciprocal, idst)
    }

    fn relu_max_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::ReluMax(param0), idst)
    }

    fn relu_min_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::ReluMin(param0), idst)
    }

    fn relu_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Relu, idst)
    }

    fn leaky_relu_tile(&self, idst: u32, param0: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::LeakyRelu(param0), idst)
    }

    fn sqrt_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Sqrt, idst)
    }

    fn sin_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Sin, idst)
    }

    fn cos_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Cos, idst)
    }

    fn tan_tile(&self, idst: u32) -> Result<()> {
        self.sfpu_tile(SfpuUnaryOp::Tan, idst)
    }
}

/// Reference compute implementation for the TRISC of one tile.
pub struct ComputeImpl {
    l1: Arc<dyn Memory>,
    cb: Arc<dyn Cb>,
    llk: Mutex<Llk>,
}

impl ComputeImpl {
    pub fn new(l1: Arc<dyn Memory>, cb: Arc<dyn Cb>) -> Self {
        let llk = Llk::new(Arc::clone(&l1), Arc::clone(&cb));
        Self { l1, cb, llk: Mutex::new(llk) }
    }

    /// Math engine state, for inspection.
    pub fn llk(&self) -> MutexGuard<'_, Llk> {
        self.llk.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Compute for ComputeImpl {
    fn reset(&self) {
        self.llk().reset();
    }

    fn get_arg_uint32(&self, arg_idx: u32) -> Result<u32> {
        let base = base_addr::arg_base(self.l1.as_ref(), RiscKind::Trisc)?;
        self.l1.read_u32(base + 4 * arg_idx)
    }

    fn acquire_dst(&self) -> Result<()> {
        self.llk().acquire_dst();
        Ok(())
    }

    fn cb_wait_front(&self, cb_id: u32, ntiles: u32) -> Result<()> {
        self.cb.cb_wait_front(cb_id, ntiles)
    }

    fn cb_pop_front(&self, cb_id: u32, ntiles: u32) -> Result<()> {
        self.cb.cb_pop_front(cb_id, ntiles)
    }

    fn cb_reserve_back(&self, cb_id: u32, ntiles: u32) -> Result<()> {
        self.cb.cb_reserve_back(cb_id, ntiles)
    }

    fn cb_push_back(&self, cb_id: u32, ntiles: u32) -> Result<()> {
        self.cb.cb_push_back(cb_id, ntiles)
    }

    fn pack_tile(&self, idst: u32, ocb: u32) -> Result<()> {
        self.llk().pack(idst, ocb)
    }

    fn matmul_pack_tile(&self, idst: u32, ocb: u32, ntiles: u32) -> Result<()> {
        self.llk().matmul_pack(idst, ocb, ntiles)
    }

    fn pack_relu_config(&self, config: u32) -> Result<()> {
        self.llk().pack_relu_config(config);
        Ok(())
    }

    fn any_tiles_bcast(
        &self,
        op: EltwiseBinaryType,
        dim: BroadcastType,
        icb0: u32,
        icb1: u32,
        itile0: u32,
        itile1: u32,
        idst: u32,
    ) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_ab(dim, icb0, icb1, itile0, itile1)?;
        llk.math_eltwise_binary(op, dim, idst)
    }

    fn matmul_tiles(&self, icb0: u32, icb1: u32, itile0: u32, itile1: u32, idst: u32, transpose: bool) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_ab_matmul(icb0, icb1, itile0, itile1)?;
        llk.math_matmul(idst, transpose)
    }

    fn matmul_block(
        &self,
        icb0: u32,
        icb1: u32,
        itile0: u32,
        itile1: u32,
        idst: u32,
        transpose: bool,
        ct_dim: u32,
        rt_dim: u32,
        kt_dim: u32,
    ) -> Result<()> {
        let mut llk = self.llk();
        for rt in 0..rt_dim {
            for ct in 0..ct_dim {
                llk.unpack_ab_matmul(icb0, icb1, itile0 + rt * kt_dim, itile1 + ct)?;
                llk.math_matmul(idst + rt * ct_dim + ct, transpose)?;
            }
        }
        Ok(())
    }

    fn reduce_tile(
        &self,
        pool: PoolType,
        dim: ReduceDim,
        icb0: u32,
        icb1: u32,
        itile0: u32,
        itile1: u32,
        idst: u32,
    ) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_ab(BroadcastType::None, icb0, icb1, itile0, itile1)?;
        llk.math_reduce(pool, dim, idst)
    }

    fn copy_tile(&self, icb: u32, itile: u32, idst: u32) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_a(icb, itile, false)?;
        llk.math_eltwise_unary_datacopy(idst)
    }

    fn copy_block_matmul_partials(&self, icb: u32, start_itile: u32, start_idst: u32, ntiles: u32) -> Result<()> {
        let mut llk = self.llk();
        for i in 0..ntiles {
            llk.unpack_a(icb, start_itile + i, false)?;
            llk.math_eltwise_unary_datacopy(start_idst + i)?;
        }
        Ok(())
    }

    fn transpose_wh_tile(&self, icb: u32, itile: u32, idst: u32) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_a(icb, itile, true)?;
        llk.math_eltwise_unary_datacopy(idst)
    }

    fn tilize_block(&self, icb: u32, block: u32, ocb: u32) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_tilize(icb, block)?;
        for i in 0..block {
            llk.pack_block(i, ocb)?;
        }
        Ok(())
    }

    fn untilize_block(&self, icb: u32, block: u32, ocb: u32) -> Result<()> {
        let mut llk = self.llk();
        llk.unpack_untilize(icb, block)?;
        for i in 0..block {
            llk.pack_block_raw(i, ocb)?;
        }
        Ok(())
    }

    fn pack_untilize_block(&self, icb: u32, block_rt_dim: u32, ocb: u32, block_ct_dim: u32) -> Result<()> {
        if block_ct_dim as usize > DST_COUNT {
            return Err(EmuError::invariant(format!(
                "pack_untilize_block: {} tiles per row exceed {} DST tiles",
                block_ct_dim, DST_COUNT
            )));
        }
        let mut llk = self.llk();
        for rt in 0..block_rt_dim {
            llk.acquire_dst();
            for ct in 0..block_ct_dim {
                llk.unpack_a(icb, rt * block_ct_dim + ct, false)?;
                llk.math_eltwise_unary_datacopy(ct)?;
            }
            llk.pack_untilize_rows(rt..rt + 1, ocb, 0, block_ct_dim, block_ct_dim)?;
        }
        Ok(())
    }

    fn pack_untilize_dst(
        &self,
        ocb: u32,
        block_rt_dim: u32,
        block_c_index: u32,
        block_ct_dim: u32,
        full_ct_dim: u32,
    ) -> Result<()> {
        self.llk().pack_untilize(block_rt_dim, ocb, block_c_index, block_ct_dim, full_ct_dim)
    }

    fn sfpu_tile(&self, op: SfpuUnaryOp, idst: u32) -> Result<()> {
        self.llk().math_eltwise_unary_sfpu(op, idst)
    }

    fn binop_tile(&self, op: SfpuBinaryOp, idst0: u32, idst1: u32) -> Result<()> {
        self.llk().math_eltwise_binary_sfpu_binop(op, idst0, idst1)
    }

    fn copy_dest_values(&self, idst0: u32, idst1: u32) -> Result<()> {
        self.llk().math_eltwise_binary_sfpu_copy_dest_values(idst0, idst1)
    }

    fn max_tile(&self, idst0: u32, idst1: u32) -> Result<()> {
        self.llk().math_eltwise_unary_sfpu_max(idst0, idst1)
    }

    fn typecast_tile(&self, in_dtype: u32, out_dtype: u32, idst: u32) -> Result<()> {
        self.llk().math_eltwise_unary_sfpu_typecast(in_dtype, out_dtype, idst)
    }
}

impl fmt::Debug for ComputeImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeImpl").field("llk", &*self.llk()).finish()
    }
}
