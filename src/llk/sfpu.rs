//! SFPU operations on DST tiles.
//!
//! Unary operations rewrite one DST tile element by element. Scalar
//! parameters arrive as raw `u32` words and are decoded as `f32` bit
//! patterns unless the operation says otherwise.

use super::pack_utils::{float_as_u32, u16b_as_float, u32_as_float};
use super::{dst_range, Llk};
use crate::device::format::DataFormat;
use crate::error::{EmuError, Result};

/// Binary SFPU operation between two DST tiles, result in the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SfpuBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// `dst1 - dst0`
    Rsub,
    Pow,
}

/// Unary SFPU operation on one DST tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SfpuUnaryOp {
    Rsqrt,
    Sigmoid,
    Log,
    /// Not emulated; leaves DST unchanged.
    LogWithBase(u32),
    Tanh,
    Signbit,
    Abs,
    Sign,
    Square,
    Ltz,
    Eqz,
    Lez,
    Gtz,
    Nez,
    Gez,
    /// Integer exponent.
    Power(u32),
    Exp2,
    /// Value at zero.
    Heaviside(u32),
    Expm1,
    Asin,
    Atan,
    Acos,
    AddScalar(u32),
    SubScalar(u32),
    MulScalar(u32),
    DivScalar(u32),
    /// `scalar - x`
    RsubScalar(u32),
    /// Only applied inside the int16 range.
    Ceil,
    CeilFloat32,
    Elu(u32),
    Erf,
    Erfc,
    /// Not emulated; leaves DST unchanged.
    Erfinv,
    Exp,
    FillBitcast(u32),
    /// Only applied inside the int16 range.
    Floor,
    FloorFloat32,
    Gelu,
    /// Not emulated; leaves DST unchanged.
    I0,
    Isinf,
    /// Not emulated; leaves DST unchanged.
    Isposinf,
    /// Not emulated; leaves DST unchanged.
    Isneginf,
    Isnan,
    Isfinite,
    LogicalNot,
    Reciprocal,
    ReluMax(u32),
    ReluMin(u32),
    Relu,
    LeakyRelu(u32),
    Sqrt,
    Sin,
    Cos,
    Tan,
}

const I16_MIN: f32 = -32767.0;
const I16_MAX: f32 = 32767.0;

impl SfpuUnaryOp {
    /// Operations that leave DST untouched.
    pub fn is_noop(self) -> bool {
        matches!(
            self,
            SfpuUnaryOp::LogWithBase(_)
                | SfpuUnaryOp::Erfinv
                | SfpuUnaryOp::I0
                | SfpuUnaryOp::Isposinf
                | SfpuUnaryOp::Isneginf
        )
    }

    /// Result for one element.
    pub fn apply(self, x: f32) -> f32 {
        use SfpuUnaryOp::*;
        match self {
            Rsqrt => 1.0 / x.sqrt(),
            Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Log => x.ln(),
            Tanh => x.tanh(),
            Signbit => flag(x.is_sign_negative()),
            Abs => x.abs(),
            Sign => {
                if x < 0.0 {
                    -1.0
                } else if x == 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
            Square => x * x,
            Ltz => flag(x < 0.0),
            Eqz | LogicalNot => flag(x == 0.0),
            Lez => flag(x <= 0.0),
            Gtz => flag(x > 0.0),
            Nez => flag(x != 0.0),
            Gez => flag(x >= 0.0),
            Power(p) => pow_u32(x, p),
            Exp2 => x.exp2(),
            Heaviside(step) => {
                if x < 0.0 {
                    0.0
                } else if x == 0.0 {
                    u32_as_float(step)
                } else {
                    1.0
                }
            }
            Expm1 => x.exp_m1(),
            Asin => x.asin(),
            Atan => x.atan(),
            Acos => x.acos(),
            AddScalar(s) => x + u32_as_float(s),
            SubScalar(s) => x - u32_as_float(s),
            MulScalar(s) => x * u32_as_float(s),
            DivScalar(s) => x / u32_as_float(s),
            RsubScalar(s) => u32_as_float(s) - x,
            Ceil => {
                if (I16_MIN..=I16_MAX).contains(&x) {
                    x.ceil()
                } else {
                    x
                }
            }
            CeilFloat32 => x.ceil(),
            Elu(slope) => {
                if x <= 0.0 {
                    u32_as_float(slope) * (x.exp() - 1.0)
                } else {
                    x
                }
            }
            Erf => erf(x as f64) as f32,
            Erfc => (1.0 - erf(x as f64)) as f32,
            Exp => x.exp(),
            FillBitcast(v) => u32_as_float(v),
            Floor => {
                if (I16_MIN..=I16_MAX).contains(&x) {
                    x.floor()
                } else {
                    x
                }
            }
            FloorFloat32 => x.floor(),
            Gelu => gelu(x),
            Isinf => flag(x.is_infinite()),
            Isnan => flag(x.is_nan()),
            Isfinite => flag(x.is_finite()),
            Reciprocal => 1.0 / x,
            ReluMax(th) => {
                let th = u32_as_float(th);
                if x > th {
                    th
                } else if x < 0.0 {
                    0.0
                } else {
                    x
                }
            }
            ReluMin(th) => {
                if x < u32_as_float(th) {
                    0.0
                } else {
                    x
                }
            }
            Relu => {
                if x <= 0.0 {
                    0.0
                } else {
                    x
                }
            }
            LeakyRelu(slope) => {
                if x <= 0.0 {
                    u32_as_float(slope) * x
                } else {
                    x
                }
            }
            Sqrt => x.sqrt(),
            Sin => x.sin(),
            Cos => x.cos(),
            Tan => x.tan(),
            LogWithBase(_) | Erfinv | I0 | Isposinf | Isneginf => x,
        }
    }
}

#[inline]
fn flag(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// `x` raised to a non-negative integer power by repeated squaring.
fn pow_u32(mut x: f32, mut p: u32) -> f32 {
    let mut y = 1.0f32;
    while p != 0 {
        if p & 1 != 0 {
            y *= x;
        }
        x *= x;
        p >>= 1;
    }
    y
}

fn gelu(x: f32) -> f32 {
    const ALPHA: f32 = 0.797_884_6; // sqrt(2 / pi)
    const BETA: f32 = 0.044_715;
    0.5 * x * (1.0 + (ALPHA * (x + BETA * x * x * x)).tanh())
}

/// Error function in f64: Maclaurin series below 2, the erfc continued
/// fraction above.
fn erf(x: f64) -> f64 {
    let ax = x.abs();
    let r = if ax < 2.0 {
        let mut term = ax;
        let mut sum = ax;
        let x2 = ax * ax;
        let mut n = 0.0;
        loop {
            n += 1.0;
            term *= -x2 / n;
            let add = term / (2.0 * n + 1.0);
            sum += add;
            if add.abs() < 1e-17 {
                break;
            }
        }
        sum * std::f64::consts::FRAC_2_SQRT_PI
    } else {
        // continued fraction for erfc
        let mut f = 0.0;
        for k in (1..=60).rev() {
            f = (k as f64 / 2.0) / (ax + f);
        }
        1.0 - (-ax * ax).exp() / ((ax + f) * std::f64::consts::PI.sqrt())
    };
    if x < 0.0 {
        -r
    } else {
        r
    }
}

impl Llk {
    // ========================================================================
    // SFPU
    // ========================================================================

    /// Copy DST tile `dst_index1` into `dst_index0`.
    pub fn math_eltwise_binary_sfpu_copy_dest_values(&mut self, dst_index0: u32, dst_index1: u32) -> Result<()> {
        let to = dst_range(dst_index0)?;
        let from = dst_range(dst_index1)?;
        self.dst.copy_within(from, to.start);
        Ok(())
    }

    pub fn math_eltwise_binary_sfpu_binop(&mut self, op: SfpuBinaryOp, dst_index0: u32, dst_index1: u32) -> Result<()> {
        let f: fn(f32, f32) -> f32 = match op {
            SfpuBinaryOp::Add => |a, b| a + b,
            SfpuBinaryOp::Sub => |a, b| a - b,
            SfpuBinaryOp::Mul => |a, b| a * b,
            SfpuBinaryOp::Div => |a, b| a / b,
            SfpuBinaryOp::Rsub => |a, b| b - a,
            SfpuBinaryOp::Pow => f32::powf,
        };
        self.combine_dst(dst_index0, dst_index1, f)
    }

    /// Element-wise maximum of two DST tiles, into the first.
    pub fn math_eltwise_unary_sfpu_max(&mut self, dst_index0: u32, dst_index1: u32) -> Result<()> {
        self.combine_dst(dst_index0, dst_index1, f32::max)
    }

    /// `dst[i0] = f(dst[i0], dst[i1])`; the indices may coincide.
    fn combine_dst(&mut self, i0: u32, i1: u32, f: fn(f32, f32) -> f32) -> Result<()> {
        let to = dst_range(i0)?;
        let from = dst_range(i1)?;
        self.temp.copy_from_slice(&self.dst[from]);
        for (d, &b) in self.dst[to].iter_mut().zip(&self.temp) {
            *d = f(*d, b);
        }
        Ok(())
    }

    pub fn math_eltwise_unary_sfpu(&mut self, op: SfpuUnaryOp, dst_index: u32) -> Result<()> {
        let range = dst_range(dst_index)?;
        if op.is_noop() {
            log::trace!("sfpu {:?} is not emulated", op);
            return Ok(());
        }
        for x in &mut self.dst[range] {
            *x = op.apply(*x);
        }
        Ok(())
    }

    /// Reinterpret DST values between Float16_b and UInt16.
    pub fn math_eltwise_unary_sfpu_typecast(&mut self, in_dtype: u32, out_dtype: u32, dst_index: u32) -> Result<()> {
        let range = dst_range(dst_index)?;
        let dst = &mut self.dst[range];
        match (DataFormat::from_raw(in_dtype), DataFormat::from_raw(out_dtype)) {
            (DataFormat::Float16B, DataFormat::UInt16) => {
                for x in dst.iter_mut() {
                    *x = u16b_as_float(*x as u16 as u32);
                }
            }
            (DataFormat::UInt16, DataFormat::Float16B) => {
                for x in dst.iter_mut() {
                    *x = float_as_u32(*x) as f32;
                }
            }
            (from, to) => {
                return Err(EmuError::unsupported(format!("typecast from {:?} to {:?}", from, to)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cb::CbEngine;
    use crate::device::memory::MemoryBank;
    use crate::schedule::Scheduler;
    use std::sync::Arc;

    fn llk() -> Llk {
        let l1 = Arc::new(MemoryBank::new("l1", 64 * 1024));
        let cb = Arc::new(CbEngine::new(Arc::new(Scheduler::new())));
        let mut llk = Llk::new(l1, cb);
        llk.acquire_dst();
        llk
    }

    fn fill(llk: &mut Llk, index: u32, value: f32) {
        llk.dst_tile_mut(index).unwrap().fill(value);
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-5 * b.abs().max(1.0)
    }

    #[test]
    fn test_unary_elementwise() {
        let cases = [
            (SfpuUnaryOp::Rsqrt, 4.0, 0.5),
            (SfpuUnaryOp::Sigmoid, 0.0, 0.5),
            (SfpuUnaryOp::Square, -3.0, 9.0),
            (SfpuUnaryOp::Sign, -7.0, -1.0),
            (SfpuUnaryOp::Signbit, -0.0, 1.0),
            (SfpuUnaryOp::Gez, 0.0, 1.0),
            (SfpuUnaryOp::Ltz, 0.0, 0.0),
            (SfpuUnaryOp::Power(5), 2.0, 32.0),
            (SfpuUnaryOp::Power(0), 3.0, 1.0),
            (SfpuUnaryOp::Heaviside(0x3f00_0000), 0.0, 0.5),
            (SfpuUnaryOp::Heaviside(0x3f00_0000), -1.0, 0.0),
            (SfpuUnaryOp::RsubScalar(0x4120_0000), 4.0, 6.0),
            (SfpuUnaryOp::DivScalar(0x4000_0000), 5.0, 2.5),
            (SfpuUnaryOp::Ceil, 1.25, 2.0),
            (SfpuUnaryOp::Ceil, 40000.5, 40000.5),
            (SfpuUnaryOp::CeilFloat32, 40000.5, 40001.0),
            (SfpuUnaryOp::Floor, -40000.5, -40000.5),
            (SfpuUnaryOp::FloorFloat32, -1.5, -2.0),
            (SfpuUnaryOp::Elu(0x3f80_0000), -1.0, (-1.0f32).exp() - 1.0),
            (SfpuUnaryOp::Gelu, 0.0, 0.0),
            (SfpuUnaryOp::Erf, 0.5, 0.520_499_9),
            (SfpuUnaryOp::Erfc, 2.5, 0.000_406_952),
            (SfpuUnaryOp::Isinf, f32::INFINITY, 1.0),
            (SfpuUnaryOp::Isfinite, f32::NAN, 0.0),
            (SfpuUnaryOp::LogicalNot, 3.0, 0.0),
            (SfpuUnaryOp::ReluMax(0x4000_0000), 3.0, 2.0),
            (SfpuUnaryOp::ReluMin(0x4000_0000), 1.0, 0.0),
            (SfpuUnaryOp::LeakyRelu(0x3dcc_cccd), -2.0, -0.2),
            (SfpuUnaryOp::FillBitcast(0x4040_0000), 9.0, 3.0),
        ];
        for (op, x, expected) in cases {
            let got = op.apply(x);
            assert!(close(got, expected), "{:?}({}) = {}, expected {}", op, x, got, expected);
        }
        assert!(close(SfpuUnaryOp::Gelu.apply(1.0), 0.841_192));
    }

    #[test]
    fn test_noop_ops_leave_dst() {
        let mut llk = llk();
        fill(&mut llk, 2, 0.75);
        for op in [
            SfpuUnaryOp::LogWithBase(3),
            SfpuUnaryOp::Erfinv,
            SfpuUnaryOp::I0,
            SfpuUnaryOp::Isposinf,
            SfpuUnaryOp::Isneginf,
        ] {
            llk.math_eltwise_unary_sfpu(op, 2).unwrap();
        }
        assert!(llk.dst_tile(2).unwrap().iter().all(|&x| x == 0.75));
    }

    #[test]
    fn test_unary_on_dst_tile() {
        let mut llk = llk();
        fill(&mut llk, 1, -2.0);
        llk.math_eltwise_unary_sfpu(SfpuUnaryOp::Abs, 1).unwrap();
        llk.math_eltwise_unary_sfpu(SfpuUnaryOp::Sqrt, 1).unwrap();
        assert!(llk.dst_tile(1).unwrap().iter().all(|&x| close(x, 2f32.sqrt())));
        assert!(llk.math_eltwise_unary_sfpu(SfpuUnaryOp::Relu, 8).is_err());
    }

    #[test]
    fn test_binary_sfpu() {
        let mut llk = llk();
        fill(&mut llk, 0, 6.0);
        fill(&mut llk, 1, 2.0);
        llk.math_eltwise_binary_sfpu_binop(SfpuBinaryOp::Rsub, 0, 1).unwrap();
        assert_eq!(llk.dst_tile(0).unwrap()[0], -4.0);
        llk.math_eltwise_binary_sfpu_binop(SfpuBinaryOp::Pow, 1, 1).unwrap();
        assert_eq!(llk.dst_tile(1).unwrap()[10], 4.0);
        llk.math_eltwise_unary_sfpu_max(0, 1).unwrap();
        assert_eq!(llk.dst_tile(0).unwrap()[5], 4.0);

        fill(&mut llk, 3, 1.5);
        llk.math_eltwise_binary_sfpu_copy_dest_values(2, 3).unwrap();
        assert_eq!(llk.dst_tile(2).unwrap()[1023], 1.5);
    }

    #[test]
    fn test_typecast() {
        let mut llk = llk();
        fill(&mut llk, 0, 16256.0);
        // 16256 = 0x3F80, a Float16_b 1.0
        llk.math_eltwise_unary_sfpu_typecast(5, 12, 0).unwrap();
        assert_eq!(llk.dst_tile(0).unwrap()[0], 1.0);
        llk.math_eltwise_unary_sfpu_typecast(12, 5, 0).unwrap();
        assert_eq!(llk.dst_tile(0).unwrap()[0], 0x3f80_0000u32 as f32);

        let err = llk.math_eltwise_unary_sfpu_typecast(0, 12, 0).unwrap_err();
        assert!(matches!(err, EmuError::Unsupported(_)));
    }
}
