//! Kernel-facing APIs.
//!
//! Data-movement kernels on BRISC and NCRISC see a [`Dataflow`]; compute
//! kernels on TRISC see a [`Compute`]. Both are trait objects so tests can
//! substitute fakes.

pub mod compute;
pub mod dataflow;

pub use compute::{Compute, ComputeImpl, InitOp};
pub use dataflow::{Dataflow, DataflowImpl};
