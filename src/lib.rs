//! tensix-emu library
//!
//! Functional emulation of Tensix compute tiles: memory banks, circular
//! buffers, the NoC, the dataflow and compute kernel APIs, and the machine
//! that runs kernels on every tile under a cooperative scheduler.

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod llk;
pub mod schedule;

pub use error::{EmuError, Result};
