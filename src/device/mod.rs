//! Device model of a NoC-connected Tensix machine.
//!
//! This module provides:
//! - Architecture descriptions (mesh size, DRAM and worker placement)
//! - Byte-addressable memory banks for L1 and DRAM
//! - The per-tile circular buffer and NoC engines
//! - Tensix tiles with their three RISC-V threads
//! - The machine that owns every tile and drives kernel launches
//!
//! # Architecture Overview
//!
//! Cores sit on a 2D mesh addressed by routing coordinates `(x, y)`:
//!
//! ```text
//!        x=0     x=1     x=2     x=3
//!      +-------+-------+-------+-------+
//!  y=0 | PCIe  | DRAM0 | DRAM1 |       |
//!      +-------+-------+-------+-------+
//!  y=1 |       |Tensix |Tensix |Tensix |   <- logical row 0
//!      +-------+-------+-------+-------+
//!  y=2 |       |Tensix |Tensix |Tensix |
//!      +-------+-------+-------+-------+
//!  y=3 |       |Tensix |Tensix |Tensix |
//!      +-------+-------+-------+-------+
//! ```
//!
//! Each Tensix tile owns an L1 bank, a [`CbEngine`] shared by its threads,
//! two NoC engines (one per data-movement core) and three threads:
//! BRISC and NCRISC run dataflow kernels, TRISC runs the compute kernel.
//!
//! # Example
//!
//! ```
//! use tensix_emu::device::arch_config::{GridArch, GridLayout};
//! use tensix_emu::device::riscv::NativeCluster;
//! use tensix_emu::device::Machine;
//!
//! let machine = Machine::with_grid(GridArch::new(GridLayout::small()).unwrap(), &NativeCluster::default()).unwrap();
//! assert_eq!(machine.tiles().len(), 9);
//! let tile = machine.worker(0, 0).unwrap();
//! assert_eq!(tile.logical_xy(), (0, 0));
//! machine.stop().unwrap();
//! ```

pub mod arch_config;
pub mod base_addr;
pub mod cb;
pub mod format;
pub mod machine;
pub mod memory;
pub mod noc;
pub mod riscv;
pub mod soc;
pub mod tensix;

pub use arch_config::{GridArch, GridLayout, NocArch, SocArch};
pub use base_addr::{CbConfig, KernelConfig, MemMap, RiscKind};
pub use cb::{Cb, CbEngine};
pub use format::DataFormat;
pub use machine::{BusyThread, Machine};
pub use memory::{Memory, MemoryBank};
pub use noc::{Noc, NocEngine};
pub use riscv::{KernelRegistry, NativeCluster, NativeCore, RiscvCluster, RiscvCore, ThreadApi};
pub use soc::Soc;
pub use tensix::{Tensix, TensixImpl, TensixState};
