//! Architecture configuration: NoC address encoding and SoC layout.
//!
//! Two traits split the architecture description the way the engines use it:
//!
//! - [`NocArch`]: pure address arithmetic. How `(x, y, addr)` packs into a
//!   64-bit NoC address, how multicast rectangles are encoded, and which
//!   core serves each interleaved DRAM or L1 bank.
//! - [`SocArch`]: the physical mesh. Which core type sits at each
//!   coordinate, memory sizes, DRAM channel endpoints and the mapping
//!   between logical worker coordinates and NoC routing coordinates.
//!
//! Engines never check coordinates directly; they ask the architecture.
//!
//! # Address layout
//!
//! ```text
//!   unicast    [ y:6 | x:6 | addr:32 ]
//!   multicast  [ y_start:6 | x_start:6 | y_end:6 | x_end:6 | addr:32 ]
//! ```
//!
//! # Example
//!
//! ```
//! use tensix_emu::device::arch_config::{CoreType, GridArch, GridLayout, NocArch, SocArch};
//!
//! let arch = GridArch::new(GridLayout::grayskull()).unwrap();
//! assert_eq!(arch.noc_size_x(), 13);
//! assert_eq!(arch.core_type(0, 4), CoreType::Pcie);
//! assert_eq!(arch.core_type(1, 6), CoreType::Dram);
//!
//! let addr = arch.noc_xy_addr(3, 5, 0x1000);
//! assert_eq!(arch.parse_noc_addr(addr), (3, 5, 0x1000));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EmuError, Result};

/// Number of NoC indices.
pub const NUM_NOCS: u32 = 2;

const NOC_ADDR_LOCAL_BITS: u32 = 32;
const NOC_ADDR_NODE_ID_BITS: u32 = 6;
const NODE_ID_MASK: u64 = (1 << NOC_ADDR_NODE_ID_BITS) - 1;

/// Type of the core at a mesh coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    Arc,
    Dram,
    Eth,
    Pcie,
    Worker,
    Harvested,
    RouterOnly,
    Invalid,
}

/// Decoded multicast rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastRect {
    pub x_start: u32,
    pub y_start: u32,
    pub x_end: u32,
    pub y_end: u32,
    pub addr: u32,
}

/// NoC address arithmetic and bank routing.
pub trait NocArch: Send + Sync + fmt::Debug {
    // ========================================================================
    // Geometry
    // ========================================================================

    fn num_dram_banks(&self) -> u32;
    fn num_l1_banks(&self) -> u32;
    fn noc_size_x(&self) -> u32;
    fn noc_size_y(&self) -> u32;
    fn pcie_noc_x(&self) -> u32;
    fn pcie_noc_y(&self) -> u32;

    // ========================================================================
    // Address encoding
    // ========================================================================

    /// Pack a unicast NoC address.
    fn noc_xy_addr(&self, x: u32, y: u32, addr: u32) -> u64 {
        ((y as u64) << (NOC_ADDR_LOCAL_BITS + NOC_ADDR_NODE_ID_BITS))
            | ((x as u64) << NOC_ADDR_LOCAL_BITS)
            | addr as u64
    }

    /// Pack a multicast NoC address.
    fn noc_multicast_addr(&self, x_start: u32, y_start: u32, x_end: u32, y_end: u32, addr: u32) -> u64 {
        ((x_start as u64) << (NOC_ADDR_LOCAL_BITS + 2 * NOC_ADDR_NODE_ID_BITS))
            | ((y_start as u64) << (NOC_ADDR_LOCAL_BITS + 3 * NOC_ADDR_NODE_ID_BITS))
            | ((x_end as u64) << NOC_ADDR_LOCAL_BITS)
            | ((y_end as u64) << (NOC_ADDR_LOCAL_BITS + NOC_ADDR_NODE_ID_BITS))
            | addr as u64
    }

    /// Upper half of a unicast address. The PCIe core carries an extra flag.
    fn noc_xy_encoding(&self, x: u32, y: u32) -> u32 {
        let pcie = if x == self.pcie_noc_x() && y == self.pcie_noc_y() { 0x8 } else { 0 };
        (y << NOC_ADDR_NODE_ID_BITS) | x | pcie
    }

    /// Upper half of a multicast address.
    fn noc_multicast_encoding(&self, x_start: u32, y_start: u32, x_end: u32, y_end: u32) -> u32 {
        (x_start << (2 * NOC_ADDR_NODE_ID_BITS))
            | (y_start << (3 * NOC_ADDR_NODE_ID_BITS))
            | x_end
            | (y_end << NOC_ADDR_NODE_ID_BITS)
    }

    /// Combine a precomputed encoding with a local address.
    fn noc_xy_addr2(&self, xy: u32, addr: u32) -> u64 {
        ((xy as u64) << NOC_ADDR_LOCAL_BITS) | addr as u64
    }

    /// Split a unicast address into `(x, y, addr)`.
    fn parse_noc_addr(&self, noc_addr: u64) -> (u32, u32, u32) {
        let addr = noc_addr as u32;
        let rest = noc_addr >> NOC_ADDR_LOCAL_BITS;
        let x = (rest & NODE_ID_MASK) as u32;
        let y = (rest >> NOC_ADDR_NODE_ID_BITS) as u32;
        (x, y, addr)
    }

    /// Split a multicast address.
    fn parse_noc_multicast_addr(&self, noc_addr: u64) -> McastRect {
        let addr = noc_addr as u32;
        let mut rest = noc_addr >> NOC_ADDR_LOCAL_BITS;
        let x_end = (rest & NODE_ID_MASK) as u32;
        rest >>= NOC_ADDR_NODE_ID_BITS;
        let y_end = (rest & NODE_ID_MASK) as u32;
        rest >>= NOC_ADDR_NODE_ID_BITS;
        let x_start = (rest & NODE_ID_MASK) as u32;
        rest >>= NOC_ADDR_NODE_ID_BITS;
        let y_start = rest as u32;
        McastRect { x_start, y_start, x_end, y_end, addr }
    }

    // ========================================================================
    // Bank routing
    // ========================================================================

    fn dram_bank_to_noc_xy(&self, noc_index: u32, bank_id: u32) -> Result<u32>;
    fn bank_to_dram_offset(&self, bank_id: u32) -> Result<u32>;
    fn l1_bank_to_noc_xy(&self, noc_index: u32, bank_id: u32) -> Result<u32>;
    fn bank_to_l1_offset(&self, bank_id: u32) -> Result<u32>;
}

/// Physical mesh description.
pub trait SocArch: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn x_size(&self) -> u32;
    fn y_size(&self) -> u32;
    fn worker_l1_size(&self) -> u32;
    fn dram_bank_size(&self) -> u32;
    fn num_dram_channels(&self) -> u32;

    /// Core type at a routing coordinate. Off-mesh is [`CoreType::Invalid`].
    fn core_type(&self, x: u32, y: u32) -> CoreType;

    /// DRAM channel served by the DRAM core at `(x, y)`.
    fn core_dram_channel(&self, x: u32, y: u32) -> Result<u32>;

    /// Routing coordinate of a DRAM channel's endpoint.
    fn dram_preferred_worker_endpoint(&self, channel: u32) -> Result<(u32, u32)>;

    fn worker_x_size(&self) -> u32;
    fn worker_y_size(&self) -> u32;
    fn worker_logical_to_routing_x(&self, logical_x: u32) -> Result<u32>;
    fn worker_logical_to_routing_y(&self, logical_y: u32) -> Result<u32>;
    fn worker_routing_to_logical_x(&self, x: u32) -> Option<u32>;
    fn worker_routing_to_logical_y(&self, y: u32) -> Option<u32>;
}

// ============================================================================
// Grid description
// ============================================================================

/// Declarative mesh layout, loadable from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridLayout {
    pub name: String,
    pub size_x: u32,
    pub size_y: u32,
    /// Routing x of every worker column.
    pub worker_columns: Vec<u32>,
    /// Routing y of every worker row.
    pub worker_rows: Vec<u32>,
    /// DRAM cores, one per channel, in channel order.
    pub dram_cores: Vec<(u32, u32)>,
    pub pcie_core: (u32, u32),
    pub arc_core: Option<(u32, u32)>,
    pub worker_l1_size: u32,
    pub dram_bank_size: u32,
}

impl GridLayout {
    /// 13x12 Grayskull-like mesh: 8 DRAM channels, 120 workers.
    pub fn grayskull() -> Self {
        Self {
            name: "grayskull".to_string(),
            size_x: 13,
            size_y: 12,
            worker_columns: (1..=12).collect(),
            worker_rows: (1..=5).chain(7..=11).collect(),
            dram_cores: vec![(1, 0), (1, 6), (4, 0), (4, 6), (7, 0), (7, 6), (10, 0), (10, 6)],
            pcie_core: (0, 4),
            arc_core: Some((0, 2)),
            worker_l1_size: 1024 * 1024,
            dram_bank_size: 1024 * 1024 * 1024,
        }
    }

    /// 4x4 mesh with a 3x3 worker block, used by tests and demos.
    pub fn small() -> Self {
        Self {
            name: "small".to_string(),
            size_x: 4,
            size_y: 4,
            worker_columns: vec![1, 2, 3],
            worker_rows: vec![1, 2, 3],
            dram_cores: vec![(1, 0), (2, 0)],
            pcie_core: (0, 0),
            arc_core: None,
            worker_l1_size: 1024 * 1024,
            dram_bank_size: 64 * 1024 * 1024,
        }
    }

    /// Named preset.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "grayskull" => Some(Self::grayskull()),
            "small" => Some(Self::small()),
            _ => None,
        }
    }
}

impl Default for GridLayout {
    fn default() -> Self {
        Self::grayskull()
    }
}

// ============================================================================
// GridArch
// ============================================================================

/// Table-driven architecture built from a [`GridLayout`].
///
/// Interleaved L1 banks map one-to-one onto worker cores in logical order
/// (column-major), each at offset 0. DRAM banks map onto DRAM channels.
/// Bank tables hold the NoC 0 encoding and the mirrored NoC 1 encoding.
#[derive(Clone)]
pub struct GridArch {
    name: String,
    size_x: u32,
    size_y: u32,
    worker_l1_size: u32,
    dram_bank_size: u32,
    pcie: (u32, u32),
    /// indexed x * size_y + y
    core_types: Vec<CoreType>,
    dram_endpoints: Vec<(u32, u32)>,
    logical_to_routing_x: Vec<u32>,
    logical_to_routing_y: Vec<u32>,
    routing_to_logical_x: Vec<Option<u32>>,
    routing_to_logical_y: Vec<Option<u32>>,
    dram_bank_to_noc_xy: [Vec<u32>; NUM_NOCS as usize],
    l1_bank_to_noc_xy: [Vec<u32>; NUM_NOCS as usize],
}

impl GridArch {
    pub fn new(layout: GridLayout) -> Result<Self> {
        let GridLayout {
            name,
            size_x,
            size_y,
            mut worker_columns,
            mut worker_rows,
            dram_cores,
            pcie_core,
            arc_core,
            worker_l1_size,
            dram_bank_size,
        } = layout;

        if size_x == 0 || size_y == 0 || size_x > 64 || size_y > 64 {
            return Err(EmuError::config(format!("mesh size {}x{} out of range", size_x, size_y)));
        }

        let mut arch = Self {
            name,
            size_x,
            size_y,
            worker_l1_size,
            dram_bank_size,
            pcie: pcie_core,
            core_types: vec![CoreType::Invalid; (size_x * size_y) as usize],
            dram_endpoints: dram_cores.clone(),
            logical_to_routing_x: Vec::new(),
            logical_to_routing_y: Vec::new(),
            routing_to_logical_x: vec![None; size_x as usize],
            routing_to_logical_y: vec![None; size_y as usize],
            dram_bank_to_noc_xy: [Vec::new(), Vec::new()],
            l1_bank_to_noc_xy: [Vec::new(), Vec::new()],
        };

        arch.set_core_type(CoreType::Pcie, pcie_core.0, pcie_core.1)?;
        if let Some((x, y)) = arc_core {
            arch.set_core_type(CoreType::Arc, x, y)?;
        }
        for &(x, y) in &dram_cores {
            arch.set_core_type(CoreType::Dram, x, y)?;
        }

        worker_columns.sort_unstable();
        worker_columns.dedup();
        worker_rows.sort_unstable();
        worker_rows.dedup();
        for &x in &worker_columns {
            for &y in &worker_rows {
                arch.set_core_type(CoreType::Worker, x, y)?;
            }
        }

        for (logical, &x) in worker_columns.iter().enumerate() {
            arch.routing_to_logical_x[x as usize] = Some(logical as u32);
        }
        for (logical, &y) in worker_rows.iter().enumerate() {
            arch.routing_to_logical_y[y as usize] = Some(logical as u32);
        }
        arch.logical_to_routing_x = worker_columns;
        arch.logical_to_routing_y = worker_rows;

        for noc in 0..NUM_NOCS {
            let dram: Vec<u32> = dram_cores.iter().map(|&(x, y)| arch.bank_encoding(noc, x, y)).collect();
            let mut l1 = Vec::new();
            for &x in &arch.logical_to_routing_x {
                for &y in &arch.logical_to_routing_y {
                    l1.push(arch.bank_encoding(noc, x, y));
                }
            }
            arch.dram_bank_to_noc_xy[noc as usize] = dram;
            arch.l1_bank_to_noc_xy[noc as usize] = l1;
        }

        log::debug!(
            "arch {}: {}x{} mesh, {} workers, {} DRAM channels",
            arch.name,
            size_x,
            size_y,
            arch.l1_bank_to_noc_xy[0].len(),
            arch.dram_endpoints.len()
        );
        Ok(arch)
    }

    fn set_core_type(&mut self, core_type: CoreType, x: u32, y: u32) -> Result<()> {
        if x >= self.size_x || y >= self.size_y {
            return Err(EmuError::config(format!("Core coordinates ({}, {}) are out of range", x, y)));
        }
        let slot = &mut self.core_types[(x * self.size_y + y) as usize];
        if *slot != CoreType::Invalid {
            return Err(EmuError::config(format!("Core type at ({}, {}) is already set", x, y)));
        }
        *slot = core_type;
        Ok(())
    }

    /// Bank table entry: coordinates as seen from `noc`.
    fn bank_encoding(&self, noc: u32, x: u32, y: u32) -> u32 {
        let (x, y) = if noc == 0 { (x, y) } else { (self.size_x - 1 - x, self.size_y - 1 - y) };
        (y << NOC_ADDR_NODE_ID_BITS) | x
    }

    fn bank_lookup(table: &[Vec<u32>; NUM_NOCS as usize], what: &str, noc_index: u32, bank_id: u32) -> Result<u32> {
        table
            .get(noc_index as usize)
            .and_then(|banks| banks.get(bank_id as usize))
            .copied()
            .ok_or_else(|| EmuError::invariant(format!("{} bank {} on NoC {} out of range", what, bank_id, noc_index)))
    }
}

impl NocArch for GridArch {
    fn num_dram_banks(&self) -> u32 {
        self.dram_bank_to_noc_xy[0].len() as u32
    }

    fn num_l1_banks(&self) -> u32 {
        self.l1_bank_to_noc_xy[0].len() as u32
    }

    fn noc_size_x(&self) -> u32 {
        self.size_x
    }

    fn noc_size_y(&self) -> u32 {
        self.size_y
    }

    fn pcie_noc_x(&self) -> u32 {
        self.pcie.0
    }

    fn pcie_noc_y(&self) -> u32 {
        self.pcie.1
    }

    fn dram_bank_to_noc_xy(&self, noc_index: u32, bank_id: u32) -> Result<u32> {
        Self::bank_lookup(&self.dram_bank_to_noc_xy, "DRAM", noc_index, bank_id)
    }

    fn bank_to_dram_offset(&self, bank_id: u32) -> Result<u32> {
        if bank_id >= self.num_dram_banks() {
            return Err(EmuError::invariant(format!("DRAM bank {} out of range", bank_id)));
        }
        Ok(0)
    }

    fn l1_bank_to_noc_xy(&self, noc_index: u32, bank_id: u32) -> Result<u32> {
        Self::bank_lookup(&self.l1_bank_to_noc_xy, "L1", noc_index, bank_id)
    }

    fn bank_to_l1_offset(&self, bank_id: u32) -> Result<u32> {
        if bank_id >= self.num_l1_banks() {
            return Err(EmuError::invariant(format!("L1 bank {} out of range", bank_id)));
        }
        Ok(0)
    }
}

impl SocArch for GridArch {
    fn name(&self) -> &str {
        &self.name
    }

    fn x_size(&self) -> u32 {
        self.size_x
    }

    fn y_size(&self) -> u32 {
        self.size_y
    }

    fn worker_l1_size(&self) -> u32 {
        self.worker_l1_size
    }

    fn dram_bank_size(&self) -> u32 {
        self.dram_bank_size
    }

    fn num_dram_channels(&self) -> u32 {
        self.dram_endpoints.len() as u32
    }

    fn core_type(&self, x: u32, y: u32) -> CoreType {
        if x >= self.size_x || y >= self.size_y {
            return CoreType::Invalid;
        }
        self.core_types[(x * self.size_y + y) as usize]
    }

    fn core_dram_channel(&self, x: u32, y: u32) -> Result<u32> {
        self.dram_endpoints
            .iter()
            .position(|&c| c == (x, y))
            .map(|ch| ch as u32)
            .ok_or_else(|| EmuError::config(format!("DRAM channel not found for core at ({}, {})", x, y)))
    }

    fn dram_preferred_worker_endpoint(&self, channel: u32) -> Result<(u32, u32)> {
        self.dram_endpoints
            .get(channel as usize)
            .copied()
            .ok_or_else(|| EmuError::config(format!("DRAM channel {} is out of range", channel)))
    }

    fn worker_x_size(&self) -> u32 {
        self.logical_to_routing_x.len() as u32
    }

    fn worker_y_size(&self) -> u32 {
        self.logical_to_routing_y.len() as u32
    }

    fn worker_logical_to_routing_x(&self, logical_x: u32) -> Result<u32> {
        self.logical_to_routing_x
            .get(logical_x as usize)
            .copied()
            .ok_or_else(|| EmuError::config(format!("Logical core x coordinate {} is out of range", logical_x)))
    }

    fn worker_logical_to_routing_y(&self, logical_y: u32) -> Result<u32> {
        self.logical_to_routing_y
            .get(logical_y as usize)
            .copied()
            .ok_or_else(|| EmuError::config(format!("Logical core y coordinate {} is out of range", logical_y)))
    }

    fn worker_routing_to_logical_x(&self, x: u32) -> Option<u32> {
        self.routing_to_logical_x.get(x as usize).copied().flatten()
    }

    fn worker_routing_to_logical_y(&self, y: u32) -> Option<u32> {
        self.routing_to_logical_y.get(y as usize).copied().flatten()
    }
}

impl fmt::Debug for GridArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridArch")
            .field("name", &self.name)
            .field("size", &(self.size_x, self.size_y))
            .field("workers", &(self.worker_x_size(), self.worker_y_size()))
            .field("dram_channels", &self.dram_endpoints.len())
            .finish()
    }
}
