//! Fixed L1 layout: mailbox, kernel configuration and core code regions.
//!
//! The host writes a small mailbox at the bottom of every worker's L1. Its
//! `kernel_config_base` points at a per-program region; 16-bit offsets in
//! the mailbox locate the runtime arguments of each core, the CB
//! configuration table and the semaphores inside that region.
//!
//! ```text
//!   L1
//!   0x10  mailbox
//!         +26  kernel_config_base (u32) ──────────┐
//!         +38  semaphore offset  (u16)            │
//!         +44  CB table offset   (u16)            │
//!         +46  BRISC args offset (u16)            │
//!         +50  NCRISC args offset(u16)            │
//!         +54  TRISC args offset (u16)            │
//!   ...                                           ▼
//!   kernel_config_base + offset ──► args / 32 x {addr, size, pages, page_size} / semaphores
//! ```
//!
//! Offsets are read when a kernel launches, so programs may relocate their
//! private regions freely.

use crate::device::memory::Memory;
use crate::error::Result;

pub const MAILBOX_BASE_ADDR: u32 = 16;

const KERNEL_CONFIG_BASE_OFFSET: u32 = 26;
const SEM_OFFSET: u32 = 38;
const CB_OFFSET: u32 = 44;
const BRISC_RTA_OFFSET: u32 = 46;
const NCRISC_RTA_OFFSET: u32 = 50;
const TRISC_RTA_OFFSET: u32 = 54;

/// Legacy fixed L1 addresses.
pub mod addr_map {
    pub const BRISC_L1_ARG_BASE: u32 = 98 * 1024;
    pub const BRISC_L1_RESULT_BASE: u32 = 99 * 1024;
    pub const NCRISC_L1_ARG_BASE: u32 = 100 * 1024;
    pub const NCRISC_L1_RESULT_BASE: u32 = 101 * 1024;
    pub const TRISC_L1_ARG_BASE: u32 = 102 * 1024;

    /// 32 entries of `{fifo_addr, fifo_size, fifo_num_pages, fifo_page_size}`.
    pub const CIRCULAR_BUFFER_CONFIG_BASE: u32 = 103 * 1024;
    pub const NUM_CIRCULAR_BUFFERS: u32 = 32;
    pub const UINT32_WORDS_PER_CIRCULAR_BUFFER_CONFIG: u32 = 4;
    pub const CIRCULAR_BUFFER_CONFIG_SIZE: u32 = NUM_CIRCULAR_BUFFERS * UINT32_WORDS_PER_CIRCULAR_BUFFER_CONFIG * 4;

    pub const SEMAPHORE_BASE: u32 = CIRCULAR_BUFFER_CONFIG_BASE + CIRCULAR_BUFFER_CONFIG_SIZE;
    pub const NUM_SEMAPHORES: u32 = 4;
    pub const SEMAPHORE_ALIGNMENT: u32 = 16;

    pub const L1_UNRESERVED_BASE: u32 = 120 * 1024;
}

/// The three logical cores of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiscKind {
    Brisc,
    Trisc,
    Ncrisc,
}

impl RiscKind {
    pub const ALL: [RiscKind; 3] = [RiscKind::Brisc, RiscKind::Trisc, RiscKind::Ncrisc];

    /// Thread slot inside a tile.
    pub fn index(self) -> usize {
        match self {
            RiscKind::Brisc => 0,
            RiscKind::Trisc => 1,
            RiscKind::Ncrisc => 2,
        }
    }

    /// NoC used by a data-movement core.
    pub fn noc_index(self) -> Option<u32> {
        match self {
            RiscKind::Brisc => Some(0),
            RiscKind::Ncrisc => Some(1),
            RiscKind::Trisc => None,
        }
    }

    fn rta_offset(self) -> u32 {
        match self {
            RiscKind::Brisc => BRISC_RTA_OFFSET,
            RiscKind::Ncrisc => NCRISC_RTA_OFFSET,
            RiscKind::Trisc => TRISC_RTA_OFFSET,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RiscKind::Brisc => "brisc",
            RiscKind::Trisc => "trisc",
            RiscKind::Ncrisc => "ncrisc",
        }
    }
}

fn mailbox_u16(mem: &dyn Memory, offset: u32) -> Result<u32> {
    mem.read_u16(MAILBOX_BASE_ADDR + offset).map(u32::from)
}

/// Start of the current program's kernel configuration region.
pub fn kernel_config_base(mem: &dyn Memory) -> Result<u32> {
    mem.read_u32(MAILBOX_BASE_ADDR + KERNEL_CONFIG_BASE_OFFSET)
}

/// L1 address of the runtime arguments of `kind`.
pub fn arg_base(mem: &dyn Memory, kind: RiscKind) -> Result<u32> {
    Ok(kernel_config_base(mem)? + mailbox_u16(mem, kind.rta_offset())?)
}

/// L1 address of the CB configuration table.
pub fn cb_base(mem: &dyn Memory) -> Result<u32> {
    Ok(kernel_config_base(mem)? + mailbox_u16(mem, CB_OFFSET)?)
}

/// L1 address of semaphore 0.
pub fn semaphore_base(mem: &dyn Memory) -> Result<u32> {
    Ok(kernel_config_base(mem)? + mailbox_u16(mem, SEM_OFFSET)?)
}

/// One row of the CB configuration table, in 16-byte words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CbConfig {
    pub fifo_addr: u32,
    pub fifo_size: u32,
    pub fifo_num_pages: u32,
    pub fifo_page_size: u32,
}

impl CbConfig {
    /// Build from byte quantities.
    pub fn from_bytes(addr: u32, num_pages: u32, page_size: u32) -> Self {
        Self {
            fifo_addr: addr >> 4,
            fifo_size: (num_pages * page_size) >> 4,
            fifo_num_pages: num_pages,
            fifo_page_size: page_size >> 4,
        }
    }
}

/// Host-side writer for the mailbox and kernel configuration region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelConfig {
    pub kernel_config_base: u32,
    pub sem_offset: u16,
    pub cb_offset: u16,
    pub brisc_rta_offset: u16,
    pub ncrisc_rta_offset: u16,
    pub trisc_rta_offset: u16,
}

impl KernelConfig {
    /// Conventional layout at `base`: CB table, then semaphores, then
    /// 1 KB of arguments per core.
    pub fn at(base: u32) -> Self {
        let sem = addr_map::CIRCULAR_BUFFER_CONFIG_SIZE;
        let args = sem + addr_map::NUM_SEMAPHORES * addr_map::SEMAPHORE_ALIGNMENT;
        Self {
            kernel_config_base: base,
            cb_offset: 0,
            sem_offset: sem as u16,
            brisc_rta_offset: args as u16,
            ncrisc_rta_offset: (args + 1024) as u16,
            trisc_rta_offset: (args + 2048) as u16,
        }
    }

    pub fn write(&self, mem: &dyn Memory) -> Result<()> {
        mem.write_u32(MAILBOX_BASE_ADDR + KERNEL_CONFIG_BASE_OFFSET, self.kernel_config_base)?;
        for (offset, value) in [
            (SEM_OFFSET, self.sem_offset),
            (CB_OFFSET, self.cb_offset),
            (BRISC_RTA_OFFSET, self.brisc_rta_offset),
            (NCRISC_RTA_OFFSET, self.ncrisc_rta_offset),
            (TRISC_RTA_OFFSET, self.trisc_rta_offset),
        ] {
            mem.write(MAILBOX_BASE_ADDR + offset, &value.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read(mem: &dyn Memory) -> Result<Self> {
        let u16_at = |offset| mem.read_u16(MAILBOX_BASE_ADDR + offset);
        Ok(Self {
            kernel_config_base: kernel_config_base(mem)?,
            sem_offset: u16_at(SEM_OFFSET)?,
            cb_offset: u16_at(CB_OFFSET)?,
            brisc_rta_offset: u16_at(BRISC_RTA_OFFSET)?,
            ncrisc_rta_offset: u16_at(NCRISC_RTA_OFFSET)?,
            trisc_rta_offset: u16_at(TRISC_RTA_OFFSET)?,
        })
    }

    /// Write one CB table row. Requires the mailbox to be written first.
    pub fn write_cb(&self, mem: &dyn Memory, cb_id: u32, cfg: CbConfig) -> Result<()> {
        let addr = self.kernel_config_base + self.cb_offset as u32 + cb_id * addr_map::UINT32_WORDS_PER_CIRCULAR_BUFFER_CONFIG * 4;
        mem.write_u32_slice(addr, &[cfg.fifo_addr, cfg.fifo_size, cfg.fifo_num_pages, cfg.fifo_page_size])
    }

    /// Write runtime arguments of `kind`.
    pub fn write_args(&self, mem: &dyn Memory, kind: RiscKind, args: &[u32]) -> Result<()> {
        let offset = match kind {
            RiscKind::Brisc => self.brisc_rta_offset,
            RiscKind::Ncrisc => self.ncrisc_rta_offset,
            RiscKind::Trisc => self.trisc_rta_offset,
        };
        mem.write_u32_slice(self.kernel_config_base + offset as u32, args)
    }

    /// Set semaphore `id` to `value`.
    pub fn write_semaphore(&self, mem: &dyn Memory, id: u32, value: u32) -> Result<()> {
        mem.write_u32(self.kernel_config_base + self.sem_offset as u32 + 4 * id, value)
    }
}

/// Code and local-data placement of one core inside L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreLayout {
    pub code_base: u32,
    pub code_size: u32,
    pub local_base: u32,
    pub local_size: u32,
}

/// Per-core L1 placement for a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemMap {
    pub brisc: CoreLayout,
    pub ncrisc: CoreLayout,
    pub trisc: CoreLayout,
}

impl MemMap {
    /// Grayskull firmware layout. Locals live in L1 rather than core-local RAM.
    pub fn grayskull() -> Self {
        let mailbox_end = MAILBOX_BASE_ADDR + 5 * 2 * 1024 + 128 + 1600;
        let zeros_base = (mailbox_end + 31) & !31;
        let brisc_fw_base = zeros_base + 512;
        let brisc_fw_size = 10 * 1024;
        let trisc0_base = brisc_fw_base + brisc_fw_size;
        let trisc_size = 16 * 1024;
        let trisc2_end = trisc0_base + 3 * trisc_size;

        let brisc_local = trisc2_end;
        let ncrisc_local = brisc_local + 4 * 1024;
        let trisc0_local = ncrisc_local + 4 * 1024;
        // trisc1 and trisc2 locals, then NCRISC code moved out of IRAM
        let ncrisc_fw_base = trisc0_local + 3 * 2 * 1024;

        Self {
            brisc: CoreLayout { code_base: brisc_fw_base, code_size: brisc_fw_size, local_base: brisc_local, local_size: 4 * 1024 },
            ncrisc: CoreLayout { code_base: ncrisc_fw_base, code_size: 16 * 1024, local_base: ncrisc_local, local_size: 4 * 1024 },
            trisc: CoreLayout { code_base: trisc0_base, code_size: trisc_size, local_base: trisc0_local, local_size: 2 * 1024 },
        }
    }

    pub fn layout(&self, kind: RiscKind) -> CoreLayout {
        match kind {
            RiscKind::Brisc => self.brisc,
            RiscKind::Ncrisc => self.ncrisc,
            RiscKind::Trisc => self.trisc,
        }
    }
}

impl Default for MemMap {
    fn default() -> Self {
        Self::grayskull()
    }
}
