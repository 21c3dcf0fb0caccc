//! NoC engine: command-buffer model of the two network-on-chip interfaces.
//!
//! Every tile has two NoC interfaces, each with four command buffers. A
//! transaction is programmed by writing address, length and control
//! registers, then fired with [`Noc::write_cmd_ctrl_send_req`]. The engine
//! performs the copy immediately, so all flush and "ok to issue" stalls
//! complete at once.
//!
//! # Architecture
//!
//! ```text
//!   Dataflow API
//!        │  fast_read / fast_write / atomic_increment
//!        ▼
//!   ┌──────────────── NocEngine (tile x,y) ────────────────┐
//!   │  noc 0: [WR] [RD] [WR_REG] [AT]   counters           │
//!   │  noc 1: [WR] [RD] [WR_REG] [AT]   counters           │
//!   └──────────────────────┬───────────────────────────────┘
//!                          │ parse_noc_addr + per-NoC mirroring
//!                          ▼
//!            Soc: DRAM bank (addr % bank size) | worker L1
//! ```
//!
//! NoC 1 runs in the opposite direction, so coordinates it receives are
//! mirrored: `x = size_x - 1 - x'`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use smallvec::SmallVec;

use crate::device::arch_config::{CoreType, NocArch, NUM_NOCS};
use crate::device::memory::Memory;
use crate::device::soc::Soc;
use crate::error::{EmuError, Result};

pub const NUM_CMD_BUFS: u32 = 4;

pub const WR_CMD_BUF: u32 = 0;
pub const RD_CMD_BUF: u32 = 1;
pub const WR_REG_CMD_BUF: u32 = 2;
pub const AT_CMD_BUF: u32 = 3;

pub const UNICAST_WRITE_VC: u32 = 1;
pub const MULTICAST_WRITE_VC: u32 = 4;

/// Largest single transfer a command buffer moves.
pub const MAX_BURST_SIZE: u32 = 8192;

/// Hardware command registers of one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdRegs {
    pub targ_addr_lo: u32,
    pub targ_addr_mid: u32,
    pub ret_addr_lo: u32,
    pub ret_addr_mid: u32,
    pub at_len_be: u32,
    pub ctrl_vc: u32,
    pub ctrl_linked: bool,
    pub ctrl_mcast: bool,
    pub ctrl_src: bool,
    pub ctrl_non_posted: bool,
}

/// Routing options of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOpts {
    pub vc: u32,
    pub mcast: bool,
    pub linked: bool,
    pub num_dests: u32,
}

impl WriteOpts {
    /// Unicast write on the unicast virtual channel.
    pub fn unicast() -> Self {
        Self { vc: UNICAST_WRITE_VC, mcast: false, linked: false, num_dests: 1 }
    }

    /// Multicast write to `num_dests` cores.
    pub fn multicast(num_dests: u32, linked: bool) -> Self {
        Self { vc: MULTICAST_WRITE_VC, mcast: true, linked, num_dests }
    }
}

/// NoC interface of one tile.
///
/// Implementors provide the register writes and the transaction engine;
/// the `fast_*` sequences are shared.
pub trait Noc: Send + Sync + fmt::Debug {
    // ========================================================================
    // Stalls
    // ========================================================================

    fn wait_fast_read_ok(&self, noc: u32, cmd_buf: u32) -> Result<()>;
    fn wait_fast_write_ok(&self, noc: u32, cmd_buf: u32) -> Result<()>;
    fn wait_reads_flushed(&self, noc: u32) -> Result<()>;
    fn wait_nonposted_writes_flushed(&self, noc: u32) -> Result<()>;

    // ========================================================================
    // Registers
    // ========================================================================

    fn write_targ_addr_lo(&self, noc: u32, buf: u32, val: u32) -> Result<()>;
    fn write_targ_addr_mid(&self, noc: u32, buf: u32, val: u32) -> Result<()>;
    fn write_ret_addr_lo(&self, noc: u32, buf: u32, val: u32) -> Result<()>;
    fn write_ret_addr_mid(&self, noc: u32, buf: u32, val: u32) -> Result<()>;
    fn write_at_len_be(&self, noc: u32, buf: u32, val: u32) -> Result<()>;
    fn write_ctrl_cpy_wr(
        &self,
        noc: u32,
        buf: u32,
        vc: u32,
        linked: bool,
        mcast: bool,
        src: bool,
        non_posted: bool,
    ) -> Result<()>;

    /// Fire the programmed transaction.
    fn write_cmd_ctrl_send_req(&self, noc: u32, buf: u32) -> Result<()>;

    /// Atomic increment of the u32 at a NoC address, modulo `2^(wrap+1)`.
    fn atomic_increment(&self, noc: u32, cmd_buf: u32, addr: u64, incr: u32, wrap: u32, linked: bool) -> Result<()>;

    // ========================================================================
    // Counters
    // ========================================================================

    fn incr_reads_num_issued(&self, noc: u32, incr: u32) -> Result<()>;
    fn incr_nonposted_writes_num_issued(&self, noc: u32, incr: u32) -> Result<()>;
    fn incr_nonposted_writes_acked(&self, noc: u32, incr: u32) -> Result<()>;
    fn reads_num_issued(&self, noc: u32) -> Result<u32>;
    fn nonposted_writes_num_issued(&self, noc: u32) -> Result<u32>;
    fn nonposted_writes_acked(&self, noc: u32) -> Result<u32>;

    // ========================================================================
    // Transactions
    // ========================================================================

    fn max_burst_size(&self) -> u32 {
        MAX_BURST_SIZE
    }

    fn fast_read(&self, noc: u32, cmd_buf: u32, src_addr: u64, dest_addr: u32, len_bytes: u32) -> Result<()> {
        if len_bytes > 0 {
            self.write_ret_addr_lo(noc, cmd_buf, dest_addr)?;
            self.write_targ_addr_lo(noc, cmd_buf, src_addr as u32)?;
            self.write_targ_addr_mid(noc, cmd_buf, (src_addr >> 32) as u32)?;
            self.write_at_len_be(noc, cmd_buf, len_bytes)?;
            self.write_cmd_ctrl_send_req(noc, cmd_buf)?;
            self.incr_reads_num_issued(noc, 1)?;
        }
        Ok(())
    }

    fn fast_write(
        &self,
        noc: u32,
        cmd_buf: u32,
        src_addr: u32,
        dest_addr: u64,
        len_bytes: u32,
        opts: WriteOpts,
    ) -> Result<()> {
        issue_write(self, noc, cmd_buf, src_addr, dest_addr, len_bytes, opts, false)
    }

    /// Like [`fast_write`](Self::fast_write) but a multicast also lands on
    /// the sender.
    fn fast_write_loopback_src(
        &self,
        noc: u32,
        cmd_buf: u32,
        src_addr: u32,
        dest_addr: u64,
        len_bytes: u32,
        opts: WriteOpts,
    ) -> Result<()> {
        issue_write(self, noc, cmd_buf, src_addr, dest_addr, len_bytes, opts, true)
    }

    fn fast_read_any_len(
        &self,
        noc: u32,
        cmd_buf: u32,
        mut src_addr: u64,
        mut dest_addr: u32,
        mut len_bytes: u32,
    ) -> Result<()> {
        let size = self.max_burst_size();
        while len_bytes > size {
            self.wait_fast_read_ok(noc, cmd_buf)?;
            self.fast_read(noc, cmd_buf, src_addr, dest_addr, size)?;
            src_addr += size as u64;
            dest_addr += size;
            len_bytes -= size;
        }
        self.wait_fast_read_ok(noc, cmd_buf)?;
        self.fast_read(noc, cmd_buf, src_addr, dest_addr, len_bytes)
    }

    fn fast_write_any_len(
        &self,
        noc: u32,
        cmd_buf: u32,
        src_addr: u32,
        dest_addr: u64,
        len_bytes: u32,
        opts: WriteOpts,
    ) -> Result<()> {
        write_any_len(self, noc, cmd_buf, src_addr, dest_addr, len_bytes, opts, false)
    }

    fn fast_write_any_len_loopback_src(
        &self,
        noc: u32,
        cmd_buf: u32,
        src_addr: u32,
        dest_addr: u64,
        len_bytes: u32,
        opts: WriteOpts,
    ) -> Result<()> {
        write_any_len(self, noc, cmd_buf, src_addr, dest_addr, len_bytes, opts, true)
    }

    fn fast_atomic_increment(
        &self,
        noc: u32,
        cmd_buf: u32,
        addr: u64,
        incr: u32,
        wrap: u32,
        linked: bool,
    ) -> Result<()> {
        self.wait_fast_write_ok(noc, cmd_buf)?;
        self.atomic_increment(noc, cmd_buf, addr, incr, wrap, linked)
    }
}

#[allow(clippy::too_many_arguments)]
fn issue_write<N: Noc + ?Sized>(
    n: &N,
    noc: u32,
    cmd_buf: u32,
    src_addr: u32,
    dest_addr: u64,
    len_bytes: u32,
    opts: WriteOpts,
    loopback: bool,
) -> Result<()> {
    if len_bytes > 0 {
        n.write_ctrl_cpy_wr(noc, cmd_buf, opts.vc, opts.linked, opts.mcast, loopback, true)?;
        n.write_targ_addr_lo(noc, cmd_buf, src_addr)?;
        n.write_ret_addr_lo(noc, cmd_buf, dest_addr as u32)?;
        n.write_ret_addr_mid(noc, cmd_buf, (dest_addr >> 32) as u32)?;
        n.write_at_len_be(noc, cmd_buf, len_bytes)?;
        n.write_cmd_ctrl_send_req(noc, cmd_buf)?;
        n.incr_nonposted_writes_num_issued(noc, 1)?;
        n.incr_nonposted_writes_acked(noc, opts.num_dests)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_any_len<N: Noc + ?Sized>(
    n: &N,
    noc: u32,
    cmd_buf: u32,
    mut src_addr: u32,
    mut dest_addr: u64,
    mut len_bytes: u32,
    opts: WriteOpts,
    loopback: bool,
) -> Result<()> {
    let size = n.max_burst_size();
    while len_bytes > size {
        n.wait_fast_write_ok(noc, cmd_buf)?;
        issue_write(n, noc, cmd_buf, src_addr, dest_addr, size, opts, loopback)?;
        src_addr += size;
        dest_addr += size as u64;
        len_bytes -= size;
    }
    n.wait_fast_write_ok(noc, cmd_buf)?;
    issue_write(n, noc, cmd_buf, src_addr, dest_addr, len_bytes, opts, loopback)
}

// ============================================================================
// NocEngine
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct NocState {
    regs: [CmdRegs; NUM_CMD_BUFS as usize],
    reads_num_issued: u32,
    nonposted_writes_num_issued: u32,
    nonposted_writes_acked: u32,
}

/// Reference NoC engine of the tile at routing coordinate `(my_x, my_y)`.
pub struct NocEngine {
    soc: Arc<Soc>,
    arch: Arc<dyn NocArch>,
    my_x: u32,
    my_y: u32,
    state: Mutex<[NocState; NUM_NOCS as usize]>,
}

impl NocEngine {
    pub fn new(soc: Arc<Soc>, arch: Arc<dyn NocArch>, my_x: u32, my_y: u32) -> Self {
        Self { soc, arch, my_x, my_y, state: Mutex::new([NocState::default(); NUM_NOCS as usize]) }
    }

    fn lock(&self) -> MutexGuard<'_, [NocState; NUM_NOCS as usize]> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_noc(noc: u32) -> Result<usize> {
        if noc >= NUM_NOCS {
            return Err(EmuError::invariant(format!("NoC index {} out of range", noc)));
        }
        Ok(noc as usize)
    }

    fn check_buf(noc: u32, buf: u32) -> Result<(usize, usize)> {
        let noc = Self::check_noc(noc)?;
        if buf >= NUM_CMD_BUFS {
            return Err(EmuError::invariant(format!("command buffer {} out of range", buf)));
        }
        Ok((noc, buf as usize))
    }

    fn update_regs(&self, noc: u32, buf: u32, f: impl FnOnce(&mut CmdRegs)) -> Result<()> {
        let (noc, buf) = Self::check_buf(noc, buf)?;
        f(&mut self.lock()[noc].regs[buf]);
        Ok(())
    }

    fn update_counters(&self, noc: u32, f: impl FnOnce(&mut NocState)) -> Result<()> {
        let noc = Self::check_noc(noc)?;
        f(&mut self.lock()[noc]);
        Ok(())
    }

    /// Snapshot of one command buffer.
    pub fn cmd_regs(&self, noc: u32, buf: u32) -> Result<CmdRegs> {
        let (noc, buf) = Self::check_buf(noc, buf)?;
        Ok(self.lock()[noc].regs[buf])
    }

    /// Routing coordinate of this tile.
    pub fn my_xy(&self) -> (u32, u32) {
        (self.my_x, self.my_y)
    }

    #[inline]
    fn dec_noc_x(&self, noc: u32, x: u32) -> u32 {
        if noc == 0 {
            x
        } else {
            self.arch.noc_size_x().wrapping_sub(1).wrapping_sub(x)
        }
    }

    #[inline]
    fn dec_noc_y(&self, noc: u32, y: u32) -> u32 {
        if noc == 0 {
            y
        } else {
            self.arch.noc_size_y().wrapping_sub(1).wrapping_sub(y)
        }
    }

    /// Decode a unicast address into routing coordinates.
    pub fn parse_noc_addr(&self, noc: u32, noc_addr: u64) -> (u32, u32, u32) {
        let (x, y, addr) = self.arch.parse_noc_addr(noc_addr);
        (self.dec_noc_x(noc, x), self.dec_noc_y(noc, y), addr)
    }

    fn map_local(&self, addr: u32, len: u32) -> Result<Arc<dyn Memory>> {
        let size = self.soc.arch().worker_l1_size();
        if addr as u64 + len as u64 > size as u64 {
            return Err(EmuError::MemoryOutOfBounds { addr: addr as u64, len: len as usize, size: size as u64 });
        }
        self.soc.l1(self.my_x, self.my_y)
    }

    fn read(&self, noc: u32, src_addr: u64, dest_addr: u32, len: u32) -> Result<()> {
        let (x, y, addr) = self.parse_noc_addr(noc, src_addr);
        let (src, addr) = self.soc.map_remote(x, y, addr)?;
        let dest = self.map_local(dest_addr, len)?;
        log::trace!(
            "tile({},{}) noc{} read ({},{}):0x{:X} -> 0x{:X} len {}",
            self.my_x, self.my_y, noc, x, y, addr, dest_addr, len
        );
        dest.copy_from(dest_addr, src.as_ref(), addr, len)
    }

    fn write(&self, noc: u32, src_addr: u32, dest_addr: u64, len: u32) -> Result<()> {
        let src = self.map_local(src_addr, len)?;
        let (x, y, addr) = self.parse_noc_addr(noc, dest_addr);
        let (dest, addr) = self.soc.map_remote(x, y, addr)?;
        log::trace!(
            "tile({},{}) noc{} write 0x{:X} -> ({},{}):0x{:X} len {}",
            self.my_x, self.my_y, noc, src_addr, x, y, addr, len
        );
        dest.copy_from(addr, src.as_ref(), src_addr, len)
    }

    fn write_mcast(&self, noc: u32, src_addr: u32, dest_addr: u64, len: u32, loopback_src: bool) -> Result<()> {
        let src = self.map_local(src_addr, len)?;
        let mut data = vec![0u8; len as usize];
        src.read(src_addr, &mut data)?;

        let rect = self.arch.parse_noc_multicast_addr(dest_addr);
        let mut x_start = self.dec_noc_x(noc, rect.x_start);
        let mut y_start = self.dec_noc_y(noc, rect.y_start);
        let mut x_end = self.dec_noc_x(noc, rect.x_end);
        let mut y_end = self.dec_noc_y(noc, rect.y_end);
        // NoC 1 hands us the rectangle corner-swapped
        if x_start > x_end {
            std::mem::swap(&mut x_start, &mut x_end);
        }
        if y_start > y_end {
            std::mem::swap(&mut y_start, &mut y_end);
        }

        let soc_arch = self.soc.arch();
        let mut dests: SmallVec<[(u32, u32); 8]> = SmallVec::new();
        for x in x_start..=x_end {
            for y in y_start..=y_end {
                if soc_arch.core_type(x, y) != CoreType::Worker {
                    continue;
                }
                if !loopback_src && x == self.my_x && y == self.my_y {
                    continue;
                }
                dests.push((x, y));
            }
        }

        log::trace!(
            "tile({},{}) noc{} mcast 0x{:X} -> ({},{})..({},{}):0x{:X} len {} to {} cores",
            self.my_x, self.my_y, noc, src_addr, x_start, y_start, x_end, y_end, rect.addr, len, dests.len()
        );
        for (x, y) in dests {
            let (dest, addr) = self.soc.map_remote(x, y, rect.addr)?;
            dest.write(addr, &data)?;
        }
        Ok(())
    }
}

impl Noc for NocEngine {
    fn wait_fast_read_ok(&self, noc: u32, cmd_buf: u32) -> Result<()> {
        Self::check_buf(noc, cmd_buf).map(|_| ())
    }

    fn wait_fast_write_ok(&self, noc: u32, cmd_buf: u32) -> Result<()> {
        Self::check_buf(noc, cmd_buf).map(|_| ())
    }

    fn wait_reads_flushed(&self, noc: u32) -> Result<()> {
        Self::check_noc(noc).map(|_| ())
    }

    fn wait_nonposted_writes_flushed(&self, noc: u32) -> Result<()> {
        Self::check_noc(noc).map(|_| ())
    }

    fn write_targ_addr_lo(&self, noc: u32, buf: u32, val: u32) -> Result<()> {
        self.update_regs(noc, buf, |r| r.targ_addr_lo = val)
    }

    fn write_targ_addr_mid(&self, noc: u32, buf: u32, val: u32) -> Result<()> {
        self.update_regs(noc, buf, |r| r.targ_addr_mid = val)
    }

    fn write_ret_addr_lo(&self, noc: u32, buf: u32, val: u32) -> Result<()> {
        self.update_regs(noc, buf, |r| r.ret_addr_lo = val)
    }

    fn write_ret_addr_mid(&self, noc: u32, buf: u32, val: u32) -> Result<()> {
        self.update_regs(noc, buf, |r| r.ret_addr_mid = val)
    }

    fn write_at_len_be(&self, noc: u32, buf: u32, val: u32) -> Result<()> {
        self.update_regs(noc, buf, |r| r.at_len_be = val)
    }

    fn write_ctrl_cpy_wr(
        &self,
        noc: u32,
        buf: u32,
        vc: u32,
        linked: bool,
        mcast: bool,
        src: bool,
        non_posted: bool,
    ) -> Result<()> {
        self.update_regs(noc, buf, |r| {
            r.ctrl_vc = vc;
            r.ctrl_linked = linked;
            r.ctrl_mcast = mcast;
            r.ctrl_src = src;
            r.ctrl_non_posted = non_posted;
        })
    }

    fn write_cmd_ctrl_send_req(&self, noc: u32, buf: u32) -> Result<()> {
        let regs = self.cmd_regs(noc, buf)?;
        match buf {
            RD_CMD_BUF => {
                let src = ((regs.targ_addr_mid as u64) << 32) | regs.targ_addr_lo as u64;
                self.read(noc, src, regs.ret_addr_lo, regs.at_len_be)
            }
            WR_CMD_BUF => {
                let dest = ((regs.ret_addr_mid as u64) << 32) | regs.ret_addr_lo as u64;
                self.write(noc, regs.targ_addr_lo, dest, regs.at_len_be)
            }
            WR_REG_CMD_BUF => {
                let dest = ((regs.ret_addr_mid as u64) << 32) | regs.ret_addr_lo as u64;
                if regs.ctrl_mcast {
                    self.write_mcast(noc, regs.targ_addr_lo, dest, regs.at_len_be, regs.ctrl_src)
                } else {
                    self.write(noc, regs.targ_addr_lo, dest, regs.at_len_be)
                }
            }
            _ => Err(EmuError::invariant(format!("command buffer {} cannot be fired", buf))),
        }
    }

    fn atomic_increment(&self, noc: u32, cmd_buf: u32, addr: u64, incr: u32, wrap: u32, _linked: bool) -> Result<()> {
        Self::check_noc(noc)?;
        if cmd_buf != AT_CMD_BUF {
            return Err(EmuError::invariant(format!("atomic increment on command buffer {}", cmd_buf)));
        }
        let (x, y, local) = self.parse_noc_addr(noc, addr);
        let (mem, local) = self.soc.map_remote(x, y, local)?;
        let val = mem.read_u32(local)?;
        let new = if wrap >= 31 {
            val.wrapping_add(incr)
        } else {
            let mask = (1u32 << (wrap + 1)) - 1;
            (val & !mask).wrapping_add(((val & mask).wrapping_add(incr)) & mask)
        };
        log::trace!("tile({},{}) noc{} atomic ({},{}):0x{:X} {} -> {}", self.my_x, self.my_y, noc, x, y, local, val, new);
        mem.write_u32(local, new)
    }

    fn incr_reads_num_issued(&self, noc: u32, incr: u32) -> Result<()> {
        self.update_counters(noc, |s| s.reads_num_issued = s.reads_num_issued.wrapping_add(incr))
    }

    fn incr_nonposted_writes_num_issued(&self, noc: u32, incr: u32) -> Result<()> {
        self.update_counters(noc, |s| s.nonposted_writes_num_issued = s.nonposted_writes_num_issued.wrapping_add(incr))
    }

    fn incr_nonposted_writes_acked(&self, noc: u32, incr: u32) -> Result<()> {
        self.update_counters(noc, |s| s.nonposted_writes_acked = s.nonposted_writes_acked.wrapping_add(incr))
    }

    fn reads_num_issued(&self, noc: u32) -> Result<u32> {
        Ok(self.lock()[Self::check_noc(noc)?].reads_num_issued)
    }

    fn nonposted_writes_num_issued(&self, noc: u32) -> Result<u32> {
        Ok(self.lock()[Self::check_noc(noc)?].nonposted_writes_num_issued)
    }

    fn nonposted_writes_acked(&self, noc: u32) -> Result<u32> {
        Ok(self.lock()[Self::check_noc(noc)?].nonposted_writes_acked)
    }
}

impl fmt::Debug for NocEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NocEngine").field("x", &self.my_x).field("y", &self.my_y).finish()
    }
}
