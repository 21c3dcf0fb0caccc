//! Machine: the grid of Tensix tiles and everything they share.
//!
//! ```text
//!   Machine
//!   ├── Scheduler ─────────── 3 ThreadRunner workers per tile
//!   ├── Soc ───────────────── DRAM channels + every worker L1
//!   ├── NocArch / SocArch ─── injected architecture
//!   └── tiles[] ──────────── TensixImpl, logical column-major order
//! ```
//!
//! A launch is host driven: write the mailbox, CB table, arguments and start
//! PCs into each tile's L1, then call [`Machine::launch_kernels`]. It
//! returns once every logical core went idle or blocked for good.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::device::arch_config::{GridArch, NocArch, SocArch};
use crate::device::base_addr::{MemMap, RiscKind};
use crate::device::riscv::RiscvCluster;
use crate::device::soc::Soc;
use crate::device::tensix::{Tensix, TensixImpl, TileEnv};
use crate::error::{EmuError, Result};
use crate::schedule::Scheduler;

/// A logical core that was still inside a kernel when the scheduler went
/// quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyThread {
    pub logical_xy: (u32, u32),
    pub kind: RiscKind,
}

/// Top-level emulated device.
pub struct Machine {
    env: TileEnv,
    soc_arch: Arc<dyn SocArch>,
    tiles: Vec<Arc<TensixImpl>>,
    stopped: AtomicBool,
}

impl Machine {
    /// Build every worker tile described by `soc_arch`.
    pub fn new(noc_arch: Arc<dyn NocArch>, soc_arch: Arc<dyn SocArch>, cluster: &dyn RiscvCluster) -> Result<Self> {
        let env = TileEnv {
            sched: Arc::new(Scheduler::new()),
            soc: Arc::new(Soc::new(Arc::clone(&soc_arch))),
            noc_arch,
            mem_map: MemMap::grayskull(),
            curr_tile: Arc::new(AtomicUsize::new(usize::MAX)),
        };

        let mut tiles = Vec::new();
        for logical_x in 0..soc_arch.worker_x_size() {
            for logical_y in 0..soc_arch.worker_y_size() {
                tiles.push(TensixImpl::new(&env, cluster, tiles.len(), logical_x, logical_y)?);
            }
        }
        log::info!(
            "machine {}: {} worker tiles, {} DRAM channels",
            soc_arch.name(),
            tiles.len(),
            soc_arch.num_dram_channels()
        );

        Ok(Self { env, soc_arch, tiles, stopped: AtomicBool::new(false) })
    }

    /// Build from one [`GridArch`] serving as both architecture views.
    pub fn with_grid(arch: GridArch, cluster: &dyn RiscvCluster) -> Result<Self> {
        let arch = Arc::new(arch);
        Self::new(arch.clone(), arch, cluster)
    }

    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.env.sched
    }

    pub fn soc(&self) -> &Arc<Soc> {
        &self.env.soc
    }

    pub fn noc_arch(&self) -> &Arc<dyn NocArch> {
        &self.env.noc_arch
    }

    pub fn soc_arch(&self) -> &Arc<dyn SocArch> {
        &self.soc_arch
    }

    pub fn mem_map(&self) -> &MemMap {
        &self.env.mem_map
    }

    pub fn tiles(&self) -> &[Arc<TensixImpl>] {
        &self.tiles
    }

    /// Tile at a logical worker coordinate.
    pub fn worker(&self, logical_x: u32, logical_y: u32) -> Result<&Arc<TensixImpl>> {
        self.tiles
            .iter()
            .find(|t| t.logical_xy() == (logical_x, logical_y))
            .ok_or_else(|| EmuError::config(format!("no worker tile at logical ({}, {})", logical_x, logical_y)))
    }

    /// Tile at a routing coordinate.
    pub fn tensix_at(&self, x: u32, y: u32) -> Result<&Arc<TensixImpl>> {
        self.tiles
            .iter()
            .find(|t| t.my_xy() == (x, y))
            .ok_or_else(|| EmuError::config(format!("no worker tile at ({}, {})", x, y)))
    }

    /// Tile whose thread resumed most recently.
    pub fn curr_tensix(&self) -> Option<&Arc<TensixImpl>> {
        self.tiles.get(self.env.curr_tile.load(Ordering::Acquire))
    }

    /// Run one program on every tile.
    ///
    /// The first error from setup or from any kernel is returned after all
    /// tiles had their code regions cleared. Runners stay usable, so the
    /// machine can be relaunched or stopped after a failure.
    pub fn launch_kernels(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EmuError::invariant("machine is stopped"));
        }
        if let Err(e) = self.tiles.iter().try_for_each(|tile| tile.launch_kernels()) {
            // tiles launched so far consume their Go against cleared code
            for tile in &self.tiles {
                tile.kernels_done()?;
            }
            if let Err(drain) = self.env.sched.run() {
                log::warn!("draining runners after a failed launch: {}", drain);
            }
            return Err(e);
        }
        log::debug!("launched kernels on {} tiles", self.tiles.len());

        let mut outcome = self.env.sched.run();
        for tile in &self.tiles {
            let done = tile.kernels_done();
            if let Some(e) = tile.take_kernel_error() {
                outcome = outcome.and(Err(e));
            }
            outcome = outcome.and(done);
        }

        let busy = self.busy_threads();
        if !busy.is_empty() {
            log::warn!("{} logical cores still blocked after launch: {:?}", busy.len(), busy);
        }
        outcome
    }

    /// Logical cores parked inside a kernel.
    pub fn busy_threads(&self) -> Vec<BusyThread> {
        self.tiles
            .iter()
            .flat_map(|t| t.busy_threads().into_iter().map(move |kind| BusyThread { logical_xy: t.logical_xy(), kind }))
            .collect()
    }

    /// Signal every runner to exit and let them drain.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut outcome = Ok(());
        for tile in &self.tiles {
            if let Err(e) = tile.stop() {
                outcome = outcome.and(Err(e));
            }
        }
        outcome = outcome.and(self.env.sched.run());
        log::info!("machine {} stopped", self.soc_arch.name());
        outcome
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("machine stop failed: {}", e);
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("arch", &self.soc_arch.name())
            .field("tiles", &self.tiles.len())
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::arch_config::GridLayout;
    use crate::device::base_addr::{CbConfig, KernelConfig};
    use crate::device::format::DataFormat;
    use crate::device::riscv::{KernelRegistry, NativeCluster};
    use crate::device::tensix::TensixState;
    use crate::kernel::dataflow::BankKind;
    use crate::llk::pack_utils::{faces_to_tile, pack_tile, tile_to_faces, unpack_tile};
    use crate::llk::TILE_SIZE;

    const CONFIG_BASE: u32 = 110 * 1024;
    const CB_IN: u32 = 0;
    const CB_OUT: u32 = 16;
    const TILE_BYTES: u32 = 2048;

    fn machine() -> (Machine, Arc<KernelRegistry>) {
        let kernels = Arc::new(KernelRegistry::new());
        let cluster = NativeCluster::new(kernels.clone());
        let arch = GridArch::new(GridLayout::small()).unwrap();
        (Machine::with_grid(arch, &cluster).unwrap(), kernels)
    }

    fn configure(tile: &TensixImpl) -> KernelConfig {
        let l1 = tile.get_l1();
        let cfg = KernelConfig::at(CONFIG_BASE);
        cfg.write(l1.as_ref()).unwrap();
        cfg.write_cb(l1.as_ref(), CB_IN, CbConfig::from_bytes(200 * 1024, 2, TILE_BYTES)).unwrap();
        cfg.write_cb(l1.as_ref(), CB_OUT, CbConfig::from_bytes(220 * 1024, 2, TILE_BYTES)).unwrap();
        cfg
    }

    fn input_tile(t: u32) -> Vec<f32> {
        (0..TILE_SIZE).map(|i| (i % 7) as f32 - 3.0 + t as f32).collect()
    }

    #[test]
    fn test_construction() {
        let (m, _) = machine();
        assert_eq!(m.tiles().len(), 9);
        assert_eq!(m.sched().num_workers(), 27);
        assert_eq!(m.worker(2, 0).unwrap().my_xy(), (3, 1));
        assert_eq!(m.tensix_at(1, 3).unwrap().logical_xy(), (0, 2));
        assert!(m.worker(3, 0).is_err());
        assert!(m.tensix_at(0, 0).is_err());
        assert!(m.curr_tensix().is_none());
    }

    #[test]
    fn test_reader_compute_writer_pipeline() {
        let (m, kernels) = machine();
        let tile = m.worker(0, 0).unwrap();
        let cfg = configure(tile);
        let l1 = tile.get_l1();
        const NUM_TILES: u32 = 4;
        const IN_BASE: u32 = 0x1_0000;
        const OUT_BASE: u32 = 0x8_0000;

        // interleaved input: page t lives in bank t % 2, row t / 2
        for t in 0..NUM_TILES {
            let mut faces = vec![0.0; TILE_SIZE];
            tile_to_faces(&input_tile(t), &mut faces);
            let bytes = pack_tile(DataFormat::Float16B, &faces).unwrap();
            m.soc().dram(t % 2).unwrap().write(IN_BASE + (t / 2) * TILE_BYTES, &bytes).unwrap();
        }
        cfg.write_args(l1.as_ref(), RiscKind::Ncrisc, &[IN_BASE, NUM_TILES]).unwrap();
        cfg.write_args(l1.as_ref(), RiscKind::Trisc, &[NUM_TILES]).unwrap();
        cfg.write_args(l1.as_ref(), RiscKind::Brisc, &[OUT_BASE, NUM_TILES]).unwrap();

        let reader = kernels.register(|api| {
            let df = api.dataflow()?;
            let base = df.get_arg_uint32(0)?;
            let n = df.get_arg_uint32(1)?;
            for t in 0..n {
                df.cb_reserve_back(CB_IN, 1)?;
                let dst = df.get_write_ptr(CB_IN)?;
                df.noc_async_read_tile(t, BankKind::Dram, base, TILE_BYTES, DataFormat::Float16B, dst, 0)?;
                df.noc_async_read_barrier()?;
                df.cb_push_back(CB_IN, 1)?;
            }
            Ok(())
        });
        let compute = kernels.register(|api| {
            let c = api.compute()?;
            let n = c.get_arg_uint32(0)?;
            for _ in 0..n {
                c.cb_wait_front(CB_IN, 1)?;
                c.tile_regs_acquire()?;
                c.copy_tile(CB_IN, 0, 0)?;
                c.square_tile(0)?;
                c.tile_regs_commit()?;
                c.cb_pop_front(CB_IN, 1)?;

                c.cb_reserve_back(CB_OUT, 1)?;
                c.tile_regs_wait()?;
                c.pack_tile(0, CB_OUT)?;
                c.tile_regs_release()?;
                c.cb_push_back(CB_OUT, 1)?;
            }
            Ok(())
        });
        let writer = kernels.register(|api| {
            let df = api.dataflow()?;
            let base = df.get_arg_uint32(0)?;
            let n = df.get_arg_uint32(1)?;
            for t in 0..n {
                df.cb_wait_front(CB_OUT, 1)?;
                let src = df.get_read_ptr(CB_OUT)?;
                df.noc_async_write_tile(t, BankKind::Dram, base, TILE_BYTES, DataFormat::Float16B, src)?;
                df.noc_async_write_barrier()?;
                df.cb_pop_front(CB_OUT, 1)?;
            }
            Ok(())
        });
        tile.load_kernel(RiscKind::Ncrisc, reader).unwrap();
        tile.load_kernel(RiscKind::Trisc, compute).unwrap();
        tile.load_kernel(RiscKind::Brisc, writer).unwrap();

        m.launch_kernels().unwrap();
        assert!(m.busy_threads().is_empty());
        assert_eq!(tile.state(), TensixState::Idle);

        for t in 0..NUM_TILES {
            let mut bytes = vec![0u8; TILE_BYTES as usize];
            m.soc().dram(t % 2).unwrap().read(OUT_BASE + (t / 2) * TILE_BYTES, &mut bytes).unwrap();
            let mut faces = vec![0.0; TILE_SIZE];
            unpack_tile(DataFormat::Float16B, &bytes, &mut faces).unwrap();
            let mut out = vec![0.0; TILE_SIZE];
            faces_to_tile(&faces, &mut out);
            let expected: Vec<f32> = input_tile(t).iter().map(|x| x * x).collect();
            assert_eq!(out, expected, "tile {}", t);
        }

        // code regions were cleared
        for kind in RiscKind::ALL {
            assert_eq!(l1.read_u32(tile.core(kind).code_base()).unwrap(), 0);
        }
    }

    #[test]
    fn test_semaphore_handshake_between_tiles() {
        let (m, kernels) = machine();
        let receiver = m.worker(0, 0).unwrap();
        let sender = m.worker(1, 1).unwrap();
        let rcfg = configure(receiver);
        let scfg = configure(sender);
        let (rx, ry) = receiver.my_xy();

        const DATA_ADDR: u32 = 0x3_0000;
        const RESULT_ADDR: u32 = 0x3_1000;
        sender.get_l1().write_u32_slice(DATA_ADDR, &[5, 6, 7, 8]).unwrap();
        scfg.write_args(sender.get_l1().as_ref(), RiscKind::Brisc, &[rx, ry]).unwrap();

        let wait_kernel = kernels.register(|api| {
            let df = api.dataflow()?;
            let sem = df.get_semaphore(0)?;
            df.noc_semaphore_wait(sem, 1)?;
            df.noc_semaphore_set(sem, 0)?;
            // the payload landed before the semaphore did
            let local = df.get_noc_addr_local(RESULT_ADDR);
            df.noc_async_write(DATA_ADDR, local, 16)?;
            df.noc_async_write_barrier()
        });
        let send_kernel = kernels.register(|api| {
            let df = api.dataflow()?;
            let (x, y) = (df.get_arg_uint32(0)?, df.get_arg_uint32(1)?);
            df.noc_async_write(DATA_ADDR, df.get_noc_addr_remote(x, y, DATA_ADDR), 16)?;
            df.noc_async_write_barrier()?;
            let sem = df.get_semaphore(0)?;
            df.noc_semaphore_inc(df.get_noc_addr_remote(x, y, sem), 1)?;
            Ok(())
        });
        receiver.load_kernel(RiscKind::Brisc, wait_kernel).unwrap();
        sender.load_kernel(RiscKind::Brisc, send_kernel).unwrap();

        m.launch_kernels().unwrap();
        let l1 = receiver.get_l1();
        assert_eq!(l1.read_u32_slice(RESULT_ADDR, 4).unwrap(), vec![5, 6, 7, 8]);
        assert_eq!(l1.read_u32(CONFIG_BASE + rcfg.sem_offset as u32).unwrap(), 0);
        assert!(m.curr_tensix().is_some());
    }

    #[test]
    fn test_relaunch_runs_reloaded_kernels_only() {
        let (m, kernels) = machine();
        let tile = m.worker(2, 2).unwrap();
        configure(tile);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let pc = kernels.register(move |_| {
            counter.fetch_add(1, Ordering::AcqRel);
            Ok(())
        });

        tile.load_kernel(RiscKind::Trisc, pc).unwrap();
        m.launch_kernels().unwrap();
        assert_eq!(runs.load(Ordering::Acquire), 1);

        // code was cleared, so nothing runs
        m.launch_kernels().unwrap();
        assert_eq!(runs.load(Ordering::Acquire), 1);

        tile.load_kernel(RiscKind::Trisc, pc).unwrap();
        tile.load_kernel(RiscKind::Ncrisc, pc).unwrap();
        m.launch_kernels().unwrap();
        assert_eq!(runs.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_blocked_kernel_is_reported_busy() {
        let (m, kernels) = machine();
        let tile = m.worker(0, 1).unwrap();
        configure(tile);
        let pc = kernels.register(|api| api.compute()?.cb_wait_front(CB_IN, 1));
        tile.load_kernel(RiscKind::Trisc, pc).unwrap();

        m.launch_kernels().unwrap();
        assert_eq!(m.busy_threads(), vec![BusyThread { logical_xy: (0, 1), kind: RiscKind::Trisc }]);
    }

    #[test]
    fn test_kernel_error_propagates() {
        let (m, kernels) = machine();
        let tile = m.worker(1, 0).unwrap();
        configure(tile);
        let pc = kernels.register(|api| {
            api.compute()?;
            Ok(())
        });
        // a compute kernel loaded on a data-movement core
        tile.load_kernel(RiscKind::Brisc, pc).unwrap();

        let err = m.launch_kernels().unwrap_err();
        assert!(matches!(err, EmuError::InvariantViolation(_)));
        assert_eq!(tile.state(), TensixState::Idle);
    }

    #[test]
    fn test_relaunch_and_stop_after_kernel_error() {
        let (m, kernels) = machine();
        let tile = m.worker(1, 0).unwrap();
        configure(tile);
        let bad = kernels.register(|api| {
            api.compute()?;
            Ok(())
        });
        tile.load_kernel(RiscKind::Brisc, bad).unwrap();
        assert!(m.launch_kernels().is_err());
        assert!(tile.runner(RiscKind::Brisc).take_failure().is_none());

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let good = kernels.register(move |api| {
            api.dataflow()?;
            counter.fetch_add(1, Ordering::AcqRel);
            Ok(())
        });
        tile.load_kernel(RiscKind::Brisc, good).unwrap();
        m.launch_kernels().unwrap();
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert!(m.busy_threads().is_empty());

        tile.load_kernel(RiscKind::Brisc, good).unwrap();
        m.launch_kernels().unwrap();
        assert_eq!(runs.load(Ordering::Acquire), 2);

        m.stop().unwrap();
        assert!(m.tiles().iter().all(|t| t.state() == TensixState::Terminated));
        assert!(RiscKind::ALL.iter().all(|&k| tile.runner(k).has_exited()));
    }

    #[test]
    fn test_stop_terminates_tiles() {
        let (m, _) = machine();
        m.stop().unwrap();
        assert!(m.tiles().iter().all(|t| t.state() == TensixState::Terminated));
        assert!(m.launch_kernels().is_err());
        // second stop is a no-op
        m.stop().unwrap();
    }
}
