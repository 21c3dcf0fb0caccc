//! Tensix tile: three logical cores sharing one L1, one CB engine and one
//! NoC engine.
//!
//! ```text
//!   ┌──────────────────────── TensixImpl ────────────────────────┐
//!   │  Thread[0] BRISC   Dataflow (NoC 0)  ◄── ThreadRunner[0]   │
//!   │  Thread[1] TRISC   Compute           ◄── ThreadRunner[1]   │
//!   │  Thread[2] NCRISC  Dataflow (NoC 1)  ◄── ThreadRunner[2]   │
//!   │                                                            │
//!   │  L1 (Soc bank)     CbEngine          NocEngine             │
//!   └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each [`ThreadRunner`] is a scheduler worker that loops forever: it
//! parks until the tile signals `Go` or `Stop`, and on `Go` runs the kernel
//! whose start PC sits at the head of its core's code region.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::device::arch_config::NocArch;
use crate::device::base_addr::{self, addr_map, MemMap, RiscKind};
use crate::device::cb::{Cb, CbEngine, NUM_CIRCULAR_BUFFERS};
use crate::device::format::DataFormat;
use crate::device::memory::Memory;
use crate::device::noc::NocEngine;
use crate::device::riscv::{RiscvCluster, RiscvCore, ThreadApi};
use crate::device::soc::Soc;
use crate::error::{EmuError, Result};
use crate::kernel::{Compute, ComputeImpl, Dataflow, DataflowImpl};
use crate::schedule::{Scheduler, Worker};

/// Words of per-thread argument scratch.
pub const THREAD_ARG_WORDS: usize = 256;

/// Format installed on every CB channel at launch.
pub const DEFAULT_CB_FORMAT: DataFormat = DataFormat::Float16B;

const NO_THREAD: usize = usize::MAX;

// ============================================================================
// Thread
// ============================================================================

/// One logical core: its API instance, activity flag and argument scratch.
#[derive(Debug)]
pub struct Thread {
    kind: RiscKind,
    api: ThreadApi,
    active: AtomicBool,
    args: Mutex<Vec<u32>>,
}

impl Thread {
    pub fn new(kind: RiscKind, api: ThreadApi) -> Self {
        Self {
            kind,
            api,
            active: AtomicBool::new(false),
            args: Mutex::new(vec![0; THREAD_ARG_WORDS]),
        }
    }

    pub fn kind(&self) -> RiscKind {
        self.kind
    }

    pub fn api(&self) -> &ThreadApi {
        &self.api
    }

    /// True while a kernel runs on this thread.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn set_arg(&self, index: usize, value: u32) -> Result<()> {
        let mut args = self.args.lock().unwrap_or_else(|e| e.into_inner());
        let slot = args
            .get_mut(index)
            .ok_or_else(|| EmuError::invariant(format!("thread argument {} out of range", index)))?;
        *slot = value;
        Ok(())
    }

    pub fn get_arg(&self, index: usize) -> Result<u32> {
        let args = self.args.lock().unwrap_or_else(|e| e.into_inner());
        args.get(index)
            .copied()
            .ok_or_else(|| EmuError::invariant(format!("thread argument {} out of range", index)))
    }
}

// ============================================================================
// ThreadRunner
// ============================================================================

/// Pending request for a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Go,
    Stop,
}

/// Scheduler worker driving one thread of a tile.
pub struct ThreadRunner {
    sched: Arc<Scheduler>,
    tensix: Weak<TensixImpl>,
    thread: Arc<Thread>,
    core: Arc<dyn RiscvCore>,
    l1: Arc<dyn Memory>,
    signal: Mutex<Signal>,
    /// First kernel error since the host last collected it.
    failure: Mutex<Option<EmuError>>,
    exited: AtomicBool,
}

impl ThreadRunner {
    fn lock_signal(&self) -> MutexGuard<'_, Signal> {
        self.signal.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn signal(&self) -> Signal {
        *self.lock_signal()
    }

    /// Request one kernel run.
    pub fn go(&self) -> Result<()> {
        self.raise(Signal::Go)
    }

    /// Request the runner to leave its loop. A runner that already left
    /// accepts this as a no-op.
    pub fn stop(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.raise(Signal::Stop)
    }

    /// Whether the worker returned from its loop.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Take the error of the last failed kernel, if any.
    pub fn take_failure(&self) -> Option<EmuError> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn raise(&self, signal: Signal) -> Result<()> {
        if self.has_exited() {
            return Err(EmuError::invariant(format!(
                "{}: runner has exited, cannot signal {:?}",
                self.thread.kind().name(),
                signal
            )));
        }
        let mut current = self.lock_signal();
        if *current != Signal::None {
            return Err(EmuError::invariant(format!(
                "{}: cannot signal {:?} while {:?} is pending",
                self.thread.kind().name(),
                signal,
                *current
            )));
        }
        *current = signal;
        Ok(())
    }

    fn start_pc(&self) -> Result<u32> {
        self.l1.read_u32(self.core.code_base())
    }

    /// Serve signals until `Stop`. A failing kernel is recorded and the
    /// runner goes back to waiting for the next signal.
    pub fn main_loop(&self) -> Result<()> {
        loop {
            self.sched.wait(|| *self.lock_signal() != Signal::None)?;
            {
                let mut signal = self.lock_signal();
                if *signal == Signal::Stop {
                    break;
                }
                *signal = Signal::None;
            }

            let start_pc = self.start_pc()?;
            if start_pc == 0 {
                continue;
            }
            self.thread.set_active(true);
            self.thread.api().reset();
            let outcome = self.core.run(start_pc, self.thread.api());
            self.thread.set_active(false);
            if let Err(err) = outcome {
                log::warn!("{} kernel at pc 0x{:X} failed: {}", self.thread.kind().name(), start_pc, err);
                let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
                if failure.is_none() {
                    *failure = Some(err);
                }
            }
        }
        log::trace!("{} runner stopped", self.thread.kind().name());
        Ok(())
    }
}

impl Worker for ThreadRunner {
    fn run(&self) -> Result<()> {
        let outcome = self.main_loop();
        self.exited.store(true, Ordering::Release);
        outcome
    }

    fn on_resume(&self) {
        if let Some(tensix) = self.tensix.upgrade() {
            tensix.set_curr_thread(self.thread.kind().index());
        }
    }
}

impl fmt::Debug for ThreadRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRunner")
            .field("kind", &self.thread.kind())
            .field("signal", &self.signal())
            .field("active", &self.thread.is_active())
            .finish()
    }
}

// ============================================================================
// Tensix
// ============================================================================

/// Lifecycle of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensixState {
    Idle,
    Running,
    Terminated,
}

/// Tile interface seen by the machine and by kernel dispatch.
pub trait Tensix: Send + Sync + fmt::Debug {
    /// Routing coordinate.
    fn my_xy(&self) -> (u32, u32);

    fn get_l1(&self) -> Arc<dyn Memory>;

    fn set_curr_thread(&self, index: usize);

    /// Index of the thread that last resumed on this tile.
    fn curr_thread(&self) -> Option<usize>;

    /// Compute API of the current thread.
    fn get_compute_api(&self) -> Result<Arc<dyn Compute>>;

    /// Dataflow API of the current thread.
    fn get_dataflow_api(&self) -> Result<Arc<dyn Dataflow>>;

    /// Install the CB table from L1 and signal every runner.
    fn launch_kernels(&self) -> Result<()>;

    /// Clear code regions after all runners went idle.
    fn kernels_done(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn state(&self) -> TensixState;
}

/// Machine-wide resources a tile is built from.
#[derive(Debug, Clone)]
pub struct TileEnv {
    pub sched: Arc<Scheduler>,
    pub soc: Arc<Soc>,
    pub noc_arch: Arc<dyn NocArch>,
    pub mem_map: MemMap,
    /// Index of the tile that last resumed a thread.
    pub curr_tile: Arc<AtomicUsize>,
}

/// Reference tile.
pub struct TensixImpl {
    index: usize,
    logical_xy: (u32, u32),
    my_xy: (u32, u32),
    l1: Arc<dyn Memory>,
    cb: Arc<CbEngine>,
    noc: Arc<NocEngine>,
    cores: Vec<Arc<dyn RiscvCore>>,
    threads: Vec<Arc<Thread>>,
    runners: Vec<Arc<ThreadRunner>>,
    worker_ids: Vec<usize>,
    curr_thread: AtomicUsize,
    curr_tile: Arc<AtomicUsize>,
    state: Mutex<TensixState>,
}

impl TensixImpl {
    /// Build the worker tile at a logical coordinate and register its
    /// runners with the scheduler. `index` identifies the tile machine-wide.
    pub fn new(
        env: &TileEnv,
        cluster: &dyn RiscvCluster,
        index: usize,
        logical_x: u32,
        logical_y: u32,
    ) -> Result<Arc<Self>> {
        let soc_arch = env.soc.arch();
        let my_x = soc_arch.worker_logical_to_routing_x(logical_x)?;
        let my_y = soc_arch.worker_logical_to_routing_y(logical_y)?;
        let l1 = env.soc.l1(my_x, my_y)?;
        let cb = Arc::new(CbEngine::new(Arc::clone(&env.sched)));
        let noc = Arc::new(NocEngine::new(Arc::clone(&env.soc), Arc::clone(&env.noc_arch), my_x, my_y));

        let mut cores = Vec::with_capacity(RiscKind::ALL.len());
        let mut threads = Vec::with_capacity(RiscKind::ALL.len());
        for kind in RiscKind::ALL {
            let core = cluster.create_core(Arc::clone(&l1), kind);
            core.set_memory_layout(env.mem_map.layout(kind));
            cores.push(core);

            let api = match kind.noc_index() {
                Some(noc_index) => ThreadApi::Dataflow(Arc::new(DataflowImpl::new(
                    Arc::clone(&env.sched),
                    Arc::clone(&l1),
                    cb.clone(),
                    Arc::clone(&env.noc_arch),
                    noc.clone(),
                    kind,
                    noc_index,
                    my_x,
                    my_y,
                ))),
                None => ThreadApi::Compute(Arc::new(ComputeImpl::new(Arc::clone(&l1), cb.clone()))),
            };
            threads.push(Arc::new(Thread::new(kind, api)));
        }

        let tensix = Arc::new_cyclic(|weak: &Weak<TensixImpl>| {
            let runners = RiscKind::ALL
                .iter()
                .map(|kind| {
                    Arc::new(ThreadRunner {
                        sched: Arc::clone(&env.sched),
                        tensix: weak.clone(),
                        thread: Arc::clone(&threads[kind.index()]),
                        core: Arc::clone(&cores[kind.index()]),
                        l1: Arc::clone(&l1),
                        signal: Mutex::new(Signal::None),
                        failure: Mutex::new(None),
                        exited: AtomicBool::new(false),
                    })
                })
                .collect::<Vec<_>>();
            let worker_ids = runners
                .iter()
                .map(|runner| env.sched.add_worker(Arc::clone(runner) as Arc<dyn Worker>))
                .collect();
            TensixImpl {
                index,
                logical_xy: (logical_x, logical_y),
                my_xy: (my_x, my_y),
                l1: Arc::clone(&l1),
                cb,
                noc,
                cores,
                threads,
                runners,
                worker_ids,
                curr_thread: AtomicUsize::new(NO_THREAD),
                curr_tile: Arc::clone(&env.curr_tile),
                state: Mutex::new(TensixState::Idle),
            }
        });
        log::debug!("tensix ({}, {}) at routing ({}, {})", logical_x, logical_y, my_x, my_y);
        Ok(tensix)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn logical_xy(&self) -> (u32, u32) {
        self.logical_xy
    }

    pub fn cb(&self) -> &Arc<CbEngine> {
        &self.cb
    }

    pub fn noc(&self) -> &Arc<NocEngine> {
        &self.noc
    }

    pub fn core(&self, kind: RiscKind) -> &Arc<dyn RiscvCore> {
        &self.cores[kind.index()]
    }

    pub fn thread(&self, kind: RiscKind) -> &Arc<Thread> {
        &self.threads[kind.index()]
    }

    pub fn runner(&self, kind: RiscKind) -> &Arc<ThreadRunner> {
        &self.runners[kind.index()]
    }

    /// Scheduler worker index of each runner, in thread order.
    pub fn worker_ids(&self) -> &[usize] {
        &self.worker_ids
    }

    /// Point a core at a kernel for the next launch.
    pub fn load_kernel(&self, kind: RiscKind, start_pc: u32) -> Result<()> {
        self.core(kind).write_code(&start_pc.to_le_bytes())
    }

    /// First kernel error recorded by any thread since the last call.
    /// Clears the errors of every thread.
    pub fn take_kernel_error(&self) -> Option<EmuError> {
        self.runners.iter().filter_map(|r| r.take_failure()).fold(None, |first, e| first.or(Some(e)))
    }

    /// Threads that are inside a kernel.
    pub fn busy_threads(&self) -> Vec<RiscKind> {
        self.threads.iter().filter(|t| t.is_active()).map(|t| t.kind()).collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, TensixState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy the mailbox CB table into the CB engine.
    fn setup_cb(&self) -> Result<()> {
        let base = base_addr::cb_base(self.l1.as_ref())?;
        let stride = addr_map::UINT32_WORDS_PER_CIRCULAR_BUFFER_CONFIG * 4;
        for cb_id in 0..NUM_CIRCULAR_BUFFERS {
            let entry = self
                .l1
                .read_u32_slice(base + cb_id * stride, addr_map::UINT32_WORDS_PER_CIRCULAR_BUFFER_CONFIG as usize)?;
            self.cb.setup_read_write_interfaces(cb_id, entry[0], entry[1], entry[2], entry[3])?;
            self.cb.setup_data_formats(cb_id, DEFAULT_CB_FORMAT, DEFAULT_CB_FORMAT, DEFAULT_CB_FORMAT, DEFAULT_CB_FORMAT)?;
        }
        Ok(())
    }

    fn clear_code(&self) -> Result<()> {
        for core in &self.cores {
            self.l1.fill(core.code_base(), core.code_size(), 0)?;
        }
        Ok(())
    }

    fn current(&self) -> Result<&Arc<Thread>> {
        let index = self.curr_thread.load(Ordering::Acquire);
        self.threads
            .get(index)
            .ok_or_else(|| EmuError::invariant("no thread is current on this tile"))
    }
}

impl Tensix for TensixImpl {
    fn my_xy(&self) -> (u32, u32) {
        self.my_xy
    }

    fn get_l1(&self) -> Arc<dyn Memory> {
        Arc::clone(&self.l1)
    }

    fn set_curr_thread(&self, index: usize) {
        self.curr_thread.store(index, Ordering::Release);
        self.curr_tile.store(self.index, Ordering::Release);
    }

    fn curr_thread(&self) -> Option<usize> {
        match self.curr_thread.load(Ordering::Acquire) {
            NO_THREAD => None,
            index => Some(index),
        }
    }

    fn get_compute_api(&self) -> Result<Arc<dyn Compute>> {
        match self.current()?.api() {
            ThreadApi::Compute(api) => Ok(Arc::clone(api)),
            ThreadApi::Dataflow(_) => Err(EmuError::invariant("current thread has no compute API")),
        }
    }

    fn get_dataflow_api(&self) -> Result<Arc<dyn Dataflow>> {
        match self.current()?.api() {
            ThreadApi::Dataflow(api) => Ok(Arc::clone(api)),
            ThreadApi::Compute(_) => Err(EmuError::invariant("current thread has no dataflow API")),
        }
    }

    fn launch_kernels(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state == TensixState::Terminated {
                return Err(EmuError::invariant(format!("tensix {:?} is terminated", self.logical_xy)));
            }
            *state = TensixState::Running;
        }
        self.setup_cb()?;
        for runner in &self.runners {
            runner.go()?;
        }
        log::debug!("tensix {:?}: kernels launched", self.logical_xy);
        Ok(())
    }

    fn kernels_done(&self) -> Result<()> {
        self.clear_code()?;
        let mut state = self.lock_state();
        if *state == TensixState::Running {
            *state = TensixState::Idle;
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut outcome = Ok(());
        for runner in &self.runners {
            if let Err(e) = runner.stop() {
                outcome = outcome.and(Err(e));
            }
        }
        *self.lock_state() = TensixState::Terminated;
        outcome
    }

    fn state(&self) -> TensixState {
        *self.lock_state()
    }
}

impl fmt::Debug for TensixImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensixImpl")
            .field("logical_xy", &self.logical_xy)
            .field("my_xy", &self.my_xy)
            .field("state", &self.state())
            .field("curr_thread", &self.curr_thread())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::arch_config::{GridArch, GridLayout};
    use crate::device::base_addr::{CbConfig, KernelConfig};
    use crate::device::riscv::NativeCluster;

    fn tile() -> (TileEnv, NativeCluster, Arc<TensixImpl>) {
        let arch = Arc::new(GridArch::new(GridLayout::small()).unwrap());
        let env = TileEnv {
            sched: Arc::new(Scheduler::new()),
            soc: Arc::new(Soc::new(arch.clone())),
            noc_arch: arch,
            mem_map: MemMap::grayskull(),
            curr_tile: Arc::new(AtomicUsize::new(NO_THREAD)),
        };
        let cluster = NativeCluster::default();
        let tensix = TensixImpl::new(&env, &cluster, 4, 1, 2).unwrap();
        (env, cluster, tensix)
    }

    #[test]
    fn test_construction() {
        let (env, _, t) = tile();
        assert_eq!(t.my_xy(), (2, 3));
        assert_eq!(t.logical_xy(), (1, 2));
        assert_eq!(env.sched.num_workers(), 3);
        assert_eq!(t.worker_ids(), &[0, 1, 2]);
        assert!(t.thread(RiscKind::Trisc).api().compute().is_ok());
        assert!(t.thread(RiscKind::Ncrisc).api().dataflow().is_ok());
        assert_eq!(t.core(RiscKind::Brisc).code_base(), MemMap::grayskull().brisc.code_base);
        assert_eq!(t.state(), TensixState::Idle);
        assert_eq!(t.curr_thread(), None);
        assert!(t.get_compute_api().is_err());
    }

    #[test]
    fn test_thread_args() {
        let (_, _, t) = tile();
        let thread = t.thread(RiscKind::Brisc);
        thread.set_arg(255, 7).unwrap();
        assert_eq!(thread.get_arg(255).unwrap(), 7);
        assert!(thread.set_arg(256, 1).is_err());
        assert!(thread.get_arg(256).is_err());
    }

    #[test]
    fn test_runner_signals() {
        let (_, _, t) = tile();
        let runner = t.runner(RiscKind::Trisc);
        assert_eq!(runner.signal(), Signal::None);
        runner.go().unwrap();
        assert_eq!(runner.signal(), Signal::Go);
        assert!(matches!(runner.go(), Err(EmuError::InvariantViolation(_))));
        assert!(runner.stop().is_err());
    }

    #[test]
    fn test_current_thread_selects_api() {
        let (env, _, t) = tile();
        t.set_curr_thread(RiscKind::Trisc.index());
        assert_eq!(t.curr_thread(), Some(1));
        assert_eq!(env.curr_tile.load(Ordering::Acquire), 4);
        assert!(t.get_compute_api().is_ok());
        assert!(t.get_dataflow_api().is_err());

        t.set_curr_thread(RiscKind::Ncrisc.index());
        assert!(t.get_dataflow_api().is_ok());
    }

    #[test]
    fn test_setup_cb_reads_mailbox_table() {
        let (_, _, t) = tile();
        let l1 = t.get_l1();
        let cfg = KernelConfig::at(110 * 1024);
        cfg.write(l1.as_ref()).unwrap();
        cfg.write_cb(l1.as_ref(), 5, CbConfig::from_bytes(0x40000, 4, 2048)).unwrap();

        t.launch_kernels().unwrap();
        assert_eq!(t.state(), TensixState::Running);
        let iface = t.cb().interface(5).unwrap();
        assert_eq!(iface.fifo_rd_ptr, 0x4000);
        assert_eq!(iface.fifo_limit, 0x4000 + 0x200);
        assert_eq!(iface.fifo_num_pages, 4);
        assert_eq!(t.cb().get_pack_dst_format(5).unwrap(), DataFormat::Float16B);
        assert_eq!(t.cb().get_tile_size(5).unwrap(), 2048);
        // every runner now has a pending Go
        assert!(RiscKind::ALL.iter().all(|&k| t.runner(k).signal() == Signal::Go));
    }

    #[test]
    fn test_stop_signals_every_runner() {
        let (_, _, t) = tile();
        // a Go nobody consumed makes the first runner refuse Stop
        t.runner(RiscKind::Brisc).go().unwrap();

        assert!(matches!(t.stop(), Err(EmuError::InvariantViolation(_))));
        assert_eq!(t.state(), TensixState::Terminated);
        assert_eq!(t.runner(RiscKind::Brisc).signal(), Signal::Go);
        assert_eq!(t.runner(RiscKind::Trisc).signal(), Signal::Stop);
        assert_eq!(t.runner(RiscKind::Ncrisc).signal(), Signal::Stop);
    }

    #[test]
    fn test_kernel_error_keeps_runner_alive() {
        let (env, cluster, t) = tile();
        let bad = cluster.kernels().register(|api| {
            api.dataflow()?;
            Ok(())
        });
        t.load_kernel(RiscKind::Trisc, bad).unwrap();
        t.runner(RiscKind::Trisc).go().unwrap();

        env.sched.run().unwrap();
        let runner = t.runner(RiscKind::Trisc);
        assert!(!runner.has_exited());
        assert_eq!(runner.signal(), Signal::None);
        assert!(matches!(t.take_kernel_error(), Some(EmuError::InvariantViolation(_))));
        assert!(t.take_kernel_error().is_none());

        t.stop().unwrap();
        env.sched.run().unwrap();
        assert!(RiscKind::ALL.iter().all(|&k| t.runner(k).has_exited()));
        // an exited runner ignores Stop and rejects Go
        assert!(runner.stop().is_ok());
        assert!(runner.go().is_err());
    }

    #[test]
    fn test_clear_code_and_stop() {
        let (_, _, t) = tile();
        t.load_kernel(RiscKind::Ncrisc, 0x1000).unwrap();
        let base = t.core(RiscKind::Ncrisc).code_base();
        assert_eq!(t.get_l1().read_u32(base).unwrap(), 0x1000);

        t.kernels_done().unwrap();
        assert_eq!(t.get_l1().read_u32(base).unwrap(), 0);
        assert_eq!(t.state(), TensixState::Idle);

        t.stop().unwrap();
        assert_eq!(t.state(), TensixState::Terminated);
        assert!(t.launch_kernels().is_err());
    }
}
