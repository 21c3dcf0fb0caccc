//! RISC-V core boundary.
//!
//! The instruction-level interpreter lives outside this crate. Everything
//! here talks to it through [`RiscvCore`]: a code region in L1 plus a
//! `run(start_pc)` entry point that executes one kernel to completion
//! against the API of the thread it belongs to.
//!
//! [`NativeCore`] is the reference implementation. Instead of decoding
//! instructions it looks the start PC up in a [`KernelRegistry`] of Rust
//! closures, which is enough to drive the rest of the tile end to end.
//!
//! ```text
//!   host                           L1 code region          registry
//!   ────                           ──────────────          ────────
//!   pc = registry.register(k) ──►                          pc ──► k
//!   core.write_code(pc)       ──►  [ pc | 0 0 0 ... ]
//!                                        │
//!   ThreadRunner: start_pc ◄─────────────┘
//!   core.run(start_pc, api)  ─────────────────────────────► k(api)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::device::base_addr::{CoreLayout, RiscKind};
use crate::device::memory::Memory;
use crate::error::{EmuError, Result};
use crate::kernel::{Compute, Dataflow};

/// The API a thread exposes to the kernel running on it.
#[derive(Debug, Clone)]
pub enum ThreadApi {
    Compute(Arc<dyn Compute>),
    Dataflow(Arc<dyn Dataflow>),
}

impl ThreadApi {
    pub fn compute(&self) -> Result<&dyn Compute> {
        match self {
            ThreadApi::Compute(api) => Ok(api.as_ref()),
            ThreadApi::Dataflow(_) => Err(EmuError::invariant("compute API requested on a data-movement core")),
        }
    }

    pub fn dataflow(&self) -> Result<&dyn Dataflow> {
        match self {
            ThreadApi::Dataflow(api) => Ok(api.as_ref()),
            ThreadApi::Compute(_) => Err(EmuError::invariant("dataflow API requested on a compute core")),
        }
    }

    /// Prepare the API for a new kernel.
    pub fn reset(&self) {
        match self {
            ThreadApi::Compute(api) => api.reset(),
            ThreadApi::Dataflow(api) => api.reset(),
        }
    }
}

/// One RISC-V core of a tile.
pub trait RiscvCore: Send + Sync + fmt::Debug {
    fn set_memory_layout(&self, layout: CoreLayout);

    fn code_base(&self) -> u32;

    fn code_size(&self) -> u32;

    /// Copy a program image to the start of the code region.
    fn write_code(&self, code: &[u8]) -> Result<()>;

    /// Execute from `start_pc` until the kernel returns.
    fn run(&self, start_pc: u32, api: &ThreadApi) -> Result<()>;
}

/// Creates the cores of each tile.
pub trait RiscvCluster: Send + Sync + fmt::Debug {
    fn create_core(&self, l1: Arc<dyn Memory>, kind: RiscKind) -> Arc<dyn RiscvCore>;
}

// ============================================================================
// Native kernels
// ============================================================================

/// A kernel written in Rust.
pub type NativeKernel = Arc<dyn Fn(&ThreadApi) -> Result<()> + Send + Sync>;

/// First PC handed out. Zero means "no kernel" to the thread runner.
const FIRST_KERNEL_PC: u32 = 0x1000;
const KERNEL_PC_STRIDE: u32 = 0x10;

/// Native kernels by entry PC, shared by every core of a machine.
pub struct KernelRegistry {
    kernels: RwLock<HashMap<u32, NativeKernel>>,
    next_pc: Mutex<u32>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: RwLock::new(HashMap::new()),
            next_pc: Mutex::new(FIRST_KERNEL_PC),
        }
    }

    /// Register a kernel and return its entry PC.
    pub fn register<F>(&self, kernel: F) -> u32
    where
        F: Fn(&ThreadApi) -> Result<()> + Send + Sync + 'static,
    {
        let pc = {
            let mut next = self.next_pc.lock().unwrap_or_else(|e| e.into_inner());
            let pc = *next;
            *next += KERNEL_PC_STRIDE;
            pc
        };
        self.kernels.write().unwrap_or_else(|e| e.into_inner()).insert(pc, Arc::new(kernel));
        log::debug!("registered native kernel at pc 0x{:X}", pc);
        pc
    }

    pub fn get(&self, pc: u32) -> Option<NativeKernel> {
        self.kernels.read().unwrap_or_else(|e| e.into_inner()).get(&pc).cloned()
    }

    pub fn len(&self) -> usize {
        self.kernels.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry").field("kernels", &self.len()).finish()
    }
}

/// Builds [`NativeCore`]s that share one registry.
#[derive(Debug, Clone, Default)]
pub struct NativeCluster {
    kernels: Arc<KernelRegistry>,
}

impl NativeCluster {
    pub fn new(kernels: Arc<KernelRegistry>) -> Self {
        Self { kernels }
    }

    pub fn kernels(&self) -> &Arc<KernelRegistry> {
        &self.kernels
    }
}

impl RiscvCluster for NativeCluster {
    fn create_core(&self, l1: Arc<dyn Memory>, kind: RiscKind) -> Arc<dyn RiscvCore> {
        Arc::new(NativeCore::new(l1, kind, Arc::clone(&self.kernels)))
    }
}

// ============================================================================
// NativeCore
// ============================================================================

/// Core that dispatches registered native kernels by start PC.
pub struct NativeCore {
    l1: Arc<dyn Memory>,
    kind: RiscKind,
    layout: RwLock<CoreLayout>,
    kernels: Arc<KernelRegistry>,
}

impl NativeCore {
    pub fn new(l1: Arc<dyn Memory>, kind: RiscKind, kernels: Arc<KernelRegistry>) -> Self {
        Self {
            l1,
            kind,
            layout: RwLock::new(CoreLayout { code_base: 0, code_size: 0, local_base: 0, local_size: 0 }),
            kernels,
        }
    }

    pub fn kind(&self) -> RiscKind {
        self.kind
    }

    fn layout(&self) -> CoreLayout {
        *self.layout.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl RiscvCore for NativeCore {
    fn set_memory_layout(&self, layout: CoreLayout) {
        *self.layout.write().unwrap_or_else(|e| e.into_inner()) = layout;
    }

    fn code_base(&self) -> u32 {
        self.layout().code_base
    }

    fn code_size(&self) -> u32 {
        self.layout().code_size
    }

    fn write_code(&self, code: &[u8]) -> Result<()> {
        let layout = self.layout();
        if code.len() as u64 > layout.code_size as u64 {
            return Err(EmuError::invariant(format!(
                "{} code image of {} bytes exceeds its {} byte region",
                self.kind.name(),
                code.len(),
                layout.code_size
            )));
        }
        self.l1.write(layout.code_base, code)
    }

    fn run(&self, start_pc: u32, api: &ThreadApi) -> Result<()> {
        let kernel = self.kernels.get(start_pc).ok_or_else(|| {
            EmuError::unsupported(format!("{}: no native kernel at pc 0x{:X}", self.kind.name(), start_pc))
        })?;
        log::debug!("{}: run kernel at pc 0x{:X}", self.kind.name(), start_pc);
        kernel(api)
    }
}

impl fmt::Debug for NativeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCore").field("kind", &self.kind).field("layout", &self.layout()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::base_addr::MemMap;
    use crate::device::cb::CbEngine;
    use crate::device::memory::MemoryBank;
    use crate::kernel::ComputeImpl;
    use crate::schedule::Scheduler;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn compute_api(l1: Arc<dyn Memory>) -> ThreadApi {
        let cb = Arc::new(CbEngine::new(Arc::new(Scheduler::new())));
        ThreadApi::Compute(Arc::new(ComputeImpl::new(l1, cb)))
    }

    #[test]
    fn test_registry_hands_out_distinct_pcs() {
        let registry = KernelRegistry::new();
        assert!(registry.is_empty());
        let a = registry.register(|_| Ok(()));
        let b = registry.register(|_| Ok(()));
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a).is_some());
        assert!(registry.get(a + 1).is_none());
    }

    #[test]
    fn test_write_code_lands_at_code_base() {
        let l1: Arc<dyn Memory> = Arc::new(MemoryBank::new("l1", 1024 * 1024));
        let cluster = NativeCluster::default();
        let core = cluster.create_core(l1.clone(), RiscKind::Trisc);
        let layout = MemMap::grayskull().layout(RiscKind::Trisc);
        core.set_memory_layout(layout);
        assert_eq!(core.code_base(), layout.code_base);
        assert_eq!(core.code_size(), layout.code_size);

        core.write_code(&0x1234u32.to_le_bytes()).unwrap();
        assert_eq!(l1.read_u32(layout.code_base).unwrap(), 0x1234);

        let too_big = vec![0u8; layout.code_size as usize + 1];
        assert!(matches!(core.write_code(&too_big), Err(EmuError::InvariantViolation(_))));
    }

    #[test]
    fn test_run_dispatches_by_pc() {
        let l1: Arc<dyn Memory> = Arc::new(MemoryBank::new("l1", 1024 * 1024));
        let kernels = Arc::new(KernelRegistry::new());
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let pc = kernels.register(move |api| {
            api.compute()?;
            counter.fetch_add(1, Ordering::AcqRel);
            Ok(())
        });
        let core = NativeCore::new(l1.clone(), RiscKind::Trisc, kernels);
        let api = compute_api(l1);

        core.run(pc, &api).unwrap();
        core.run(pc, &api).unwrap();
        assert_eq!(hits.load(Ordering::Acquire), 2);
        assert!(matches!(core.run(pc + 4, &api), Err(EmuError::Unsupported(_))));
    }

    #[test]
    fn test_wrong_api_kind() {
        let l1: Arc<dyn Memory> = Arc::new(MemoryBank::new("l1", 4096));
        let api = compute_api(l1);
        assert!(api.compute().is_ok());
        assert!(matches!(api.dataflow(), Err(EmuError::InvariantViolation(_))));
    }
}
