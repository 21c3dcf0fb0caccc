//! SoC memory: DRAM channel banks and the L1 bank of every worker core.
//!
//! Banks are created up front from the [`SocArch`] description and never
//! reallocated. Storage is sparse, so a full mesh costs little until kernels
//! touch it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device::arch_config::{CoreType, SocArch};
use crate::device::memory::{Memory, MemoryBank};
use crate::error::{EmuError, Result};

/// Memory banks reachable over the NoC.
pub struct Soc {
    arch: Arc<dyn SocArch>,
    dram: Vec<Arc<MemoryBank>>,
    /// keyed by routing coordinate
    l1: HashMap<(u32, u32), Arc<MemoryBank>>,
}

impl Soc {
    pub fn new(arch: Arc<dyn SocArch>) -> Self {
        let dram = (0..arch.num_dram_channels())
            .map(|ch| Arc::new(MemoryBank::new(format!("dram{}", ch), arch.dram_bank_size())))
            .collect();

        let mut l1 = HashMap::new();
        for x in 0..arch.x_size() {
            for y in 0..arch.y_size() {
                if arch.core_type(x, y) == CoreType::Worker {
                    let bank = MemoryBank::new(format!("l1({},{})", x, y), arch.worker_l1_size());
                    l1.insert((x, y), Arc::new(bank));
                }
            }
        }

        Self { arch, dram, l1 }
    }

    pub fn arch(&self) -> &Arc<dyn SocArch> {
        &self.arch
    }

    /// DRAM bank of a channel.
    pub fn dram(&self, channel: u32) -> Result<Arc<dyn Memory>> {
        self.dram
            .get(channel as usize)
            .map(|bank| Arc::clone(bank) as Arc<dyn Memory>)
            .ok_or_else(|| EmuError::config(format!("DRAM channel {} is out of range", channel)))
    }

    /// L1 bank of the worker at routing coordinate `(x, y)`.
    pub fn l1(&self, x: u32, y: u32) -> Result<Arc<dyn Memory>> {
        self.l1
            .get(&(x, y))
            .map(|bank| Arc::clone(bank) as Arc<dyn Memory>)
            .ok_or_else(|| EmuError::config(format!("No worker core at ({}, {})", x, y)))
    }

    /// Memory behind a NoC endpoint and the bank-local address.
    ///
    /// DRAM addresses wrap at the bank size; worker addresses go straight
    /// to that core's L1.
    pub fn map_remote(&self, x: u32, y: u32, addr: u32) -> Result<(Arc<dyn Memory>, u32)> {
        match self.arch.core_type(x, y) {
            CoreType::Dram => {
                let channel = self.arch.core_dram_channel(x, y)?;
                let addr = addr % self.arch.dram_bank_size();
                Ok((self.dram(channel)?, addr))
            }
            CoreType::Worker => Ok((self.l1(x, y)?, addr)),
            _ => Err(EmuError::config(format!("No DRAM or worker core at ({}, {})", x, y))),
        }
    }

    /// Worker coordinates in routing order.
    pub fn worker_cores(&self) -> Vec<(u32, u32)> {
        let mut cores: Vec<(u32, u32)> = self.l1.keys().copied().collect();
        cores.sort_unstable();
        cores
    }
}

impl fmt::Debug for Soc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Soc")
            .field("arch", &self.arch.name())
            .field("dram_channels", &self.dram.len())
            .field("workers", &self.l1.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::arch_config::{GridArch, GridLayout};

    fn soc() -> Soc {
        Soc::new(Arc::new(GridArch::new(GridLayout::small()).unwrap()))
    }

    #[test]
    fn test_banks_created() {
        let soc = soc();
        assert_eq!(soc.worker_cores().len(), 9);
        assert!(soc.dram(1).is_ok());
        assert!(soc.dram(2).is_err());
        assert!(soc.l1(1, 1).is_ok());
        assert!(soc.l1(0, 1).is_err());
    }

    #[test]
    fn test_map_remote() {
        let soc = soc();
        let size = soc.arch().dram_bank_size();

        let (bank, addr) = soc.map_remote(2, 0, size + 0x40).unwrap();
        assert_eq!(addr, 0x40);
        bank.write_u32(addr, 7).unwrap();
        assert_eq!(soc.dram(1).unwrap().read_u32(0x40).unwrap(), 7);

        let (bank, addr) = soc.map_remote(3, 2, 0x100).unwrap();
        bank.write_u32(addr, 9).unwrap();
        assert_eq!(soc.l1(3, 2).unwrap().read_u32(0x100).unwrap(), 9);

        let err = soc.map_remote(0, 0, 0).unwrap_err();
        assert_eq!(err, EmuError::config("No DRAM or worker core at (0, 0)"));
    }
}
