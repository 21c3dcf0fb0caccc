//! Byte-addressable memory banks standing in for L1 and DRAM.
//!
//! Every Tensix tile owns one L1 bank; the SoC owns one bank per DRAM channel
//! plus system memory reached through the PCIe core. Banks are shared between
//! the three logical cores of a tile and, through the NoC engine, between
//! tiles. Hardware provides no locking, so neither does the emulated protocol:
//! the internal mutex only exists to keep Rust aliasing rules intact.
//!
//! # Storage
//!
//! ```text
//!   logical size (fixed)
//!   ├────────────────────────────────────────────────────┤
//!   │ page 0 │ (hole) │ page 2 │        (holes)          │
//!   └────────┴────────┴────────┴─────────────────────────┘
//!     4 KB pages allocated on first write, holes read as zero
//! ```
//!
//! A 1 GB DRAM bank therefore costs nothing until a kernel touches it.
//!
//! # Usage
//!
//! ```
//! use tensix_emu::device::{Memory, MemoryBank};
//!
//! let l1 = MemoryBank::new("l1", 1024 * 1024);
//! l1.write_u32(0x100, 0xDEAD_BEEF).unwrap();
//! assert_eq!(l1.read_u32(0x100).unwrap(), 0xDEAD_BEEF);
//! assert_eq!(l1.read_u32(0x200).unwrap(), 0);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{EmuError, Result};

/// Memory interface used by every engine.
///
/// Offsets are byte addresses local to the bank. Typed accessors are
/// little-endian, matching the RISC-V cores of the tile.
pub trait Memory: Send + Sync + fmt::Debug {
    /// Logical size in bytes.
    fn size(&self) -> u32;

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` into the bank starting at `addr`.
    fn write(&self, addr: u32, data: &[u8]) -> Result<()>;

    /// Set `len` bytes starting at `addr` to `value`.
    fn fill(&self, addr: u32, len: u32, value: u8) -> Result<()> {
        self.write(addr, &vec![value; len as usize])
    }

    fn read_u16(&self, addr: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    fn read_u32(&self, addr: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn write_u32(&self, addr: u32, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(addr, &buf)
    }

    fn read_i32(&self, addr: u32) -> Result<i32> {
        self.read_u32(addr).map(|v| v as i32)
    }

    fn read_f32(&self, addr: u32) -> Result<f32> {
        self.read_u32(addr).map(f32::from_bits)
    }

    fn write_f32(&self, addr: u32, value: f32) -> Result<()> {
        self.write_u32(addr, value.to_bits())
    }

    /// Move `len` bytes from `src_addr` in `src` to `dst_addr` in `self`.
    fn copy_from(&self, dst_addr: u32, src: &dyn Memory, src_addr: u32, len: u32) -> Result<()> {
        let mut buf = vec![0u8; len as usize];
        src.read(src_addr, &mut buf)?;
        self.write(dst_addr, &buf)
    }

    /// Read `count` consecutive words.
    fn read_u32_slice(&self, addr: u32, count: usize) -> Result<Vec<u32>> {
        let mut buf = vec![0u8; count * 4];
        self.read(addr, &mut buf)?;
        let mut out = vec![0u32; count];
        LittleEndian::read_u32_into(&buf, &mut out);
        Ok(out)
    }

    /// Write consecutive words.
    fn write_u32_slice(&self, addr: u32, values: &[u32]) -> Result<()> {
        let mut buf = vec![0u8; values.len() * 4];
        LittleEndian::write_u32_into(values, &mut buf);
        self.write(addr, &buf)
    }

    fn read_f32_slice(&self, addr: u32, count: usize) -> Result<Vec<f32>> {
        let mut buf = vec![0u8; count * 4];
        self.read(addr, &mut buf)?;
        let mut out = vec![0f32; count];
        LittleEndian::read_f32_into(&buf, &mut out);
        Ok(out)
    }

    fn write_f32_slice(&self, addr: u32, values: &[f32]) -> Result<()> {
        let mut buf = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(values, &mut buf);
        self.write(addr, &buf)
    }
}

/// Sparse, lazily allocated memory bank.
pub struct MemoryBank {
    name: String,
    size: u32,
    /// page index -> page data
    pages: Mutex<BTreeMap<u32, Box<[u8; PAGE_SIZE]>>>,
}

/// Backing page size.
pub const PAGE_SIZE: usize = 4096;

const PAGE_SHIFT: u32 = 12;

impl MemoryBank {
    /// Create a bank of `size` bytes. No storage is allocated yet.
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bank name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of pages currently backed by storage.
    pub fn resident_pages(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, Box<[u8; PAGE_SIZE]>>> {
        // A poisoned bank only means a worker panicked mid-copy; the bytes are
        // still as valid as hardware would leave them.
        self.pages.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    fn check(&self, addr: u32, len: usize) -> Result<()> {
        let end = addr as u64 + len as u64;
        if end > self.size as u64 {
            return Err(EmuError::MemoryOutOfBounds {
                addr: addr as u64,
                len,
                size: self.size as u64,
            });
        }
        Ok(())
    }
}

impl Memory for MemoryBank {
    fn size(&self) -> u32 {
        self.size
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        let pages = self.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr as usize + done;
            let page = (cur >> PAGE_SHIFT) as u32;
            let offset = cur & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            match pages.get(&page) {
                Some(data) => buf[done..done + chunk].copy_from_slice(&data[offset..offset + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.check(addr, data.len())?;
        let mut pages = self.lock();
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr as usize + done;
            let page = (cur >> PAGE_SHIFT) as u32;
            let offset = cur & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let target = pages.entry(page).or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            target[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn fill(&self, addr: u32, len: u32, value: u8) -> Result<()> {
        self.check(addr, len as usize)?;
        let mut pages = self.lock();
        let mut done = 0usize;
        let len = len as usize;
        while done < len {
            let cur = addr as usize + done;
            let page = (cur >> PAGE_SHIFT) as u32;
            let offset = cur & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - offset).min(len - done);
            if value == 0 {
                // zero fill never needs to materialize a page
                if let Some(target) = pages.get_mut(&page) {
                    target[offset..offset + chunk].fill(0);
                }
            } else {
                let target = pages.entry(page).or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
                target[offset..offset + chunk].fill(value);
            }
            done += chunk;
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBank")
            .field("name", &self.name)
            .field("size", &format_args!("0x{:X}", self.size))
            .field("resident_pages", &self.resident_pages())
            .finish()
    }
}
