//! Circular-buffer engine: 32 FIFO channels per tile.
//!
//! Producer and consumer kernels on different logical cores hand pages to
//! each other through these channels. Addresses and sizes inside a channel
//! are kept in 16-byte L1 words; the pointer accessors convert to bytes.
//!
//! ```text
//!   fifo_addr                                      fifo_limit
//!   ├──────────┬──────────┬──────────┬──────────────┤
//!   │  page 0  │  page 1  │  page 2  │    page 3    │
//!   └──────────┴──────────┴──────────┴──────────────┘
//!        ▲ rd_ptr (consumer)   ▲ wr_ptr (producer)
//!
//!   in flight = tiles_received - tiles_acked  <=  fifo_num_pages
//! ```
//!
//! Pages never straddle the limit: once a pointer reaches `fifo_limit` it
//! drops back by `fifo_size`, landing exactly on `fifo_addr`.
//!
//! The two counters are the only state shared between producer and
//! consumer, so they live outside the channel lock as atomics with
//! acquire/release ordering.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::format::DataFormat;
use crate::error::{EmuError, Result};
use crate::schedule::Scheduler;

/// Number of channels per tile.
pub const NUM_CIRCULAR_BUFFERS: u32 = 32;

/// Snapshot of one channel. Addresses and sizes in 16-byte words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CbInterface {
    pub fifo_size: u32,
    pub fifo_limit: u32,
    pub fifo_page_size: u32,
    pub fifo_num_pages: u32,
    pub fifo_rd_ptr: u32,
    pub fifo_wr_ptr: u32,
    pub fifo_wr_tile_ptr: u32,
    pub tiles_acked: u32,
    pub tiles_received: u32,
}

/// Circular-buffer interface used by the dataflow and compute APIs.
pub trait Cb: Send + Sync + fmt::Debug {
    // ========================================================================
    // Configuration
    // ========================================================================

    /// Clear every channel.
    fn reset_read_write_interfaces(&self);

    /// Set every channel format to Float32.
    fn reset_data_formats(&self);

    /// Initialize one channel. All values in 16-byte words except `num_pages`.
    fn setup_read_write_interfaces(
        &self,
        cb_id: u32,
        fifo_addr: u32,
        fifo_size: u32,
        fifo_num_pages: u32,
        fifo_page_size: u32,
    ) -> Result<()>;

    /// Store the four formats of a channel. Tile size follows `unpack_src`.
    fn setup_data_formats(
        &self,
        cb_id: u32,
        unpack_src: DataFormat,
        unpack_dst: DataFormat,
        pack_src: DataFormat,
        pack_dst: DataFormat,
    ) -> Result<()>;

    // ========================================================================
    // Producer / consumer protocol
    // ========================================================================

    fn cb_push_back(&self, cb_id: u32, num_pages: u32) -> Result<()>;
    fn cb_pop_front(&self, cb_id: u32, num_pages: u32) -> Result<()>;

    /// Block until `num_pages` pages are free for the producer.
    fn cb_reserve_back(&self, cb_id: u32, num_pages: u32) -> Result<()>;

    /// Block until `num_pages` pages are available to the consumer.
    fn cb_wait_front(&self, cb_id: u32, num_pages: u32) -> Result<()>;

    // ========================================================================
    // Pointers (bytes)
    // ========================================================================

    fn get_write_ptr(&self, cb_id: u32) -> Result<u32>;
    fn get_read_ptr(&self, cb_id: u32) -> Result<u32>;
    fn set_write_ptr(&self, cb_id: u32, ptr: u32) -> Result<()>;
    fn set_read_ptr(&self, cb_id: u32, ptr: u32) -> Result<()>;

    /// Tiles packed into the current write page since the last push.
    fn get_write_tile_ptr(&self, cb_id: u32) -> Result<u32>;
    fn incr_write_tile_ptr(&self, cb_id: u32, num_tiles: u32) -> Result<()>;

    // ========================================================================
    // Formats
    // ========================================================================

    fn get_unpack_src_format(&self, cb_id: u32) -> Result<DataFormat>;
    fn get_unpack_dst_format(&self, cb_id: u32) -> Result<DataFormat>;
    fn get_pack_src_format(&self, cb_id: u32) -> Result<DataFormat>;
    fn get_pack_dst_format(&self, cb_id: u32) -> Result<DataFormat>;

    /// Tile size in bytes.
    fn get_tile_size(&self, cb_id: u32) -> Result<u32>;

    /// Snapshot of a channel for inspection.
    fn interface(&self, cb_id: u32) -> Result<CbInterface>;
}

#[derive(Debug, Clone, Copy, Default)]
struct CbFifo {
    fifo_size: u32,
    fifo_limit: u32,
    fifo_page_size: u32,
    fifo_num_pages: u32,
    fifo_rd_ptr: u32,
    fifo_wr_ptr: u32,
    fifo_wr_tile_ptr: u32,
    unpack_src: DataFormat,
    unpack_dst: DataFormat,
    pack_src: DataFormat,
    pack_dst: DataFormat,
    /// 16-byte words
    tile_size: u32,
}

#[derive(Debug, Default)]
struct CbChannel {
    fifo: Mutex<CbFifo>,
    tiles_acked: AtomicU32,
    tiles_received: AtomicU32,
}

impl CbChannel {
    fn lock(&self) -> MutexGuard<'_, CbFifo> {
        self.fifo.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reference circular-buffer engine.
pub struct CbEngine {
    sched: Arc<Scheduler>,
    channels: Vec<Arc<CbChannel>>,
}

impl CbEngine {
    pub fn new(sched: Arc<Scheduler>) -> Self {
        let channels = (0..NUM_CIRCULAR_BUFFERS).map(|_| Arc::new(CbChannel::default())).collect();
        let engine = Self { sched, channels };
        engine.reset_read_write_interfaces();
        engine.reset_data_formats();
        engine
    }

    #[inline]
    fn channel(&self, cb_id: u32) -> Result<&Arc<CbChannel>> {
        self.channels
            .get(cb_id as usize)
            .ok_or_else(|| EmuError::invariant(format!("circular buffer id {} out of range", cb_id)))
    }
}

impl Cb for CbEngine {
    fn reset_read_write_interfaces(&self) {
        for ch in &self.channels {
            let mut fifo = ch.lock();
            // formats survive; only the FIFO geometry is cleared
            *fifo = CbFifo {
                unpack_src: fifo.unpack_src,
                unpack_dst: fifo.unpack_dst,
                pack_src: fifo.pack_src,
                pack_dst: fifo.pack_dst,
                tile_size: fifo.tile_size,
                ..CbFifo::default()
            };
            ch.tiles_acked.store(0, Ordering::Release);
            ch.tiles_received.store(0, Ordering::Release);
        }
    }

    fn reset_data_formats(&self) {
        for ch in &self.channels {
            let mut fifo = ch.lock();
            fifo.unpack_src = DataFormat::Float32;
            fifo.unpack_dst = DataFormat::Float32;
            fifo.pack_src = DataFormat::Float32;
            fifo.pack_dst = DataFormat::Float32;
            fifo.tile_size = DataFormat::Float32.tile_words();
        }
    }

    fn setup_read_write_interfaces(
        &self,
        cb_id: u32,
        fifo_addr: u32,
        fifo_size: u32,
        fifo_num_pages: u32,
        fifo_page_size: u32,
    ) -> Result<()> {
        let ch = self.channel(cb_id)?;
        let mut fifo = ch.lock();
        fifo.fifo_size = fifo_size;
        fifo.fifo_limit = fifo_addr + fifo_size;
        fifo.fifo_page_size = fifo_page_size;
        fifo.fifo_num_pages = fifo_num_pages;
        fifo.fifo_wr_ptr = fifo_addr;
        fifo.fifo_rd_ptr = fifo_addr;
        fifo.fifo_wr_tile_ptr = 0;
        ch.tiles_acked.store(0, Ordering::Release);
        ch.tiles_received.store(0, Ordering::Release);
        log::trace!(
            "cb {}: addr=0x{:X} size=0x{:X} pages={} page_size=0x{:X} (bytes)",
            cb_id,
            fifo_addr << 4,
            fifo_size << 4,
            fifo_num_pages,
            fifo_page_size << 4
        );
        Ok(())
    }

    fn setup_data_formats(
        &self,
        cb_id: u32,
        unpack_src: DataFormat,
        unpack_dst: DataFormat,
        pack_src: DataFormat,
        pack_dst: DataFormat,
    ) -> Result<()> {
        let mut fifo = self.channel(cb_id)?.lock();
        fifo.unpack_src = unpack_src;
        fifo.unpack_dst = unpack_dst;
        fifo.pack_src = pack_src;
        fifo.pack_dst = pack_dst;
        fifo.tile_size = unpack_src.tile_words();
        Ok(())
    }

    fn cb_push_back(&self, cb_id: u32, num_pages: u32) -> Result<()> {
        let ch = self.channel(cb_id)?;
        let mut fifo = ch.lock();
        fifo.fifo_wr_ptr += num_pages * fifo.fifo_page_size;
        fifo.fifo_wr_tile_ptr = 0;
        if fifo.fifo_wr_ptr >= fifo.fifo_limit {
            fifo.fifo_wr_ptr -= fifo.fifo_size;
        }
        drop(fifo);
        ch.tiles_received.fetch_add(num_pages, Ordering::AcqRel);
        Ok(())
    }

    fn cb_pop_front(&self, cb_id: u32, num_pages: u32) -> Result<()> {
        let ch = self.channel(cb_id)?;
        let mut fifo = ch.lock();
        fifo.fifo_rd_ptr += num_pages * fifo.fifo_page_size;
        if fifo.fifo_rd_ptr >= fifo.fifo_limit {
            fifo.fifo_rd_ptr -= fifo.fifo_size;
        }
        drop(fifo);
        ch.tiles_acked.fetch_add(num_pages, Ordering::AcqRel);
        Ok(())
    }

    fn cb_reserve_back(&self, cb_id: u32, num_pages: u32) -> Result<()> {
        let ch = Arc::clone(self.channel(cb_id)?);
        // only this producer advances tiles_received, so it is stable while we wait
        let received = ch.tiles_received.load(Ordering::Acquire);
        let capacity = ch.lock().fifo_num_pages;
        self.sched.wait(move || {
            let acked = ch.tiles_acked.load(Ordering::Acquire);
            capacity.wrapping_sub(received.wrapping_sub(acked)) >= num_pages
        })
    }

    fn cb_wait_front(&self, cb_id: u32, num_pages: u32) -> Result<()> {
        let ch = Arc::clone(self.channel(cb_id)?);
        // only this consumer advances tiles_acked
        let acked = ch.tiles_acked.load(Ordering::Acquire);
        self.sched.wait(move || {
            let received = ch.tiles_received.load(Ordering::Acquire);
            received.wrapping_sub(acked) >= num_pages
        })
    }

    fn get_write_ptr(&self, cb_id: u32) -> Result<u32> {
        Ok(self.channel(cb_id)?.lock().fifo_wr_ptr << 4)
    }

    fn get_read_ptr(&self, cb_id: u32) -> Result<u32> {
        Ok(self.channel(cb_id)?.lock().fifo_rd_ptr << 4)
    }

    fn set_write_ptr(&self, cb_id: u32, ptr: u32) -> Result<()> {
        self.channel(cb_id)?.lock().fifo_wr_ptr = ptr >> 4;
        Ok(())
    }

    fn set_read_ptr(&self, cb_id: u32, ptr: u32) -> Result<()> {
        self.channel(cb_id)?.lock().fifo_rd_ptr = ptr >> 4;
        Ok(())
    }

    fn get_write_tile_ptr(&self, cb_id: u32) -> Result<u32> {
        Ok(self.channel(cb_id)?.lock().fifo_wr_tile_ptr)
    }

    fn incr_write_tile_ptr(&self, cb_id: u32, num_tiles: u32) -> Result<()> {
        self.channel(cb_id)?.lock().fifo_wr_tile_ptr += num_tiles;
        Ok(())
    }

    fn get_unpack_src_format(&self, cb_id: u32) -> Result<DataFormat> {
        Ok(self.channel(cb_id)?.lock().unpack_src)
    }

    fn get_unpack_dst_format(&self, cb_id: u32) -> Result<DataFormat> {
        Ok(self.channel(cb_id)?.lock().unpack_dst)
    }

    fn get_pack_src_format(&self, cb_id: u32) -> Result<DataFormat> {
        Ok(self.channel(cb_id)?.lock().pack_src)
    }

    fn get_pack_dst_format(&self, cb_id: u32) -> Result<DataFormat> {
        Ok(self.channel(cb_id)?.lock().pack_dst)
    }

    fn get_tile_size(&self, cb_id: u32) -> Result<u32> {
        Ok(self.channel(cb_id)?.lock().tile_size << 4)
    }

    fn interface(&self, cb_id: u32) -> Result<CbInterface> {
        let ch = self.channel(cb_id)?;
        let fifo = ch.lock();
        Ok(CbInterface {
            fifo_size: fifo.fifo_size,
            fifo_limit: fifo.fifo_limit,
            fifo_page_size: fifo.fifo_page_size,
            fifo_num_pages: fifo.fifo_num_pages,
            fifo_rd_ptr: fifo.fifo_rd_ptr,
            fifo_wr_ptr: fifo.fifo_wr_ptr,
            fifo_wr_tile_ptr: fifo.fifo_wr_tile_ptr,
            tiles_acked: ch.tiles_acked.load(Ordering::Acquire),
            tiles_received: ch.tiles_received.load(Ordering::Acquire),
        })
    }
}

impl fmt::Debug for CbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let configured = self.channels.iter().filter(|ch| ch.lock().fifo_size != 0).count();
        f.debug_struct("CbEngine").field("configured", &configured).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Worker;
    use std::sync::atomic::AtomicBool;

    fn engine() -> (Arc<Scheduler>, Arc<CbEngine>) {
        let sched = Arc::new(Scheduler::new());
        let cb = Arc::new(CbEngine::new(sched.clone()));
        (sched, cb)
    }

    #[test]
    fn test_setup_and_pointers() {
        let (_, cb) = engine();
        cb.setup_read_write_interfaces(3, 0x100, 0x40, 4, 0x10).unwrap();
        assert_eq!(cb.get_read_ptr(3).unwrap(), 0x1000);
        assert_eq!(cb.get_write_ptr(3).unwrap(), 0x1000);
        let iface = cb.interface(3).unwrap();
        assert_eq!(iface.fifo_limit, 0x140);
        assert_eq!(iface.fifo_num_pages, 4);

        cb.set_write_ptr(3, 0x1230).unwrap();
        assert_eq!(cb.interface(3).unwrap().fifo_wr_ptr, 0x123);
    }

    #[test]
    fn test_wraparound_snaps_to_fifo_addr() {
        let (_, cb) = engine();
        let fifo_addr = 0x200;
        cb.setup_read_write_interfaces(0, fifo_addr, 4 * 0x10, 4, 0x10).unwrap();

        for step in 1..=12u32 {
            cb.cb_push_back(0, 1).unwrap();
            cb.cb_pop_front(0, 1).unwrap();
            let iface = cb.interface(0).unwrap();
            assert!(iface.fifo_wr_ptr >= fifo_addr && iface.fifo_wr_ptr < iface.fifo_limit);
            assert!(iface.fifo_rd_ptr >= fifo_addr && iface.fifo_rd_ptr < iface.fifo_limit);
            if step % 4 == 0 {
                assert_eq!(iface.fifo_wr_ptr, fifo_addr);
                assert_eq!(iface.fifo_rd_ptr, fifo_addr);
            }
        }
        let iface = cb.interface(0).unwrap();
        assert_eq!(iface.tiles_received, 12);
        assert_eq!(iface.tiles_acked, 12);
    }

    #[test]
    fn test_push_resets_write_tile_ptr() {
        let (_, cb) = engine();
        cb.setup_read_write_interfaces(1, 0x100, 0x100, 2, 0x80).unwrap();
        cb.incr_write_tile_ptr(1, 1).unwrap();
        cb.incr_write_tile_ptr(1, 2).unwrap();
        assert_eq!(cb.get_write_tile_ptr(1).unwrap(), 3);
        cb.cb_push_back(1, 1).unwrap();
        assert_eq!(cb.get_write_tile_ptr(1).unwrap(), 0);
    }

    #[test]
    fn test_formats_and_tile_size() {
        let (_, cb) = engine();
        assert_eq!(cb.get_tile_size(7).unwrap(), 4096);
        assert_eq!(cb.get_pack_dst_format(7).unwrap(), DataFormat::Float32);

        cb.setup_data_formats(7, DataFormat::Float16B, DataFormat::Float32, DataFormat::Float32, DataFormat::Float16B)
            .unwrap();
        assert_eq!(cb.get_tile_size(7).unwrap(), 2048);
        assert_eq!(cb.get_unpack_src_format(7).unwrap(), DataFormat::Float16B);
        assert_eq!(cb.get_unpack_dst_format(7).unwrap(), DataFormat::Float32);

        cb.reset_data_formats();
        assert_eq!(cb.get_tile_size(7).unwrap(), 4096);
        assert_eq!(cb.get_unpack_src_format(7).unwrap(), DataFormat::Float32);
    }

    #[test]
    fn test_bad_cb_id() {
        let (_, cb) = engine();
        assert!(matches!(cb.cb_push_back(32, 1), Err(EmuError::InvariantViolation(_))));
        assert!(cb.get_tile_size(40).is_err());
        assert!(cb.interface(31).is_ok());
    }

    #[test]
    fn test_reserve_and_wait_satisfied_immediately() {
        let (_, cb) = engine();
        cb.setup_read_write_interfaces(0, 0x100, 0x40, 4, 0x10).unwrap();
        // no scheduler worker needed when the predicate already holds
        cb.cb_reserve_back(0, 4).unwrap();
        cb.cb_push_back(0, 2).unwrap();
        cb.cb_wait_front(0, 2).unwrap();
        assert!(cb.cb_wait_front(0, 3).is_err());
    }

    #[derive(Debug)]
    struct Producer {
        cb: Arc<CbEngine>,
        reserved_fifth: Arc<AtomicBool>,
    }

    impl Worker for Producer {
        fn run(&self) -> Result<()> {
            for _ in 0..4 {
                self.cb.cb_reserve_back(0, 1)?;
                self.cb.cb_push_back(0, 1)?;
            }
            self.cb.cb_reserve_back(0, 1)?;
            // exactly one page must have been released by now
            let iface = self.cb.interface(0)?;
            assert_eq!(iface.tiles_acked, 1);
            self.reserved_fifth.store(true, Ordering::Release);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Consumer {
        cb: Arc<CbEngine>,
        reserved_fifth: Arc<AtomicBool>,
        seen_before_pop: Arc<AtomicBool>,
    }

    impl Worker for Consumer {
        fn run(&self) -> Result<()> {
            self.cb.cb_wait_front(0, 4)?;
            self.seen_before_pop.store(self.reserved_fifth.load(Ordering::Acquire), Ordering::Release);
            self.cb.cb_pop_front(0, 1)?;
            Ok(())
        }
    }

    #[test]
    fn test_reserve_blocks_until_one_pop() {
        let (sched, cb) = engine();
        cb.setup_read_write_interfaces(0, 0x100, 4, 4, 1).unwrap();
        let reserved_fifth = Arc::new(AtomicBool::new(false));
        let seen_before_pop = Arc::new(AtomicBool::new(false));

        sched.add_worker(Arc::new(Producer { cb: cb.clone(), reserved_fifth: reserved_fifth.clone() }));
        sched.add_worker(Arc::new(Consumer {
            cb: cb.clone(),
            reserved_fifth: reserved_fifth.clone(),
            seen_before_pop: seen_before_pop.clone(),
        }));
        sched.run().unwrap();

        assert!(reserved_fifth.load(Ordering::Acquire));
        assert!(!seen_before_pop.load(Ordering::Acquire));
        let iface = cb.interface(0).unwrap();
        assert_eq!(iface.tiles_received, 4);
        assert_eq!(iface.tiles_received - iface.tiles_acked, 3);
    }
}
