//! Simulated DMA engine for development and testing
//!
//! [`SimulatedDma`] models the kernel side of the LitePCIe DMA protocol in
//! memory: per-direction engine locks, enable flags, `hw`/`sw` counters and
//! a page-aligned buffer region. Test code plays the part of the hardware
//! through [`push_rx_buffer`](SimulatedDma::push_rx_buffer),
//! [`consume_tx`](SimulatedDma::consume_tx) and friends.
//!
//! Readiness follows the kernel's `poll`: RX is readable while the hardware
//! is ahead of the retired cursor, TX is writable while fewer than a full
//! ring of buffers is queued. Neither knows about buffers user space holds
//! without having released them, so a wakeup can still leave the streamer
//! with nothing to hand out.

use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::error::{StreamError, StreamResult};
use crate::layout::{BufferLayout, DmaTarget};
use crate::traits::{DmaEngine, MappedRegion};
use crate::types::{Direction, DmaCounters, DmaMmapInfo, RingGeometry};

/// Alignment of the simulated DMA region
pub const PAGE_SIZE: usize = 4096;

/// Default DMA buffer size in bytes (1024 two-channel samples)
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of buffers per ring
pub const DEFAULT_BUFFER_COUNT: usize = 256;

/// Page-aligned backing memory shared by the engine and its mappings
struct Region {
    _storage: Vec<u8>,
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    fn new(len: usize) -> Self {
        let mut storage = vec![0u8; len + PAGE_SIZE];
        let ptr = storage.as_mut_ptr();
        let pad = (PAGE_SIZE - ptr as usize % PAGE_SIZE) % PAGE_SIZE;
        // Safety: pad < PAGE_SIZE, so base..base+len lies inside the allocation.
        let base = unsafe { NonNull::new_unchecked(ptr.add(pad)) };
        Self {
            _storage: storage,
            base,
            len,
        }
    }
}

// Safety: the storage is never touched through the Vec after construction,
// only through `base`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// A user-space view of part of the simulated region
struct SimMapping {
    region: Arc<Region>,
    offset: usize,
    len: usize,
    live: Arc<AtomicUsize>,
}

impl MappedRegion for SimMapping {
    fn as_ptr(&self) -> NonNull<u8> {
        // Safety: offset + len <= region.len
        unsafe { NonNull::new_unchecked(self.region.base.as_ptr().add(self.offset)) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SimMapping {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Kernel-side state of one direction
#[derive(Debug, Default)]
struct Channel {
    requested: bool,
    enabled: bool,
    hw: u64,
    sw: u64,
    acks: Vec<u64>,
    deny: bool,
    fail_mapping: bool,
}

/// Software DMA engine
pub struct SimulatedDma {
    info: DmaMmapInfo,
    target: DmaTarget,
    region: Arc<Region>,
    channels: Mutex<[Channel; 2]>,
    ready: Condvar,
    mappings: [Arc<AtomicUsize>; 2],
}

impl SimulatedDma {
    /// Host-memory engine with the default ring shape
    pub fn new() -> Self {
        let geometry = RingGeometry {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
        };
        Self::with_rings(geometry, geometry, DmaTarget::Host)
    }

    /// Engine with the same ring shape in both directions
    pub fn with_geometry(geometry: RingGeometry, target: DmaTarget) -> Self {
        Self::with_rings(geometry, geometry, target)
    }

    /// Engine with independent TX and RX ring shapes
    ///
    /// With [`DmaTarget::Accelerator`] the buffers are laid out as `(tx, rx)`
    /// pairs, one pair per ring index of the longer ring.
    pub fn with_rings(tx: RingGeometry, rx: RingGeometry, target: DmaTarget) -> Self {
        let (rx_offset, len) = match target {
            DmaTarget::Host => {
                let rx_offset = round_up(tx.total_size(), PAGE_SIZE);
                (rx_offset, rx_offset + rx.total_size())
            }
            DmaTarget::Accelerator => {
                let pairs = tx.buffer_count.max(rx.buffer_count);
                (0, pairs * (tx.buffer_size + rx.buffer_size))
            }
        };

        let info = DmaMmapInfo {
            tx_buf_offset: 0,
            tx_buf_size: tx.buffer_size as u64,
            tx_buf_count: tx.buffer_count as u64,
            rx_buf_offset: rx_offset as u64,
            rx_buf_size: rx.buffer_size as u64,
            rx_buf_count: rx.buffer_count as u64,
        };

        Self {
            info,
            target,
            region: Arc::new(Region::new(len)),
            channels: Mutex::new(Default::default()),
            ready: Condvar::new(),
            mappings: [Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))],
        }
    }

    /// Where the simulated buffers live
    pub fn target(&self) -> DmaTarget {
        self.target
    }

    fn lock(&self) -> MutexGuard<'_, [Channel; 2]> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn layout(&self, direction: Direction) -> BufferLayout {
        match self.target {
            DmaTarget::Host => {
                // Safety: the direction's offset lies inside the region
                let base = unsafe {
                    NonNull::new_unchecked(
                        self.region
                            .base
                            .as_ptr()
                            .add(self.info.offset(direction) as usize),
                    )
                };
                BufferLayout::host(base, self.info.geometry(direction).buffer_size)
            }
            DmaTarget::Accelerator => {
                BufferLayout::interleaved(self.region.base, &self.info, direction)
            }
        }
    }

    /// Words of the buffer at a ring slot
    fn slot_words(&self, direction: Direction, slot: usize) -> *mut u32 {
        self.layout(direction).resolve(slot).as_ptr() as *mut u32
    }

    fn words_per_buffer(&self, direction: Direction) -> usize {
        self.info.geometry(direction).buffer_size / 4
    }

    fn is_ready(&self, channel: &Channel, direction: Direction) -> bool {
        let count = self.info.geometry(direction).buffer_count as i64;
        match direction {
            Direction::Rx => (channel.hw.wrapping_sub(channel.sw) as i64) > 0,
            Direction::Tx => (channel.sw.wrapping_sub(channel.hw) as i64) < count,
        }
    }

    // Hardware side

    /// Hardware writes one RX buffer
    ///
    /// Fills the slot at the hardware cursor with `words` (truncated to the
    /// buffer size) and advances it. The hardware does not wait for user
    /// space, so this can lap the ring. Returns `false` if the engine is not
    /// enabled.
    pub fn push_rx_buffer(&self, words: &[u32]) -> bool {
        let mut channels = self.lock();
        let rx = &mut channels[Direction::Rx.index()];
        if !rx.enabled {
            return false;
        }

        let slot = (rx.hw % self.info.rx_buf_count) as usize;
        let len = words.len().min(self.words_per_buffer(Direction::Rx));
        // Safety: the slot is inside the region and holds at least `len` words.
        let dst = unsafe { slice::from_raw_parts_mut(self.slot_words(Direction::Rx, slot), len) };
        dst.copy_from_slice(&words[..len]);

        rx.hw += 1;
        trace!(hw = rx.hw, slot, "sim: RX buffer written");
        drop(channels);
        self.ready.notify_all();
        true
    }

    /// Hardware writes `n` RX buffers without touching their contents
    pub fn advance_rx(&self, n: u64) -> bool {
        let mut channels = self.lock();
        let rx = &mut channels[Direction::Rx.index()];
        if !rx.enabled {
            return false;
        }
        rx.hw += n;
        drop(channels);
        self.ready.notify_all();
        true
    }

    /// Hardware reads up to `n` submitted TX buffers
    ///
    /// Only buffers retired by user space are consumed. Returns their
    /// contents in ring order.
    pub fn consume_tx(&self, n: usize) -> Vec<Vec<u32>> {
        let mut channels = self.lock();
        let tx = &mut channels[Direction::Tx.index()];
        let mut out = Vec::new();
        if !tx.enabled {
            return out;
        }

        let len = self.words_per_buffer(Direction::Tx);
        while out.len() < n && tx.hw < tx.sw {
            let slot = (tx.hw % self.info.tx_buf_count) as usize;
            // Safety: the slot is inside the region and holds `len` words.
            let src = unsafe { slice::from_raw_parts(self.slot_words(Direction::Tx, slot), len) };
            out.push(src.to_vec());
            tx.hw += 1;
        }

        drop(channels);
        self.ready.notify_all();
        out
    }

    /// Force the kernel counters, e.g. to put the ring in underflow
    pub fn set_counters(&self, direction: Direction, counters: DmaCounters) {
        let mut channels = self.lock();
        let channel = &mut channels[direction.index()];
        channel.hw = counters.hw;
        channel.sw = counters.sw;
        drop(channels);
        self.ready.notify_all();
    }

    /// Make the next engine requests fail
    pub fn deny_requests(&self, direction: Direction, deny: bool) {
        self.lock()[direction.index()].deny = deny;
    }

    /// Make the next buffer mappings fail
    pub fn fail_mapping(&self, direction: Direction, fail: bool) {
        self.lock()[direction.index()].fail_mapping = fail;
    }

    // Inspection

    /// Current kernel counters
    pub fn counters(&self, direction: Direction) -> DmaCounters {
        let channels = self.lock();
        let channel = &channels[direction.index()];
        DmaCounters {
            hw: channel.hw,
            sw: channel.sw,
        }
    }

    /// Check whether the engine is held by user space
    pub fn is_requested(&self, direction: Direction) -> bool {
        self.lock()[direction.index()].requested
    }

    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.lock()[direction.index()].enabled
    }

    /// Every index passed to `ack_buffers`, oldest first
    pub fn acks(&self, direction: Direction) -> Vec<u64> {
        self.lock()[direction.index()].acks.clone()
    }

    /// Mappings of this direction still alive
    pub fn live_mappings(&self, direction: Direction) -> usize {
        self.mappings[direction.index()].load(Ordering::SeqCst)
    }
}

impl Default for SimulatedDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine for SimulatedDma {
    fn mmap_info(&self) -> DmaMmapInfo {
        self.info
    }

    fn request(&self, direction: Direction) -> StreamResult<bool> {
        let mut channels = self.lock();
        let channel = &mut channels[direction.index()];
        if channel.deny || channel.requested {
            return Ok(false);
        }
        channel.requested = true;
        Ok(true)
    }

    fn release(&self, direction: Direction) -> StreamResult<()> {
        let mut channels = self.lock();
        let channel = &mut channels[direction.index()];
        channel.requested = false;
        channel.enabled = false;
        Ok(())
    }

    fn query_counters(&self, direction: Direction) -> StreamResult<DmaCounters> {
        Ok(self.counters(direction))
    }

    fn set_enabled(&self, direction: Direction, enable: bool) -> StreamResult<DmaCounters> {
        let mut channels = self.lock();
        let channel = &mut channels[direction.index()];
        if enable {
            channel.hw = 0;
            channel.sw = 0;
        }
        channel.enabled = enable;
        let counters = DmaCounters {
            hw: channel.hw,
            sw: channel.sw,
        };
        drop(channels);
        self.ready.notify_all();
        Ok(counters)
    }

    fn map_buffers(&self, direction: Direction) -> StreamResult<Box<dyn MappedRegion>> {
        if self.lock()[direction.index()].fail_mapping {
            return Err(StreamError::MappingFailed {
                direction,
                reason: "simulated mapping failure".to_string(),
            });
        }

        let (offset, len) = match self.target {
            DmaTarget::Host => (
                self.info.offset(direction) as usize,
                self.info.geometry(direction).total_size(),
            ),
            DmaTarget::Accelerator => (0, self.region.len),
        };

        let live = Arc::clone(&self.mappings[direction.index()]);
        live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimMapping {
            region: Arc::clone(&self.region),
            offset,
            len,
            live,
        }))
    }

    fn accelerator_buffers(&self, direction: Direction) -> StreamResult<NonNull<u8>> {
        match self.target {
            DmaTarget::Accelerator => Ok(self.region.base),
            DmaTarget::Host => Err(StreamError::MappingFailed {
                direction,
                reason: "simulated buffers are in host memory".to_string(),
            }),
        }
    }

    fn ack_buffers(&self, direction: Direction, through: u64) -> StreamResult<()> {
        let mut channels = self.lock();
        let channel = &mut channels[direction.index()];
        channel.sw = through + 1;
        channel.acks.push(through);
        drop(channels);
        self.ready.notify_all();
        Ok(())
    }

    fn wait_ready(&self, direction: Direction, timeout_ms: u32) -> StreamResult<bool> {
        let channels = self.lock();
        let timeout = Duration::from_millis(u64::from(timeout_ms));
        let (channels, _) = self
            .ready
            .wait_timeout_while(channels, timeout, |channels| {
                !self.is_ready(&channels[direction.index()], direction)
            })
            .unwrap_or_else(PoisonError::into_inner);
        Ok(self.is_ready(&channels[direction.index()], direction))
    }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
