//! Kernel DMA engine interface
//!
//! [`DmaEngine`] is everything the streamer needs from the device driver.
//! The LitePCIe backend implements it with ioctls on the character device,
//! the simulated backend implements it in memory.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{StreamError, StreamResult};
use crate::types::{Direction, DmaCounters, DmaMmapInfo};

/// A memory region shared with the DMA engine
///
/// Dropping the region unmaps it.
pub trait MappedRegion: Send + Sync {
    /// Base address of the mapping
    fn as_ptr(&self) -> NonNull<u8>;

    /// Length of the mapping in bytes
    fn len(&self) -> usize;

    /// Check if the mapping is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait for kernel-side DMA engines
///
/// All methods take `&self`: the kernel serializes its own state, and the
/// streamer serializes calls per direction.
pub trait DmaEngine: Send + Sync {
    /// Buffer layout published by the driver
    fn mmap_info(&self) -> DmaMmapInfo;

    /// Request exclusive use of a direction's DMA engine
    ///
    /// Returns `false` if the kernel refused (engine busy or denied).
    fn request(&self, direction: Direction) -> StreamResult<bool>;

    /// Give a direction's DMA engine back to the kernel
    fn release(&self, direction: Direction) -> StreamResult<()>;

    /// Read the current hardware/software counters
    fn query_counters(&self, direction: Direction) -> StreamResult<DmaCounters>;

    /// Enable or disable a direction's DMA engine, returning the counters
    fn set_enabled(&self, direction: Direction, enable: bool) -> StreamResult<DmaCounters>;

    /// Map a direction's DMA ring into user space
    fn map_buffers(&self, direction: Direction) -> StreamResult<Box<dyn MappedRegion>>;

    /// Base of the externally-addressable region holding RX/TX buffer pairs
    ///
    /// Only engines that place their rings in accelerator memory support
    /// this.
    fn accelerator_buffers(&self, direction: Direction) -> StreamResult<NonNull<u8>> {
        Err(StreamError::MappingFailed {
            direction,
            reason: "engine has no accelerator-addressable buffers".to_string(),
        })
    }

    /// Tell the kernel that every buffer up to and including `through` is retired
    fn ack_buffers(&self, direction: Direction, through: u64) -> StreamResult<()>;

    /// Block until the engine has buffers to hand out, or the timeout expires
    ///
    /// Returns `false` on timeout.
    fn wait_ready(&self, direction: Direction, timeout_ms: u32) -> StreamResult<bool>;
}

/// Share one engine between a streamer and whoever drives the hardware side
impl<E: DmaEngine + ?Sized> DmaEngine for Arc<E> {
    fn mmap_info(&self) -> DmaMmapInfo {
        (**self).mmap_info()
    }

    fn request(&self, direction: Direction) -> StreamResult<bool> {
        (**self).request(direction)
    }

    fn release(&self, direction: Direction) -> StreamResult<()> {
        (**self).release(direction)
    }

    fn query_counters(&self, direction: Direction) -> StreamResult<DmaCounters> {
        (**self).query_counters(direction)
    }

    fn set_enabled(&self, direction: Direction, enable: bool) -> StreamResult<DmaCounters> {
        (**self).set_enabled(direction, enable)
    }

    fn map_buffers(&self, direction: Direction) -> StreamResult<Box<dyn MappedRegion>> {
        (**self).map_buffers(direction)
    }

    fn accelerator_buffers(&self, direction: Direction) -> StreamResult<NonNull<u8>> {
        (**self).accelerator_buffers(direction)
    }

    fn ack_buffers(&self, direction: Direction, through: u64) -> StreamResult<()> {
        (**self).ack_buffers(direction, through)
    }

    fn wait_ready(&self, direction: Direction, timeout_ms: u32) -> StreamResult<bool> {
        (**self).wait_ready(direction, timeout_ms)
    }
}
