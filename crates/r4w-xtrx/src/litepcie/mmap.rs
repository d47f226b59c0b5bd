//! Memory-mapped DMA rings

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use libc::{c_void, off_t};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::warn;

use crate::traits::MappedRegion;

/// A DMA ring mapped from the LitePCIe device
///
/// Unmapped on drop.
pub struct DmaMapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl DmaMapping {
    /// Map `len` bytes of the device at `offset`
    pub fn new(file: &File, offset: u64, len: usize, prot: ProtFlags) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty DMA mapping"))?;

        // Safety: a fresh shared mapping of the device; nothing else in this
        // process aliases it.
        let ptr = unsafe {
            mmap(
                None,
                length,
                prot,
                MapFlags::MAP_SHARED,
                file,
                offset as off_t,
            )
        }
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("mmap failed: {}", e)))?;

        Ok(Self { ptr, len })
    }
}

impl MappedRegion for DmaMapping {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        // Safety: ptr/len describe a mapping created in `new` and not yet unmapped
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap of DMA ring failed: {}", e);
        }
    }
}

// Safety: the mapping is plain shared memory; the streamer serializes access
// per direction.
unsafe impl Send for DmaMapping {}
unsafe impl Sync for DmaMapping {}
