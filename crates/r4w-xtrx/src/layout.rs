//! Direct buffer addressing
//!
//! Resolves a ring slot to the address of its DMA buffer. Where the buffers
//! live is fixed when the streamer is built:
//!
//! - **Host**: each direction has its own mapping, buffers packed back to back.
//! - **Accelerator**: the kernel places RX and TX buffers pairwise in one
//!   externally-addressable region, `(tx, rx)` for every ring index:
//!
//! ```text
//! ┌──────┬──────┬──────┬──────┬──────┬──────┐
//! │ tx 0 │ rx 0 │ tx 1 │ rx 1 │ tx 2 │ rx 2 │ ...
//! └──────┴──────┴──────┴──────┴──────┴──────┘
//! ```

use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::types::{Direction, DmaMmapInfo};

/// Where DMA buffers live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmaTarget {
    /// Ordinary host memory, one mapping per direction
    #[default]
    Host,
    /// Accelerator memory, RX/TX buffers interleaved in one region
    Accelerator,
}

/// Addressing strategy for one direction's ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLayout {
    /// Buffers back to back from `base`
    Host { base: NonNull<u8>, buffer_size: usize },
    /// Buffers interleaved as `(tx, rx)` pairs from `base`
    Interleaved {
        base: NonNull<u8>,
        tx_buffer_size: usize,
        rx_buffer_size: usize,
        direction: Direction,
    },
}

impl BufferLayout {
    /// Host layout for a direction's own mapping
    pub fn host(base: NonNull<u8>, buffer_size: usize) -> Self {
        BufferLayout::Host { base, buffer_size }
    }

    /// Interleaved layout within a shared accelerator region
    pub fn interleaved(base: NonNull<u8>, info: &DmaMmapInfo, direction: Direction) -> Self {
        BufferLayout::Interleaved {
            base,
            tx_buffer_size: info.tx_buf_size as usize,
            rx_buffer_size: info.rx_buf_size as usize,
            direction,
        }
    }

    /// Byte offset of a ring slot from the layout base
    pub fn offset(&self, slot: usize) -> usize {
        match *self {
            BufferLayout::Host { buffer_size, .. } => slot * buffer_size,
            BufferLayout::Interleaved {
                tx_buffer_size,
                rx_buffer_size,
                direction,
                ..
            } => {
                let pair = slot * (tx_buffer_size + rx_buffer_size);
                match direction {
                    Direction::Rx => pair + tx_buffer_size,
                    Direction::Tx => pair,
                }
            }
        }
    }

    /// Address of a ring slot's buffer
    pub fn resolve(&self, slot: usize) -> NonNull<u8> {
        let base = match *self {
            BufferLayout::Host { base, .. } | BufferLayout::Interleaved { base, .. } => base,
        };
        // Safety: slot < buffer_count, so the offset stays inside the region
        // the base was obtained from.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset(slot))) }
    }
}

// Safety: the layout only carries addresses; access is synchronized by the
// ring protocol.
unsafe impl Send for BufferLayout {}
unsafe impl Sync for BufferLayout {}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DmaMmapInfo {
        DmaMmapInfo {
            tx_buf_offset: 0,
            tx_buf_size: 4096,
            tx_buf_count: 8,
            rx_buf_offset: 32768,
            rx_buf_size: 8192,
            rx_buf_count: 8,
        }
    }

    #[test]
    fn test_host_offsets() {
        let layout = BufferLayout::host(NonNull::dangling(), 8192);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(3), 3 * 8192);
    }

    #[test]
    fn test_interleaved_offsets() {
        let base = NonNull::dangling();
        let tx = BufferLayout::interleaved(base, &info(), Direction::Tx);
        let rx = BufferLayout::interleaved(base, &info(), Direction::Rx);

        assert_eq!(tx.offset(0), 0);
        assert_eq!(rx.offset(0), 4096);
        assert_eq!(tx.offset(2), 2 * (4096 + 8192));
        assert_eq!(rx.offset(2), 2 * (4096 + 8192) + 4096);
    }

    #[test]
    fn test_resolve_adds_offset() {
        let mut region = vec![0u8; 4 * 64];
        let base = NonNull::new(region.as_mut_ptr()).unwrap();
        let layout = BufferLayout::host(base, 64);

        let addr = layout.resolve(3);
        assert_eq!(addr.as_ptr() as usize - base.as_ptr() as usize, 192);
    }

    #[test]
    fn test_target_serde() {
        let target: DmaTarget = serde_yaml::from_str("accelerator").unwrap();
        assert_eq!(target, DmaTarget::Accelerator);
        assert_eq!(DmaTarget::default(), DmaTarget::Host);
    }
}
