//! # DMA Ring Counters
//!
//! Three monotonically increasing cursors into a fixed ring of DMA buffers:
//!
//! - `hw`: where the hardware has written to (RX) or read from (TX)
//! - `sw`: how far buffers have been retired back to the kernel
//! - `user`: where user space is currently reading from / writing to
//!
//! Keeping `user` separate from `sw` lets the streamer hand out buffers
//! without a syscall, only talking to the kernel when retiring them.
//!
//! The counters only ever grow, so ordering is decided by subtraction and the
//! ring slot by `count % buffer_count`.

use crate::types::DmaCounters;

/// Cursor bookkeeping for one direction's DMA ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCounters {
    hw: u64,
    sw: u64,
    user: u64,
    buffer_count: u64,
}

impl RingCounters {
    /// Create counters for a ring of `buffer_count` buffers
    pub fn new(buffer_count: usize) -> Self {
        Self {
            hw: 0,
            sw: 0,
            user: 0,
            buffer_count: buffer_count as u64,
        }
    }

    /// Hardware cursor
    #[inline]
    pub fn hw(&self) -> u64 {
        self.hw
    }

    /// Retired cursor
    #[inline]
    pub fn sw(&self) -> u64 {
        self.sw
    }

    /// User cursor
    #[inline]
    pub fn user(&self) -> u64 {
        self.user
    }

    /// Number of buffers in the ring
    #[inline]
    pub fn buffer_count(&self) -> u64 {
        self.buffer_count
    }

    /// Ring slot for a logical buffer index
    #[inline]
    pub fn slot(&self, index: u64) -> usize {
        (index % self.buffer_count) as usize
    }

    /// Take fresh hardware/software counters from the kernel
    pub fn refresh(&mut self, counters: DmaCounters) {
        self.hw = counters.hw;
        self.sw = counters.sw;
    }

    /// Start a new logical window at user cursor zero
    pub fn reset_user(&mut self) {
        self.user = 0;
    }

    /// Hand out the buffer at the user cursor
    ///
    /// Returns the pre-increment index.
    pub fn advance_user(&mut self) -> u64 {
        let index = self.user;
        self.user += 1;
        index
    }

    /// Record that every buffer up to and including `index` was retired
    pub fn retire_through(&mut self, index: u64) {
        self.sw = self.sw.max(index.saturating_add(1));
    }

    /// RX: buffers produced by hardware but not yet handed to the user
    #[inline]
    pub fn rx_available(&self) -> i64 {
        self.hw.wrapping_sub(self.user) as i64
    }

    /// RX: buffers produced by hardware but not yet retired
    #[inline]
    pub fn rx_backlog(&self) -> i64 {
        self.hw.wrapping_sub(self.sw) as i64
    }

    /// RX: the ring is more than half full of unretired buffers
    #[inline]
    pub fn rx_overflowing(&self) -> bool {
        self.rx_backlog() > (self.buffer_count / 2) as i64
    }

    /// TX: buffers handed to the user but not yet consumed by hardware
    ///
    /// Negative only if the hardware ran ahead of the user (underflow).
    #[inline]
    pub fn tx_pending(&self) -> i64 {
        self.user.wrapping_sub(self.hw) as i64
    }

    /// TX: no buffer is free to fill
    #[inline]
    pub fn tx_full(&self) -> bool {
        self.tx_pending() >= self.buffer_count as i64
    }

    /// TX: buffers free to fill
    #[inline]
    pub fn tx_space(&self) -> i64 {
        self.buffer_count as i64 - self.tx_pending()
    }

    /// Check whether `index` has been handed out in the current window
    #[inline]
    pub fn was_acquired(&self, index: u64) -> bool {
        index < self.user
    }

    /// Check whether `index` is already covered by the retired cursor
    #[inline]
    pub fn is_retired(&self, index: u64) -> bool {
        index < self.sw
    }
}
