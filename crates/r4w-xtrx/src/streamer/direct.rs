//! Direct buffer access
//!
//! Hands DMA buffers to the caller without copying. Acquire looks at the
//! locally cached counters first and only queries the kernel when the ring
//! looks empty (RX) or full (TX), or when the configuration asks for a
//! refresh on every call to catch every overflow/underflow.

use std::ptr::NonNull;
use std::time::Duration;

use tracing::{trace, warn};

use super::{timeout_ms, DmaStreamer};
use crate::error::{StreamError, StreamResult};
use crate::stream::{OpenRing, Stream};
use crate::traits::DmaEngine;
use crate::types::{Acquire, BufferHandle, Direction, StreamHandle, StreamStats, StreamStatus};

impl<E: DmaEngine> DmaStreamer<E> {
    /// Samples per channel in one DMA buffer
    pub fn transfer_unit_size(&self, handle: StreamHandle) -> StreamResult<usize> {
        let stream = self.stream(handle.direction());
        Ok(stream.ring()?.transfer_unit())
    }

    /// Number of DMA buffers in the ring
    pub fn buffer_count(&self, handle: StreamHandle) -> StreamResult<usize> {
        let stream = self.stream(handle.direction());
        Ok(stream.ring()?.geometry.buffer_count)
    }

    /// Address of the DMA buffer in ring slot `slot`
    pub fn buffer_address(&self, handle: StreamHandle, slot: usize) -> StreamResult<NonNull<u8>> {
        let direction = handle.direction();
        let stream = self.stream(direction);
        let ring = stream.ring()?;
        if slot >= ring.geometry.buffer_count {
            return Err(StreamError::InvalidHandle {
                direction,
                handle: slot as u64,
            });
        }
        Ok(ring.layout.resolve(slot))
    }

    /// Acquire the next filled RX buffer
    ///
    /// A zero `timeout` never blocks. An `Overflow` status still hands out a
    /// buffer with valid data; it warns that the hardware is about to lap
    /// user space.
    pub fn acquire_read(&self, handle: StreamHandle, timeout: Duration) -> StreamResult<Acquire> {
        let mut stream = self.stream_for(handle, Direction::Rx)?;
        self.acquire_read_locked(&mut stream, timeout)
    }

    /// Retire every RX buffer up to and including `buffer`
    pub fn release_read(&self, handle: StreamHandle, buffer: BufferHandle) -> StreamResult<()> {
        let mut stream = self.stream_for(handle, Direction::Rx)?;
        self.release_locked(&mut stream, buffer)
    }

    /// Acquire the next free TX buffer
    ///
    /// An `Underflow` status still hands out a buffer; it reports that the
    /// hardware ran out of data before this call.
    pub fn acquire_write(&self, handle: StreamHandle, timeout: Duration) -> StreamResult<Acquire> {
        let mut stream = self.stream_for(handle, Direction::Tx)?;
        self.acquire_write_locked(&mut stream, timeout)
    }

    /// Submit every TX buffer up to and including `buffer`
    ///
    /// The hardware always transmits whole buffers; `num_samples` is the
    /// number of samples the caller filled in.
    pub fn release_write(
        &self,
        handle: StreamHandle,
        buffer: BufferHandle,
        num_samples: usize,
    ) -> StreamResult<()> {
        let mut stream = self.stream_for(handle, Direction::Tx)?;
        let unit = stream.ring()?.transfer_unit();
        if num_samples < unit {
            trace!(handle = buffer.index(), num_samples, unit, "Submitting short TX buffer");
        }
        self.release_locked(&mut stream, buffer)
    }

    pub(super) fn acquire_read_locked(
        &self,
        stream: &mut Stream,
        timeout: Duration,
    ) -> StreamResult<Acquire> {
        let direction = Direction::Rx;
        stream.require_active("acquire a buffer")?;
        let Stream { ring, stats, .. } = stream;
        let ring = ring.as_mut().ok_or(StreamError::NotOpen(direction))?;

        if ring.counters.rx_available() <= 0 || self.config.detect_every_overflow {
            ring.counters.refresh(self.engine.query_counters(direction)?);
        }

        if ring.counters.rx_available() <= 0 {
            if !self.wait(direction, timeout, stats)? {
                return Ok(Acquire::Timeout);
            }
            ring.counters.refresh(self.engine.query_counters(direction)?);
            if ring.counters.rx_available() <= 0 {
                return Err(StreamError::SpuriousWakeup(direction));
            }
        }

        let status = if ring.counters.rx_overflowing() {
            stats.overflows += 1;
            warn!(
                hw = ring.counters.hw(),
                sw = ring.counters.sw(),
                "RX overflow, ring more than half full"
            );
            StreamStatus::Overflow
        } else {
            StreamStatus::Samples(ring.transfer_unit())
        };

        Ok(hand_out(ring, stats, status))
    }

    pub(super) fn acquire_write_locked(
        &self,
        stream: &mut Stream,
        timeout: Duration,
    ) -> StreamResult<Acquire> {
        let direction = Direction::Tx;
        stream.require_active("acquire a buffer")?;
        let Stream { ring, stats, .. } = stream;
        let ring = ring.as_mut().ok_or(StreamError::NotOpen(direction))?;

        if ring.counters.tx_full() || self.config.detect_every_underflow {
            ring.counters.refresh(self.engine.query_counters(direction)?);
        }

        if ring.counters.tx_full() {
            if !self.wait(direction, timeout, stats)? {
                return Ok(Acquire::Timeout);
            }
            ring.counters.refresh(self.engine.query_counters(direction)?);
            if ring.counters.tx_full() {
                return Err(StreamError::SpuriousWakeup(direction));
            }
        }

        // Pending is taken before this buffer is counted
        let status = if ring.counters.tx_pending() < 0 {
            stats.underflows += 1;
            warn!(
                hw = ring.counters.hw(),
                user = ring.counters.user(),
                "TX underflow, hardware ran out of buffers"
            );
            StreamStatus::Underflow
        } else {
            StreamStatus::Samples(ring.transfer_unit())
        };

        Ok(hand_out(ring, stats, status))
    }

    /// Block until the engine is ready; `false` on timeout
    fn wait(
        &self,
        direction: Direction,
        timeout: Duration,
        stats: &mut StreamStats,
    ) -> StreamResult<bool> {
        let ready = !timeout.is_zero() && self.engine.wait_ready(direction, timeout_ms(timeout))?;
        if !ready {
            stats.timeouts += 1;
            trace!(%direction, ?timeout, "Acquire timed out");
        }
        Ok(ready)
    }

    pub(super) fn release_locked(
        &self,
        stream: &mut Stream,
        buffer: BufferHandle,
    ) -> StreamResult<()> {
        let direction = stream.direction;
        let Stream { ring, stats, .. } = stream;
        let ring = ring.as_mut().ok_or(StreamError::NotOpen(direction))?;

        let index = buffer.index();
        if !ring.counters.was_acquired(index) || ring.counters.is_retired(index) {
            return Err(StreamError::InvalidHandle {
                direction,
                handle: index,
            });
        }

        self.engine.ack_buffers(direction, index)?;
        ring.counters.retire_through(index);
        stats.buffers_released += 1;
        trace!(%direction, handle = index, "Released buffer");
        Ok(())
    }
}

/// Give the buffer at the user cursor to the caller
fn hand_out(ring: &mut OpenRing, stats: &mut StreamStats, status: StreamStatus) -> Acquire {
    let index = ring.counters.advance_user();
    let address = ring.layout.resolve(ring.counters.slot(index));
    stats.buffers_acquired += 1;
    Acquire::Buffer {
        handle: BufferHandle(index),
        address,
        status,
    }
}
