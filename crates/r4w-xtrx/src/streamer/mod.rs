//! # DMA Streamer
//!
//! [`DmaStreamer`] drives one RX and one TX stream over a [`DmaEngine`].
//! Each stream moves through:
//!
//! ```text
//!   closed ──open──▶ opened ──activate──▶ active
//!     ▲                │  ▲                 │
//!     └─────close──────┘  └───deactivate────┘
//! ```
//!
//! Two access styles share the same ring:
//!
//! - direct buffer access ([`acquire_read`](DmaStreamer::acquire_read),
//!   [`release_write`](DmaStreamer::release_write), ...) hands out the DMA
//!   buffers themselves
//! - [`read`](DmaStreamer::read) and [`write`](DmaStreamer::write) copy
//!   between caller buffers and the ring, converting the channel layout
//!
//! All methods take `&self`. Each direction is guarded by its own lock, so
//! an RX thread and a TX thread never contend; open and close are serialized
//! across both directions.

mod direct;
mod transfer;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{validate_channels, StreamerConfig};
use crate::error::{StreamError, StreamResult};
use crate::layout::{BufferLayout, DmaTarget};
use crate::ring::RingCounters;
use crate::stream::{OpenRing, Stream, TxRemainder};
use crate::traits::DmaEngine;
use crate::types::{Direction, SampleFormat, StreamHandle, StreamStats};

/// Zero-copy streamer over a kernel DMA engine
pub struct DmaStreamer<E: DmaEngine> {
    engine: E,
    config: StreamerConfig,
    lifecycle: Mutex<()>,
    streams: [Mutex<Stream>; 2],
}

impl<E: DmaEngine> DmaStreamer<E> {
    /// Create a streamer; no DMA resources are taken until `open`
    pub fn new(engine: E, config: StreamerConfig) -> Self {
        Self {
            engine,
            config,
            lifecycle: Mutex::new(()),
            streams: [
                Mutex::new(Stream::new(Direction::Rx)),
                Mutex::new(Stream::new(Direction::Tx)),
            ],
        }
    }

    /// The underlying engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    fn stream(&self, direction: Direction) -> MutexGuard<'_, Stream> {
        self.streams[direction.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the stream behind a handle, checking the expected direction
    fn stream_for(
        &self,
        handle: StreamHandle,
        expected: Direction,
    ) -> StreamResult<MutexGuard<'_, Stream>> {
        if handle.direction() != expected {
            return Err(StreamError::InvalidDirection(format!(
                "{} operation on {} stream",
                expected,
                handle.direction()
            )));
        }
        Ok(self.stream(expected))
    }

    /// Open a stream
    ///
    /// Takes the direction's DMA engine, maps its ring and leaves the engine
    /// disabled. An empty `channels` subscribes the configured defaults.
    /// Either everything is acquired or nothing is: a failed mapping gives
    /// the engine back before returning.
    pub fn open(
        &self,
        direction: Direction,
        format: SampleFormat,
        channels: &[usize],
    ) -> StreamResult<StreamHandle> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);

        if format != SampleFormat::Cs16 {
            return Err(StreamError::UnsupportedFormat(format.name().to_string()));
        }
        let channels = if channels.is_empty() {
            self.config.default_channels.clone()
        } else {
            channels.to_vec()
        };
        validate_channels(&channels)?;

        let mut stream = self.stream(direction);
        if stream.is_open() {
            return Err(StreamError::AlreadyOpen(direction));
        }

        if !self.engine.request(direction)? {
            return Err(StreamError::ResourceUnavailable(direction));
        }

        let ring = match self.map_ring(direction) {
            Ok(ring) => ring,
            Err(e) => {
                if let Err(release) = self.engine.release(direction) {
                    warn!("Failed to release {} DMA engine after error: {}", direction, release);
                }
                return Err(e);
            }
        };

        info!(
            %direction,
            buffers = ring.geometry.buffer_count,
            buffer_size = ring.geometry.buffer_size,
            transfer_unit = ring.transfer_unit(),
            ?channels,
            "Opened stream"
        );

        stream.format = format;
        stream.channels = channels;
        stream.ring = Some(ring);
        stream.active = false;
        stream.remainder.clear();
        stream.stats = StreamStats::default();

        Ok(StreamHandle::new(direction))
    }

    /// Map a direction's ring and park its engine
    fn map_ring(&self, direction: Direction) -> StreamResult<OpenRing> {
        let info = self.engine.mmap_info();
        let geometry = info.geometry(direction);
        if geometry.buffer_count == 0 || geometry.transfer_unit() == 0 {
            return Err(StreamError::MappingFailed {
                direction,
                reason: format!(
                    "driver reports {} buffers of {} bytes",
                    geometry.buffer_count, geometry.buffer_size
                ),
            });
        }

        let mapping = self.engine.map_buffers(direction)?;
        let layout = match self.config.target {
            DmaTarget::Host => {
                if mapping.len() < geometry.total_size() {
                    return Err(StreamError::MappingFailed {
                        direction,
                        reason: format!(
                            "mapping holds {} bytes, ring needs {}",
                            mapping.len(),
                            geometry.total_size()
                        ),
                    });
                }
                BufferLayout::host(mapping.as_ptr(), geometry.buffer_size)
            }
            DmaTarget::Accelerator => {
                let base = self.engine.accelerator_buffers(direction)?;
                BufferLayout::interleaved(base, &info, direction)
            }
        };

        // Make sure the engine is stopped; its counters restart on activate.
        let counters = self.engine.set_enabled(direction, false)?;

        let mut ring = OpenRing::new(mapping, layout, geometry);
        ring.counters.refresh(counters);
        Ok(ring)
    }

    /// Close a stream, releasing its engine and unmapping its ring
    ///
    /// Closing a stream that is not open does nothing.
    pub fn close(&self, handle: StreamHandle) -> StreamResult<()> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let direction = handle.direction();
        let mut stream = self.stream(direction);
        self.close_locked(&mut stream)
    }

    fn close_locked(&self, stream: &mut Stream) -> StreamResult<()> {
        let direction = stream.direction;
        if !stream.is_open() {
            debug!("{} stream already closed", direction);
            return Ok(());
        }

        let mut result = Ok(());
        if stream.active {
            if let Err(e) = self.engine.set_enabled(direction, false) {
                warn!("Failed to stop {} DMA engine: {}", direction, e);
                result = Err(e);
            }
        }
        if let Err(e) = self.engine.release(direction) {
            warn!("Failed to release {} DMA engine: {}", direction, e);
            if result.is_ok() {
                result = Err(e);
            }
        }

        // Unmaps even if the kernel calls failed
        stream.reset();
        info!(%direction, stats = ?stream.stats, "Closed stream");
        result
    }

    /// Start the DMA engine
    ///
    /// The kernel restarts its counters, the user cursor returns to zero and
    /// any partially filled TX buffer is forgotten.
    pub fn activate(&self, handle: StreamHandle) -> StreamResult<()> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let direction = handle.direction();
        let mut stream = self.stream(direction);
        stream.ring()?;
        let counters = self.engine.set_enabled(direction, true)?;

        let Stream {
            ring,
            active,
            remainder,
            stats,
            ..
        } = &mut *stream;
        if let Some(ring) = ring.as_mut() {
            ring.counters.refresh(counters);
            ring.counters.reset_user();
        }
        remainder.clear();
        *active = true;
        stats.activations += 1;

        info!(%direction, hw = counters.hw, sw = counters.sw, "Activated stream");
        Ok(())
    }

    /// Stop the DMA engine, keeping the mapping and counters
    pub fn deactivate(&self, handle: StreamHandle) -> StreamResult<()> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let direction = handle.direction();
        let mut stream = self.stream(direction);
        stream.ring()?;

        self.engine.set_enabled(direction, false)?;
        stream.active = false;

        info!(%direction, "Deactivated stream");
        Ok(())
    }

    pub fn is_open(&self, direction: Direction) -> bool {
        self.stream(direction).is_open()
    }

    pub fn is_active(&self, direction: Direction) -> bool {
        self.stream(direction).active
    }

    /// Host sample format of an open stream
    pub fn format(&self, handle: StreamHandle) -> StreamResult<SampleFormat> {
        let stream = self.stream(handle.direction());
        stream.ring()?;
        Ok(stream.format)
    }

    /// Channels subscribed by an open stream
    pub fn channels(&self, handle: StreamHandle) -> StreamResult<Vec<usize>> {
        let stream = self.stream(handle.direction());
        stream.ring()?;
        Ok(stream.channels.clone())
    }

    /// Statistics since the stream was opened
    pub fn stream_stats(&self, handle: StreamHandle) -> StreamResult<StreamStats> {
        let stream = self.stream(handle.direction());
        stream.ring()?;
        Ok(stream.stats.clone())
    }

    /// Snapshot of the ring cursors
    pub fn counters(&self, handle: StreamHandle) -> StreamResult<RingCounters> {
        let stream = self.stream(handle.direction());
        Ok(stream.ring()?.counters.clone())
    }

    /// The partially filled TX buffer carried between `write` calls
    pub fn pending_write_samples(&self, handle: StreamHandle) -> StreamResult<TxRemainder> {
        let stream = self.stream_for(handle, Direction::Tx)?;
        stream.ring()?;
        Ok(stream.remainder.clone())
    }
}

impl<E: DmaEngine> Drop for DmaStreamer<E> {
    fn drop(&mut self) {
        for direction in [Direction::Rx, Direction::Tx] {
            let mut stream = self.stream(direction);
            if let Err(e) = self.close_locked(&mut stream) {
                warn!("Error closing {} stream on drop: {}", direction, e);
            }
        }
    }
}

/// Milliseconds for the engine's wait primitive, rounded up
pub(crate) fn timeout_ms(timeout: Duration) -> u32 {
    let nanos = timeout.as_nanos();
    let ms = nanos.div_ceil(1_000_000);
    ms.min(u128::from(u32::MAX)) as u32
}
