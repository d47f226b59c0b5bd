//! Per-direction stream state

use std::slice;

use crate::error::{StreamError, StreamResult};
use crate::layout::BufferLayout;
use crate::ring::RingCounters;
use crate::traits::MappedRegion;
use crate::types::{
    BufferHandle, Cs16, Direction, RingGeometry, SampleFormat, StreamStats, DMA_CHANNELS,
};

/// TX buffer that is acquired but not yet completely filled
///
/// A transmit call rarely lines up with the DMA buffer size, so the partly
/// packed buffer is carried over to the next call. The handle is only held
/// while `samples > 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxRemainder {
    handle: Option<BufferHandle>,
    offset: usize,
    samples: usize,
}

impl TxRemainder {
    /// Buffer currently being filled
    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    /// Samples already packed into the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Samples the buffer can still take
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub(crate) fn start(&mut self, handle: BufferHandle, capacity: usize) {
        self.handle = Some(handle);
        self.offset = 0;
        self.samples = capacity;
    }

    /// Record `n` packed samples; returns true once the buffer is full
    pub(crate) fn consume(&mut self, n: usize) -> bool {
        debug_assert!(n <= self.samples);
        self.samples -= n;
        self.offset += n;
        self.samples == 0
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A mapped DMA ring, held only while the stream is open
pub(crate) struct OpenRing {
    /// Keeps the mapping alive; dropping it unmaps the ring
    _mapping: Box<dyn MappedRegion>,
    pub layout: BufferLayout,
    pub geometry: RingGeometry,
    pub counters: RingCounters,
}

impl OpenRing {
    pub fn new(mapping: Box<dyn MappedRegion>, layout: BufferLayout, geometry: RingGeometry) -> Self {
        Self {
            _mapping: mapping,
            layout,
            geometry,
            counters: RingCounters::new(geometry.buffer_count),
        }
    }

    /// Samples per channel in one DMA buffer
    pub fn transfer_unit(&self) -> usize {
        self.geometry.transfer_unit()
    }

    /// Interleaved view of the buffer behind a logical index
    pub fn buffer(&self, handle: BufferHandle) -> &[Cs16] {
        let addr = self.layout.resolve(self.counters.slot(handle.0));
        // Safety: the slot lies inside the mapping owned by `self`, and the
        // ring protocol hands the buffer to us until it is released.
        unsafe {
            slice::from_raw_parts(
                addr.as_ptr() as *const Cs16,
                self.transfer_unit() * DMA_CHANNELS,
            )
        }
    }

    /// Mutable interleaved view of the buffer behind a logical index
    pub fn buffer_mut(&mut self, handle: BufferHandle) -> &mut [Cs16] {
        let addr = self.layout.resolve(self.counters.slot(handle.0));
        // Safety: as for `buffer`, and `&mut self` keeps the view unique.
        unsafe {
            slice::from_raw_parts_mut(
                addr.as_ptr() as *mut Cs16,
                self.transfer_unit() * DMA_CHANNELS,
            )
        }
    }
}

/// State of one direction
pub(crate) struct Stream {
    pub direction: Direction,
    pub format: SampleFormat,
    pub channels: Vec<usize>,
    pub ring: Option<OpenRing>,
    pub active: bool,
    pub remainder: TxRemainder,
    pub stats: StreamStats,
}

impl Stream {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            format: SampleFormat::Cs16,
            channels: Vec::new(),
            ring: None,
            active: false,
            remainder: TxRemainder::default(),
            stats: StreamStats::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ring.is_some()
    }

    pub fn state_name(&self) -> &'static str {
        match (self.ring.is_some(), self.active) {
            (false, _) => "closed",
            (true, false) => "not activated",
            (true, true) => "active",
        }
    }

    /// The open ring, or `NotOpen`
    pub fn ring(&self) -> StreamResult<&OpenRing> {
        self.ring.as_ref().ok_or(StreamError::NotOpen(self.direction))
    }

    /// Fail unless the stream is open and activated
    pub fn require_active(&self, operation: &'static str) -> StreamResult<()> {
        if !self.is_open() {
            return Err(StreamError::NotOpen(self.direction));
        }
        if !self.active {
            return Err(StreamError::InvalidState {
                direction: self.direction,
                state: self.state_name(),
                operation,
            });
        }
        Ok(())
    }

    /// Forget everything tied to the current mapping
    pub fn reset(&mut self) {
        self.ring = None;
        self.active = false;
        self.channels.clear();
        self.remainder.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remainder_lifecycle() {
        let mut rem = TxRemainder::default();
        assert_eq!(rem.handle(), None);

        rem.start(BufferHandle(7), 100);
        assert_eq!(rem.handle(), Some(BufferHandle(7)));
        assert!(!rem.consume(60));
        assert_eq!(rem.offset(), 60);
        assert_eq!(rem.samples(), 40);

        assert!(rem.consume(40));
        assert_eq!(rem.samples(), 0);

        rem.clear();
        assert_eq!(rem, TxRemainder::default());
    }

    #[test]
    fn test_closed_stream_state() {
        let stream = Stream::new(Direction::Tx);
        assert!(!stream.is_open());
        assert_eq!(stream.state_name(), "closed");
        assert!(matches!(stream.ring(), Err(StreamError::NotOpen(Direction::Tx))));
        assert!(matches!(
            stream.require_active("acquire a buffer"),
            Err(StreamError::NotOpen(Direction::Tx))
        ));
    }
}
