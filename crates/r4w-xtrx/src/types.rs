//! Stream types and data structures

use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Complex 16-bit integer sample, one I/Q pair per 32-bit word
pub type Cs16 = Complex<i16>;

/// Channels carried by every DMA buffer, whatever the subscription
pub const DMA_CHANNELS: usize = 2;

/// Bytes occupied by one sample position in a DMA buffer (two channels of CS16)
pub const BYTES_PER_FRAME: usize = DMA_CHANNELS * std::mem::size_of::<Cs16>();

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device to host
    Rx,
    /// Host to device
    Tx,
}

impl Direction {
    /// Index into per-direction tables
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

impl FromStr for Direction {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rx" => Ok(Direction::Rx),
            "tx" => Ok(Direction::Tx),
            _ => Err(StreamError::InvalidDirection(s.to_string())),
        }
    }
}

/// Host-side sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// 16-bit signed integer I/Q (the hardware's native format)
    #[default]
    Cs16,
    /// 32-bit float I/Q
    Cf32,
    /// 8-bit signed integer I/Q
    Cs8,
}

impl SampleFormat {
    /// SoapySDR-style format name
    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::Cs16 => "CS16",
            SampleFormat::Cf32 => "CF32",
            SampleFormat::Cs8 => "CS8",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CS16" => Ok(SampleFormat::Cs16),
            "CF32" => Ok(SampleFormat::Cf32),
            "CS8" => Ok(SampleFormat::Cs8),
            _ => Err(StreamError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Handle to an open stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    direction: Direction,
}

impl StreamHandle {
    pub(crate) fn new(direction: Direction) -> Self {
        Self { direction }
    }

    /// Direction this handle refers to
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Logical index of an acquired DMA buffer (the pre-increment user count)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    /// Raw logical index
    pub fn index(&self) -> u64 {
        self.0
    }
}

/// Counters reported by the kernel DMA engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaCounters {
    /// Buffers the hardware has produced (RX) or consumed (TX)
    pub hw: u64,
    /// Buffers retired back to the kernel
    pub sw: u64,
}

/// Shape of one direction's DMA ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Size of one DMA buffer in bytes
    pub buffer_size: usize,
    /// Number of buffers in the ring
    pub buffer_count: usize,
}

impl RingGeometry {
    /// Sample positions held by one DMA buffer
    pub fn transfer_unit(&self) -> usize {
        self.buffer_size / BYTES_PER_FRAME
    }

    /// Total size of the ring in bytes
    pub fn total_size(&self) -> usize {
        self.buffer_size * self.buffer_count
    }
}

/// DMA buffer layout as published by the kernel driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaMmapInfo {
    pub tx_buf_offset: u64,
    pub tx_buf_size: u64,
    pub tx_buf_count: u64,
    pub rx_buf_offset: u64,
    pub rx_buf_size: u64,
    pub rx_buf_count: u64,
}

impl DmaMmapInfo {
    /// Ring geometry for a direction
    pub fn geometry(&self, direction: Direction) -> RingGeometry {
        match direction {
            Direction::Rx => RingGeometry {
                buffer_size: self.rx_buf_size as usize,
                buffer_count: self.rx_buf_count as usize,
            },
            Direction::Tx => RingGeometry {
                buffer_size: self.tx_buf_size as usize,
                buffer_count: self.tx_buf_count as usize,
            },
        }
    }

    /// Offset of a direction's ring within the device mapping
    pub fn offset(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Rx => self.rx_buf_offset,
            Direction::Tx => self.tx_buf_offset,
        }
    }
}

/// Outcome of a stream call that did not hit a hard error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Completed normally with this many samples
    Samples(usize),
    /// Nothing became ready within the timeout
    Timeout,
    /// RX ring is close to being lapped; data was still delivered
    Overflow,
    /// TX ring was starved by the hardware
    Underflow,
}

impl StreamStatus {
    /// Sample count, if the call completed normally
    pub fn samples(&self) -> Option<usize> {
        match self {
            StreamStatus::Samples(n) => Some(*n),
            _ => None,
        }
    }

    /// Check for a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamStatus::Timeout)
    }

    /// Whether the stream ended abruptly (SoapySDR `END_ABRUPT`)
    pub fn end_abrupt(&self) -> bool {
        matches!(self, StreamStatus::Overflow)
    }
}

/// Result of acquiring a direct-access buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A buffer was handed out
    Buffer {
        handle: BufferHandle,
        address: NonNull<u8>,
        /// `Samples(transfer_unit)`, `Overflow` or `Underflow`
        status: StreamStatus,
    },
    /// No buffer became available in time
    Timeout,
}

impl Acquire {
    /// Status of the acquisition
    pub fn status(&self) -> StreamStatus {
        match self {
            Acquire::Buffer { status, .. } => *status,
            Acquire::Timeout => StreamStatus::Timeout,
        }
    }

    /// Handle of the acquired buffer
    pub fn handle(&self) -> Option<BufferHandle> {
        match self {
            Acquire::Buffer { handle, .. } => Some(*handle),
            Acquire::Timeout => None,
        }
    }
}

/// Statistics for an open stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Buffers handed out to the caller
    pub buffers_acquired: u64,
    /// Buffers retired back to the kernel
    pub buffers_released: u64,
    /// Samples moved through `read`/`write`
    pub samples_transferred: u64,
    /// Number of overflow events
    pub overflows: u64,
    /// Number of underflow events
    pub underflows: u64,
    /// Number of acquisitions that timed out
    pub timeouts: u64,
    /// Number of times the stream was activated
    pub activations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_unit() {
        let geometry = RingGeometry {
            buffer_size: 8192,
            buffer_count: 256,
        };
        assert_eq!(geometry.transfer_unit(), 1024);
        assert_eq!(geometry.total_size(), 8192 * 256);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("cs16".parse::<SampleFormat>().unwrap(), SampleFormat::Cs16);
        assert_eq!("CF32".parse::<SampleFormat>().unwrap(), SampleFormat::Cf32);
        assert!(matches!(
            "CU8".parse::<SampleFormat>(),
            Err(StreamError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_parse_direction() {
        assert_eq!("RX".parse::<Direction>().unwrap(), Direction::Rx);
        assert_eq!("tx".parse::<Direction>().unwrap(), Direction::Tx);
        assert!(matches!(
            "both".parse::<Direction>(),
            Err(StreamError::InvalidDirection(_))
        ));
    }

    #[test]
    fn test_mmap_info_geometry() {
        let info = DmaMmapInfo {
            tx_buf_offset: 0,
            tx_buf_size: 4096,
            tx_buf_count: 8,
            rx_buf_offset: 32768,
            rx_buf_size: 8192,
            rx_buf_count: 16,
        };
        assert_eq!(info.geometry(Direction::Rx).buffer_count, 16);
        assert_eq!(info.geometry(Direction::Tx).buffer_size, 4096);
        assert_eq!(info.offset(Direction::Rx), 32768);
    }

    #[test]
    fn test_status_helpers() {
        assert_eq!(StreamStatus::Samples(12).samples(), Some(12));
        assert!(StreamStatus::Overflow.end_abrupt());
        assert!(!StreamStatus::Underflow.end_abrupt());
        assert!(Acquire::Timeout.status().is_timeout());
        assert_eq!(Acquire::Timeout.handle(), None);
    }
}
