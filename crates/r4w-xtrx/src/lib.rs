//! R4W XTRX DMA Streaming
//!
//! Zero-copy sample streaming between user space and a LitePCIe-based XTRX
//! radio. The kernel driver owns a ring of DMA buffers per direction; this
//! crate maps the rings, tracks the hardware, retired and user cursors
//! through them, and offers two ways to move samples:
//!
//! - **Direct buffer access**: acquire a DMA buffer, work on it in place,
//!   release it back to the kernel
//! - **Read/write**: copy samples between per-channel caller buffers and the
//!   interleaved DMA layout, sign-extending the 12-bit RX samples
//!
//! # Feature Flags
//!
//! - `sim` (default): Software DMA engine for development without hardware
//! - `litepcie`: LitePCIe kernel driver backend (requires Linux)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use r4w_xtrx::{Cs16, Direction, DmaStreamer, SampleFormat, SimulatedDma, StreamerConfig};
//!
//! let streamer = DmaStreamer::new(SimulatedDma::new(), StreamerConfig::default());
//! let rx = streamer.open(Direction::Rx, SampleFormat::Cs16, &[0, 1])?;
//! streamer.activate(rx)?;
//!
//! let unit = streamer.transfer_unit_size(rx)?;
//! let mut ch0 = vec![Cs16::new(0, 0); unit];
//! let mut ch1 = vec![Cs16::new(0, 0); unit];
//! let status = streamer.read(rx, &mut [&mut ch0[..], &mut ch1[..]], unit, Duration::from_millis(100))?;
//! println!("{:?}", status);
//! # Ok::<(), r4w_xtrx::StreamError>(())
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod logging;
pub mod ring;
pub mod traits;
pub mod types;

mod stream;
mod streamer;

#[cfg(feature = "sim")]
pub mod sim;

#[cfg(all(feature = "litepcie", target_os = "linux"))]
pub mod litepcie;

// Re-export main types
pub use config::StreamerConfig;
pub use error::{StreamError, StreamResult};
pub use layout::{BufferLayout, DmaTarget};
pub use ring::RingCounters;
pub use stream::TxRemainder;
pub use streamer::DmaStreamer;
pub use traits::{DmaEngine, MappedRegion};
pub use types::{
    Acquire, BufferHandle, Cs16, Direction, DmaCounters, DmaMmapInfo, RingGeometry, SampleFormat,
    StreamHandle, StreamStats, StreamStatus,
};

#[cfg(feature = "sim")]
pub use sim::SimulatedDma;

#[cfg(all(feature = "litepcie", target_os = "linux"))]
pub use litepcie::LitePcieEngine;
