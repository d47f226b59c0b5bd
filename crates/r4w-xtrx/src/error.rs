//! Streaming error types
//!
//! Only hard failures live here. Timeouts, overflows and underflows are
//! ordinary stream outcomes and are reported through
//! [`StreamStatus`](crate::types::StreamStatus) instead.

use std::io;
use thiserror::Error;

use crate::types::Direction;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while setting up or driving a DMA stream
#[derive(Error, Debug)]
pub enum StreamError {
    /// Requested sample format is not the hardware's native encoding
    #[error("Unsupported stream format '{0}', only CS16 is supported")]
    UnsupportedFormat(String),

    /// The direction already has an open stream
    #[error("{0} stream already opened")]
    AlreadyOpen(Direction),

    /// The kernel refused to hand out the DMA engine
    #[error("{0} DMA engine not available")]
    ResourceUnavailable(Direction),

    /// Mapping the DMA buffers into user space failed
    #[error("Mapping {direction} DMA buffers failed: {reason}")]
    MappingFailed { direction: Direction, reason: String },

    /// Operation issued against a stream of the wrong direction
    #[error("Invalid direction: {0}")]
    InvalidDirection(String),

    /// Subscribed channel does not exist in the DMA buffers
    #[error("Invalid channel {channel}, hardware has {available}")]
    InvalidChannel { channel: usize, available: usize },

    /// Caller buffers do not match the subscription
    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// A buffer handle that is not currently outstanding was released
    #[error("Invalid {direction} buffer handle {handle}")]
    InvalidHandle { direction: Direction, handle: u64 },

    /// The stream has not been opened
    #[error("{0} stream is not open")]
    NotOpen(Direction),

    /// Lifecycle ordering was not respected by the caller
    #[error("{direction} stream is {state}, cannot {operation}")]
    InvalidState {
        direction: Direction,
        state: &'static str,
        operation: &'static str,
    },

    /// The wait primitive signalled readiness but no buffer became available
    #[error("{0} wait woke up without a buffer becoming available")]
    SpuriousWakeup(Direction),

    /// Waiting on the DMA engine failed
    #[error("Waiting for {direction} DMA failed: {reason}")]
    WaitFailed { direction: Direction, reason: String },

    /// Kernel or device I/O failure
    #[error("Device I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StreamError {
    /// Check if the stream is still usable after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::InvalidState { .. })
    }

    /// Check if this error points at a bug in the caller
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidHandle { .. }
                | StreamError::InvalidDirection(_)
                | StreamError::InvalidChannel { .. }
                | StreamError::BufferSizeMismatch { .. }
                | StreamError::InvalidState { .. }
                | StreamError::NotOpen(_)
        )
    }
}
