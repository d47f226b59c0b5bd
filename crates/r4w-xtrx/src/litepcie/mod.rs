//! LitePCIe kernel DMA engine
//!
//! Talks to the LitePCIe driver through its character device
//! (`/dev/litepcieN`):
//!
//! | Operation         | Kernel interface                             |
//! |-------------------|----------------------------------------------|
//! | request / release | `LITEPCIE_IOCTL_LOCK`                        |
//! | enable / counters | `LITEPCIE_IOCTL_DMA_WRITER` / `_READER`      |
//! | ring geometry     | `LITEPCIE_IOCTL_MMAP_DMA_INFO`               |
//! | ack               | `LITEPCIE_IOCTL_MMAP_DMA_{WRITER,READER}_UPDATE` |
//! | map               | `mmap` at the ring's offset                  |
//! | wait              | `poll`, `POLLIN` for RX, `POLLOUT` for TX    |

mod ioctl;
mod mmap;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::mman::ProtFlags;
use tracing::{debug, info};

pub use mmap::DmaMapping;

use crate::config::StreamerConfig;
use crate::error::{StreamError, StreamResult};
use crate::traits::{DmaEngine, MappedRegion};
use crate::types::{Direction, DmaCounters, DmaMmapInfo};

/// DMA engine backed by the LitePCIe driver
pub struct LitePcieEngine {
    file: File,
    path: PathBuf,
    info: DmaMmapInfo,
    enabled: [AtomicBool; 2],
    accelerator: Option<NonNull<u8>>,
}

impl LitePcieEngine {
    /// Open the character device and read its DMA layout
    pub fn open(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("Cannot open {}. Check the device permissions.", path.display()),
                    )
                } else {
                    e
                }
            })?;

        let info = ioctl::query_mmap_info(file.as_raw_fd()).map_err(io::Error::from)?;
        info!(
            device = %path.display(),
            rx_buffers = info.rx_buf_count,
            rx_buffer_size = info.rx_buf_size,
            tx_buffers = info.tx_buf_count,
            tx_buffer_size = info.tx_buf_size,
            "Opened LitePCIe device"
        );

        Ok(Self {
            file,
            path,
            info,
            enabled: [AtomicBool::new(false), AtomicBool::new(false)],
            accelerator: None,
        })
    }

    /// Open the device named in the configuration
    pub fn from_config(config: &StreamerConfig) -> StreamResult<Self> {
        Self::open(&config.device_path)
    }

    /// Use an externally allocated region as the `(tx, rx)` buffer pairs
    ///
    /// # Safety
    /// `base` must point to a region of at least
    /// `max(tx_count, rx_count) * (tx_size + rx_size)` bytes that is the
    /// DMA target of this device and outlives the engine.
    pub unsafe fn with_accelerator_buffers(mut self, base: NonNull<u8>) -> Self {
        self.accelerator = Some(base);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn control(&self, direction: Direction, enable: bool) -> StreamResult<DmaCounters> {
        let counters = ioctl::dma_control(self.file.as_raw_fd(), direction, enable)
            .map_err(io::Error::from)?;
        self.enabled[direction.index()].store(enable, Ordering::SeqCst);
        Ok(counters)
    }
}

impl DmaEngine for LitePcieEngine {
    fn mmap_info(&self) -> DmaMmapInfo {
        self.info
    }

    fn request(&self, direction: Direction) -> StreamResult<bool> {
        let granted = ioctl::lock(self.file.as_raw_fd(), direction, true).map_err(io::Error::from)?;
        debug!(%direction, granted, "DMA engine request");
        Ok(granted)
    }

    fn release(&self, direction: Direction) -> StreamResult<()> {
        ioctl::lock(self.file.as_raw_fd(), direction, false).map_err(io::Error::from)?;
        self.enabled[direction.index()].store(false, Ordering::SeqCst);
        Ok(())
    }

    fn query_counters(&self, direction: Direction) -> StreamResult<DmaCounters> {
        let enabled = self.enabled[direction.index()].load(Ordering::SeqCst);
        self.control(direction, enabled)
    }

    fn set_enabled(&self, direction: Direction, enable: bool) -> StreamResult<DmaCounters> {
        self.control(direction, enable)
    }

    fn map_buffers(&self, direction: Direction) -> StreamResult<Box<dyn MappedRegion>> {
        let geometry = self.info.geometry(direction);
        let prot = match direction {
            Direction::Rx => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            Direction::Tx => ProtFlags::PROT_WRITE,
        };
        let mapping = DmaMapping::new(
            &self.file,
            self.info.offset(direction),
            geometry.total_size(),
            prot,
        )
        .map_err(|e| StreamError::MappingFailed {
            direction,
            reason: e.to_string(),
        })?;
        Ok(Box::new(mapping))
    }

    fn accelerator_buffers(&self, direction: Direction) -> StreamResult<NonNull<u8>> {
        self.accelerator.ok_or_else(|| StreamError::MappingFailed {
            direction,
            reason: "no accelerator buffers registered with the engine".to_string(),
        })
    }

    fn ack_buffers(&self, direction: Direction, through: u64) -> StreamResult<()> {
        ioctl::update_sw_count(self.file.as_raw_fd(), direction, through + 1)
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn wait_ready(&self, direction: Direction, timeout_ms: u32) -> StreamResult<bool> {
        let events = match direction {
            Direction::Rx => libc::POLLIN,
            Direction::Tx => libc::POLLOUT,
        };
        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events,
            revents: 0,
        };
        let timeout = timeout_ms.min(i32::MAX as u32) as i32;

        let result = unsafe { libc::poll(&mut pollfd, 1, timeout) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(StreamError::WaitFailed {
                direction,
                reason: err.to_string(),
            });
        }
        if result == 0 {
            return Ok(false);
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(StreamError::WaitFailed {
                direction,
                reason: format!("poll revents 0x{:x}", pollfd.revents),
            });
        }
        Ok(pollfd.revents & events != 0)
    }
}

// Safety: the accelerator base is only handed out, never dereferenced here.
unsafe impl Send for LitePcieEngine {}
unsafe impl Sync for LitePcieEngine {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = LitePcieEngine::open("/dev/litepcie-does-not-exist");
        assert!(matches!(result, Err(StreamError::Io(ref e)) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_from_config_uses_device_path() {
        let config = StreamerConfig {
            device_path: PathBuf::from("/nonexistent/litepcie0"),
            ..Default::default()
        };
        assert!(LitePcieEngine::from_config(&config).is_err());
    }
}
