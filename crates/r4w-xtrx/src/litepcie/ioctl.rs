//! LitePCIe character device ioctls
//!
//! The kernel calls the RX engine the DMA *writer* (it writes into host
//! memory) and the TX engine the DMA *reader*.

use std::os::unix::io::RawFd;

use crate::types::{Direction, DmaCounters, DmaMmapInfo};

const LITEPCIE_IOCTL: u8 = b'S';

/// `struct litepcie_ioctl_dma_writer` / `_reader`
///
/// The driver starts or stops the engine whenever `enable` differs from its
/// current state, so a plain counter query must pass the current state.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaControl {
    pub enable: u8,
    pub hw_count: i64,
    pub sw_count: i64,
}

/// `struct litepcie_ioctl_mmap_dma_info`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapDmaInfo {
    pub dma_tx_buf_offset: u64,
    pub dma_tx_buf_size: u64,
    pub dma_tx_buf_count: u64,
    pub dma_rx_buf_offset: u64,
    pub dma_rx_buf_size: u64,
    pub dma_rx_buf_count: u64,
}

/// `struct litepcie_ioctl_mmap_dma_update`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapDmaUpdate {
    pub sw_count: i64,
}

/// `struct litepcie_ioctl_lock`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaLock {
    pub dma_reader_request: u8,
    pub dma_writer_request: u8,
    pub dma_reader_release: u8,
    pub dma_writer_release: u8,
    pub dma_reader_status: u8,
    pub dma_writer_status: u8,
}

nix::ioctl_readwrite!(dma_writer, LITEPCIE_IOCTL, 21, DmaControl);
nix::ioctl_readwrite!(dma_reader, LITEPCIE_IOCTL, 22, DmaControl);
nix::ioctl_read!(mmap_dma_info, LITEPCIE_IOCTL, 24, MmapDmaInfo);
nix::ioctl_write_ptr!(mmap_dma_writer_update, LITEPCIE_IOCTL, 25, MmapDmaUpdate);
nix::ioctl_write_ptr!(mmap_dma_reader_update, LITEPCIE_IOCTL, 26, MmapDmaUpdate);
nix::ioctl_readwrite!(dma_lock, LITEPCIE_IOCTL, 27, DmaLock);

impl From<MmapDmaInfo> for DmaMmapInfo {
    fn from(info: MmapDmaInfo) -> Self {
        DmaMmapInfo {
            tx_buf_offset: info.dma_tx_buf_offset,
            tx_buf_size: info.dma_tx_buf_size,
            tx_buf_count: info.dma_tx_buf_count,
            rx_buf_offset: info.dma_rx_buf_offset,
            rx_buf_size: info.dma_rx_buf_size,
            rx_buf_count: info.dma_rx_buf_count,
        }
    }
}

impl From<DmaControl> for DmaCounters {
    fn from(control: DmaControl) -> Self {
        DmaCounters {
            hw: control.hw_count as u64,
            sw: control.sw_count as u64,
        }
    }
}

/// Set the engine state and read back its counters
pub fn dma_control(fd: RawFd, direction: Direction, enable: bool) -> nix::Result<DmaCounters> {
    let mut control = DmaControl {
        enable: enable as u8,
        ..Default::default()
    };
    // Safety: `control` is a valid, exclusively borrowed struct of the
    // layout the driver expects.
    unsafe {
        match direction {
            Direction::Rx => dma_writer(fd, &mut control)?,
            Direction::Tx => dma_reader(fd, &mut control)?,
        };
    }
    Ok(control.into())
}

/// Request or release a direction's engine; returns whether the kernel agreed
pub fn lock(fd: RawFd, direction: Direction, request: bool) -> nix::Result<bool> {
    let mut lock = DmaLock::default();
    match (direction, request) {
        (Direction::Rx, true) => lock.dma_writer_request = 1,
        (Direction::Tx, true) => lock.dma_reader_request = 1,
        (Direction::Rx, false) => lock.dma_writer_release = 1,
        (Direction::Tx, false) => lock.dma_reader_release = 1,
    }
    // Safety: as for `dma_control`
    unsafe { dma_lock(fd, &mut lock)? };

    let status = match direction {
        Direction::Rx => lock.dma_writer_status,
        Direction::Tx => lock.dma_reader_status,
    };
    Ok(status != 0)
}

/// Buffer layout published by the driver
pub fn query_mmap_info(fd: RawFd) -> nix::Result<DmaMmapInfo> {
    let mut info = MmapDmaInfo::default();
    // Safety: as for `dma_control`
    unsafe { mmap_dma_info(fd, &mut info)? };
    Ok(info.into())
}

/// Move the kernel's software counter to `sw_count`
pub fn update_sw_count(fd: RawFd, direction: Direction, sw_count: u64) -> nix::Result<()> {
    let update = MmapDmaUpdate {
        sw_count: sw_count as i64,
    };
    // Safety: `update` outlives the call and is only read by the driver
    unsafe {
        match direction {
            Direction::Rx => mmap_dma_writer_update(fd, &update)?,
            Direction::Tx => mmap_dma_reader_update(fd, &update)?,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_layouts() {
        assert_eq!(size_of::<DmaControl>(), 24);
        assert_eq!(size_of::<MmapDmaInfo>(), 48);
        assert_eq!(size_of::<MmapDmaUpdate>(), 8);
        assert_eq!(size_of::<DmaLock>(), 6);
    }

    #[test]
    fn test_conversions() {
        let counters: DmaCounters = DmaControl {
            enable: 1,
            hw_count: 12,
            sw_count: 10,
        }
        .into();
        assert_eq!(counters, DmaCounters { hw: 12, sw: 10 });

        let info: DmaMmapInfo = MmapDmaInfo {
            dma_rx_buf_size: 8192,
            dma_rx_buf_count: 256,
            ..Default::default()
        }
        .into();
        assert_eq!(info.geometry(Direction::Rx).transfer_unit(), 1024);
    }
}
