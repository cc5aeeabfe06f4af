//! Tunables for the erase and write stages.

use crate::error::{Error, Result};

const MIB: usize = 1024 * 1024;

/// Sector size every transfer is aligned and padded to.
pub const SECTOR_SIZE: usize = 512;

/// Smallest and largest accepted transfer buffer.
pub const MIN_BUFFER_SIZE: usize = MIB;
pub const MAX_BUFFER_SIZE: usize = 4 * MIB;

/// Upper bound on the erase prefix. Enough for any partition table and boot sector.
pub const MAX_ERASE_LEN: u64 = 64 * MIB as u64;

/// Settings shared by the platform probe and the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashConfig {
    /// Bytes moved per transfer. Cancellation and progress are observed at this granularity.
    pub buffer_size: usize,
    /// Length of the leading region zeroed by the erase stage.
    pub erase_len: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4 * MIB,
            erase_len: 10 * MIB as u64,
        }
    }
}

impl FlashConfig {
    /// Sets the transfer buffer size.
    ///
    /// The size must lie between 1 and 4 MiB and be a multiple of [`SECTOR_SIZE`] so that
    /// buffers stay usable for unbuffered (`O_DIRECT`) device I/O.
    pub fn with_buffer_size(mut self, bytes: usize) -> Result<Self> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&bytes) || bytes % SECTOR_SIZE != 0 {
            return Err(Error::InvalidInput(format!(
                "buffer size must be a sector-aligned value between {} and {} bytes, got {}",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE, bytes
            )));
        }
        self.buffer_size = bytes;
        Ok(self)
    }

    /// Sets the erase prefix length. Must be non-zero, sector aligned and at most
    /// [`MAX_ERASE_LEN`].
    pub fn with_erase_len(mut self, bytes: u64) -> Result<Self> {
        if bytes == 0 || bytes > MAX_ERASE_LEN || bytes % SECTOR_SIZE as u64 != 0 {
            return Err(Error::InvalidInput(format!(
                "erase length must be a multiple of {} bytes between {} and {}, got {}",
                SECTOR_SIZE, SECTOR_SIZE, MAX_ERASE_LEN, bytes
            )));
        }
        self.erase_len = bytes;
        Ok(self)
    }

    /// Bytes the erase stage zeroes on a device of `capacity` bytes.
    ///
    /// Never reaches the end of the device: the result stays at least one sector short of
    /// `capacity` and is rounded down to a whole sector.
    pub fn erase_extent(&self, capacity: u64) -> Result<u64> {
        let sector = SECTOR_SIZE as u64;
        let last_full_sector = capacity.saturating_sub(1) / sector * sector;
        let len = self.erase_len.min(last_full_sector);
        if len == 0 {
            return Err(Error::erase_failed(format!(
                "device of {} bytes is too small to clear",
                capacity
            )));
        }
        Ok(len)
    }
}
