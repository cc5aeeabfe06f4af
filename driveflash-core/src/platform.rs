//! Provides platform-specific device operations.
//!
//! Everything that differs between operating systems sits behind the [`Probe`] trait:
//! discovering removable devices, querying their true size, zeroing the partition table
//! region and streaming an image onto the raw device. One adapter exists per supported OS
//! family and is compiled in with `#[cfg]`. [`native`] picks the adapter once, so callers
//! never branch on the platform themselves.
//!
//! The adapters assume the process already holds whatever privilege raw device access
//! needs. A permission failure surfaces as [`crate::Error::EraseFailed`] or
//! [`crate::Error::WriteFailed`].

use crate::cancel::CancelToken;
use crate::config::FlashConfig;
use crate::device::Device;
use crate::error::Result;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxProbe;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::MacProbe;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::WindowsProbe;

/// Progress callback for [`Probe::raw_write`], called with `(bytes_written, total_bytes)`.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

/// The device operations a platform must provide.
///
/// All methods block. They are meant to run on a worker thread, never on a UI thread.
pub trait Probe: Send + Sync {
    /// Short name of the OS family, for logging.
    fn name(&self) -> &'static str;

    /// Lists removable devices only.
    ///
    /// When removability cannot be determined for a device it must be left out: a missing
    /// device is an inconvenience, a listed system disk is a hazard.
    fn enumerate_removable_devices(&self) -> Result<Vec<Device>>;

    /// Returns the total size of the device in bytes, or
    /// [`crate::Error::CapacityUnavailable`]. Never a guessed value.
    fn query_capacity(&self, device: &Path) -> Result<u64>;

    /// Streams exactly `total` bytes from `source` onto the raw device.
    ///
    /// Data moves through a bounded buffer. `progress` runs after every buffer flush and
    /// `cancel` is checked before every buffer. Success is only returned after the device
    /// has been synced to stable storage.
    fn raw_write(
        &self,
        device: &Path,
        source: &mut dyn Read,
        total: u64,
        progress: &mut ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Destroys the partition table by zeroing only the leading region of the device,
    /// then syncs. Never zeroes the whole device.
    fn erase(&self, device: &Path) -> Result<()>;
}

/// Builds the probe for the running OS.
///
/// # Errors
///
/// Returns [`crate::Error::UnsupportedPlatform`] on operating systems without an adapter.
#[cfg(target_os = "linux")]
pub fn native(config: &FlashConfig) -> Result<Arc<dyn Probe>> {
    Ok(Arc::new(LinuxProbe::new(*config)))
}

#[cfg(target_os = "macos")]
pub fn native(config: &FlashConfig) -> Result<Arc<dyn Probe>> {
    Ok(Arc::new(MacProbe::new(*config)))
}

#[cfg(target_os = "windows")]
pub fn native(config: &FlashConfig) -> Result<Arc<dyn Probe>> {
    Ok(Arc::new(WindowsProbe::new(*config)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn native(_config: &FlashConfig) -> Result<Arc<dyn Probe>> {
    Err(crate::Error::UnsupportedPlatform(std::env::consts::OS))
}
