//! The two destructive phases of a job.
//!
//! Both block the calling thread. The erase stage refuses to start once cancellation has
//! been requested; the write stage observes cancellation between transfer buffers.
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::ImageSource;
use crate::platform::{Probe, ProgressFn};
use tracing::debug;

/// Destroys the partition table of `device`.
pub fn erase(probe: &dyn Probe, device: &Device, cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    debug!(device = %device.path.display(), "erase stage");
    probe.erase(&device.path)
}

/// Streams `image` onto `device`, reporting `(bytes_written, total_bytes)` after each buffer.
pub fn write(
    probe: &dyn Probe,
    device: &Device,
    image: &ImageSource,
    progress: &mut ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut reader = image.reader().map_err(Error::WriteFailed)?;
    debug!(
        device = %device.path.display(),
        image = %image.path.display(),
        "write stage"
    );
    probe.raw_write(&device.path, &mut reader, image.size, progress, cancel)
}
