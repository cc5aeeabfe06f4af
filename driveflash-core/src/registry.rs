//! The latest snapshot of removable devices.
use crate::device::Device;
use crate::error::Result;
use crate::platform::Probe;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Holds the most recent enumeration result.
///
/// A snapshot is never edited once published. [`refresh`](Self::refresh) swaps in a whole
/// new list, so readers see either the old list or the new one and nothing in between.
pub struct DeviceRegistry {
    probe: Arc<dyn Probe>,
    snapshot: RwLock<Arc<[Device]>>,
}

impl DeviceRegistry {
    /// Creates an empty registry. Call [`refresh`](Self::refresh) to populate it.
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Re-enumerates devices and replaces the snapshot. On error the previous snapshot is kept.
    pub fn refresh(&self) -> Result<Arc<[Device]>> {
        let devices: Arc<[Device]> = self
            .probe
            .enumerate_removable_devices()?
            .into_iter()
            .filter(|device| device.removable)
            .collect();

        debug!(probe = self.probe.name(), count = devices.len(), "device snapshot replaced");
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = devices.clone();
        Ok(devices)
    }

    /// Returns the current snapshot.
    pub fn list(&self) -> Arc<[Device]> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Looks a device up by path in the current snapshot.
    pub fn find(&self, path: &Path) -> Option<Device> {
        self.list().iter().find(|device| device.path == path).cloned()
    }
}
