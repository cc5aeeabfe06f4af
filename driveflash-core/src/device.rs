use std::fmt;
use std::path::PathBuf;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A removable block device discovered on the system.
///
/// Instances are immutable snapshots produced by a [`crate::platform::Probe`]. A fresh
/// enumeration replaces them rather than updating them in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path used to open the device (e.g. `/dev/sdb`, `/dev/disk4` or
    /// `\\.\PhysicalDrive2`).
    pub path: PathBuf,
    /// Human-readable label, such as the vendor and model or the volume letter.
    pub label: String,
    /// Total size in bytes, or `None` if the platform could not report it.
    pub capacity: Option<u64>,
    /// Whether the OS marks the device as removable. Probes only surface removable devices.
    pub removable: bool,
    /// A mount point of the device or one of its partitions, if any.
    pub mount_point: Option<String>,
}

impl Device {
    pub fn capacity_gb(&self) -> Option<f64> {
        self.capacity.map(|bytes| bytes as f64 / GIB)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.capacity_gb() {
            Some(gb) => format!("{:.1} GB", gb),
            None => "size unknown".to_string(),
        };
        let mount_info = match &self.mount_point {
            Some(mp) => format!("[Mounted at {}]", mp),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<20} {:<24} {:>10} {}",
            self.path.display(),
            self.label,
            size,
            mount_info
        )
    }
}
