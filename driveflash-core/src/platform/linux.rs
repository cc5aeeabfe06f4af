use crate::cancel::CancelToken;
use crate::config::FlashConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::{Probe, ProgressFn};
use crate::transfer::{self, Transfer};
use nix::ioctl_read;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Device operations backed by `/sys/block` and raw `/dev` nodes.
pub struct LinuxProbe {
    config: FlashConfig,
}

impl LinuxProbe {
    pub fn new(config: FlashConfig) -> Self {
        Self { config }
    }

    fn transfer(&self) -> Transfer {
        // Device nodes are opened with O_DIRECT, which needs whole sectors.
        Transfer::new(&self.config, true)
    }
}

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// The `/dev` node for a disk name reported by `sysinfo`, which may be bare (`sdb1`) or
/// already a full path (`/dev/sdb1`).
fn dev_node(name: &OsStr) -> PathBuf {
    Path::new("/dev").join(name)
}

/// Whether the disk `sysinfo` reports as `disk_name` is `device` itself or one of its
/// partitions.
fn is_on_device(disk_name: &OsStr, device: &Path) -> bool {
    get_parent_device_path(&dev_node(disk_name)) == device
}

/// Builds a label from the vendor and model strings sysfs exposes for the device.
fn device_label(device_name: &str) -> String {
    let parts: Vec<String> = ["device/vendor", "device/model"]
        .iter()
        .filter_map(|file| read_sys_file(device_name, file).ok())
        .filter(|s| !s.is_empty())
        .collect();

    if parts.is_empty() {
        device_name.to_string()
    } else {
        parts.join(" ")
    }
}

fn open_device_for_write(device: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(device)
}

impl Probe for LinuxProbe {
    fn name(&self) -> &'static str {
        "linux"
    }

    /// Scans `/sys/block` for removable devices.
    ///
    /// The filtering logic is as follows:
    /// 1.  Find the disk holding the root filesystem (e.g., `/dev/nvme0n1`) and exclude it.
    /// 2.  Skip any loop devices (e.g., `loop0`).
    /// 3.  Check the `/sys/block/<device>/removable` flag, which is the most reliable
    ///     indicator of a removable device like a USB drive or SD card.
    /// 4.  Check the `/sys/block/<device>/size` to filter out devices that report a size
    ///     of zero, which often corresponds to empty card readers.
    fn enumerate_removable_devices(&self) -> Result<Vec<Device>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let system_disk_parent = disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map(|disk| get_parent_device_path(&dev_node(disk.name())));

        match &system_disk_parent {
            Some(parent) => debug!(system_disk = %parent.display(), "excluding system disk"),
            None => warn!("could not determine the system disk; relying on removable flag only"),
        }

        let block_dir = fs::read_dir("/sys/block").map_err(Error::EnumerationFailed)?;
        let mut devices = Vec::new();

        for entry in block_dir.filter_map(|entry| entry.ok()) {
            let device_name = entry.file_name().to_string_lossy().to_string();
            let device_path = PathBuf::from("/dev/").join(&device_name);

            if device_name.starts_with("loop")
                || system_disk_parent.as_deref() == Some(device_path.as_path())
            {
                continue;
            }

            let is_removable = read_sys_file(&device_name, "removable")
                .map(|s| s == "1")
                .unwrap_or(false);

            if !is_removable {
                continue;
            }

            let size_sectors = read_sys_file(&device_name, "size")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);

            if size_sectors == 0 {
                debug!(device = %device_name, "skipping removable device with no media");
                continue;
            }

            // Try to find a mount point by checking the `sysinfo` list.
            let mount_point = disks
                .iter()
                .filter(|disk| is_on_device(disk.name(), &device_path))
                .map(|disk| disk.mount_point().to_string_lossy().to_string())
                .find(|mp| !mp.is_empty());

            devices.push(Device {
                path: device_path,
                label: device_label(&device_name),
                // /sys/block sizes are always in 512-byte units, whatever the sector size.
                capacity: Some(size_sectors * 512),
                removable: true,
                mount_point,
            });
        }

        debug!(count = devices.len(), "enumerated removable devices");
        Ok(devices)
    }

    fn query_capacity(&self, device: &Path) -> Result<u64> {
        let unavailable = || Error::CapacityUnavailable(device.display().to_string());

        let file = File::open(device).map_err(|e| {
            debug!(device = %device.display(), error = %e, "cannot open device for size query");
            unavailable()
        })?;

        let mut size_bytes: u64 = 0;
        // SAFETY: the descriptor stays open for the duration of the call and the kernel
        // writes a single u64 into `size_bytes`.
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) }.map_err(|e| {
            debug!(device = %device.display(), error = %e, "BLKGETSIZE64 failed");
            unavailable()
        })?;

        if size_bytes == 0 {
            return Err(unavailable());
        }
        Ok(size_bytes)
    }

    fn raw_write(
        &self,
        device: &Path,
        source: &mut dyn Read,
        total: u64,
        progress: &mut ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut device_file = open_device_for_write(device).map_err(Error::WriteFailed)?;
        info!(device = %device.display(), bytes = total, "streaming image to device");

        self.transfer()
            .run(source, &mut device_file, total, progress, cancel)
            .map_err(|e| transfer::into_error(e, Error::WriteFailed))?;

        device_file.sync_all().map_err(Error::WriteFailed)?;
        Ok(())
    }

    fn erase(&self, device: &Path) -> Result<()> {
        let capacity = self
            .query_capacity(device)
            .map_err(|e| Error::erase_failed(e.to_string()))?;
        let len = self.config.erase_extent(capacity)?;

        let mut device_file = open_device_for_write(device).map_err(Error::EraseFailed)?;
        info!(device = %device.display(), bytes = len, "zeroing partition table region");

        self.transfer()
            .zero_fill(&mut device_file, len, &CancelToken::new())
            .map_err(Error::EraseFailed)?;

        device_file.sync_all().map_err(Error::EraseFailed)?;
        Ok(())
    }
}
