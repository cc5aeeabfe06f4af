use crate::cancel::CancelToken;
use crate::config::FlashConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::{Probe, ProgressFn};
use crate::transfer::{self, Transfer};
use nix::ioctl_read;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

ioctl_read!(dkiocgetblocksize, b'd', 24, u32);
ioctl_read!(dkiocgetblockcount, b'd', 25, u64);

/// Device operations backed by `diskutil` and the raw `/dev/rdiskN` nodes.
pub struct MacProbe {
    config: FlashConfig,
}

impl MacProbe {
    pub fn new(config: FlashConfig) -> Self {
        Self { config }
    }

    fn transfer(&self) -> Transfer {
        Transfer::new(&self.config, true)
    }
}

fn diskutil(args: &[&str]) -> io::Result<String> {
    debug!(?args, "running diskutil");
    let output = Command::new("diskutil").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "diskutil {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Picks the whole-disk nodes out of `diskutil list` output.
///
/// Only headers explicitly tagged both external and physical are kept, so disk images and
/// internal disks never show up even if the utility was invoked without a filter.
fn parse_disk_list(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter(|line| line.starts_with("/dev/disk"))
        .filter(|line| line.contains("external") && line.contains("physical"))
        .filter_map(|line| line.split_whitespace().next())
        .map(PathBuf::from)
        .collect()
}

/// Reads a `Key: value` field from `diskutil info` output.
fn parse_info_field(output: &str, key: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key)
            .then(|| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// `/dev/disk4` -> `/dev/rdisk4`. The raw node bypasses the buffer cache.
fn raw_node(device: &Path) -> PathBuf {
    let s = device.to_string_lossy();
    match s.strip_prefix("/dev/disk") {
        Some(rest) => PathBuf::from(format!("/dev/rdisk{}", rest)),
        None => device.to_path_buf(),
    }
}

/// Unmounts every volume of `device`; the raw node refuses writes while any is mounted.
fn unmount_disk(device: &Path, wrap: fn(io::Error) -> Error) -> Result<()> {
    let path = device.to_string_lossy();
    diskutil(&["unmountDisk", &path]).map_err(wrap)?;
    Ok(())
}

impl Probe for MacProbe {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn enumerate_removable_devices(&self) -> Result<Vec<Device>> {
        let listing =
            diskutil(&["list", "external", "physical"]).map_err(Error::EnumerationFailed)?;

        let devices = parse_disk_list(&listing)
            .into_iter()
            .map(|path| {
                let info = diskutil(&["info", &path.to_string_lossy()]).unwrap_or_default();
                let label = parse_info_field(&info, "Device / Media Name")
                    .unwrap_or_else(|| path.to_string_lossy().into_owned());
                let mount_point = parse_info_field(&info, "Mount Point");

                Device {
                    capacity: self.query_capacity(&path).ok(),
                    path,
                    label,
                    removable: true,
                    mount_point,
                }
            })
            .collect::<Vec<_>>();

        debug!(count = devices.len(), "enumerated removable devices");
        Ok(devices)
    }

    fn query_capacity(&self, device: &Path) -> Result<u64> {
        let unavailable = || Error::CapacityUnavailable(device.display().to_string());
        let file = File::open(raw_node(device)).map_err(|_| unavailable())?;
        let fd = file.as_raw_fd();

        let mut block_size: u32 = 0;
        let mut block_count: u64 = 0;
        // SAFETY: `fd` stays open across both calls; each writes a single integer.
        unsafe {
            dkiocgetblocksize(fd, &mut block_size).map_err(|_| unavailable())?;
            dkiocgetblockcount(fd, &mut block_count).map_err(|_| unavailable())?;
        }

        match (block_size as u64).checked_mul(block_count) {
            Some(bytes) if bytes > 0 => Ok(bytes),
            _ => Err(unavailable()),
        }
    }

    fn raw_write(
        &self,
        device: &Path,
        source: &mut dyn Read,
        total: u64,
        progress: &mut ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        unmount_disk(device, Error::WriteFailed)?;

        let node = raw_node(device);
        let mut device_file = OpenOptions::new()
            .write(true)
            .open(&node)
            .map_err(Error::WriteFailed)?;
        info!(device = %node.display(), bytes = total, "streaming image to device");

        self.transfer()
            .run(source, &mut device_file, total, progress, cancel)
            .map_err(|e| transfer::into_error(e, Error::WriteFailed))?;

        device_file.sync_all().map_err(Error::WriteFailed)?;
        Ok(())
    }

    fn erase(&self, device: &Path) -> Result<()> {
        unmount_disk(device, Error::EraseFailed)?;

        let capacity = self
            .query_capacity(device)
            .map_err(|e| Error::erase_failed(e.to_string()))?;
        let len = self.config.erase_extent(capacity)?;

        let node = raw_node(device);
        let mut device_file = OpenOptions::new()
            .write(true)
            .open(&node)
            .map_err(Error::EraseFailed)?;
        info!(device = %node.display(), bytes = len, "zeroing partition table region");

        self.transfer()
            .zero_fill(&mut device_file, len, &CancelToken::new())
            .map_err(Error::EraseFailed)?;

        device_file.sync_all().map_err(Error::EraseFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
/dev/disk0 (internal, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:      GUID_partition_scheme                        *500.3 GB   disk0
/dev/disk3 (synthesized):
   0:      APFS Container Scheme -                      +494.4 GB   disk3
/dev/disk4 (external, physical):
   0:     FDisk_partition_scheme                        *15.5 GB    disk4
   1:             Windows_FAT_32 NO NAME                 15.5 GB    disk4s1
/dev/disk5 (disk image):
   0:                            Installer              +2.1 GB     disk5
";

    #[test]
    fn test_parse_disk_list_keeps_external_physical_only() {
        assert_eq!(parse_disk_list(LIST), vec![PathBuf::from("/dev/disk4")]);
        assert!(parse_disk_list("").is_empty());
    }

    #[test]
    fn test_parse_info_field() {
        let info = "   Device Identifier:         disk4\n   Device / Media Name:       Cruzer Blade\n   Mount Point:               \n";
        assert_eq!(
            parse_info_field(info, "Device / Media Name").as_deref(),
            Some("Cruzer Blade")
        );
        assert_eq!(parse_info_field(info, "Mount Point"), None);
        assert_eq!(parse_info_field(info, "Protocol"), None);
    }

    #[test]
    fn test_raw_node() {
        assert_eq!(raw_node(Path::new("/dev/disk4")), PathBuf::from("/dev/rdisk4"));
        assert_eq!(raw_node(Path::new("/dev/rdisk4")), PathBuf::from("/dev/rdisk4"));
    }
}
