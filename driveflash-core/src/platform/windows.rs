use crate::cancel::CancelToken;
use crate::config::FlashConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::{Probe, ProgressFn};
use crate::transfer::{self, Transfer};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::iter;
use std::mem;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};
use windows_sys::Win32::Foundation::{CloseHandle, GENERIC_READ, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, GetDriveTypeW, GetLogicalDrives,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    GET_LENGTH_INFORMATION, IOCTL_DISK_GET_LENGTH_INFO, IOCTL_STORAGE_GET_DEVICE_NUMBER,
    STORAGE_DEVICE_NUMBER,
};

/// `GetDriveTypeW` result for removable media.
const DRIVE_REMOVABLE: u32 = 2;
const PHYSICAL_DRIVE_PREFIX: &str = r"\\.\PhysicalDrive";

/// Device operations backed by the Win32 volume APIs and `diskpart`.
pub struct WindowsProbe {
    config: FlashConfig,
}

impl WindowsProbe {
    pub fn new(config: FlashConfig) -> Self {
        Self { config }
    }

    fn transfer(&self) -> Transfer {
        // Physical drive handles only accept whole-sector writes.
        Transfer::new(&self.config, true)
    }
}

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful CreateFileW and is closed exactly once.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

fn open_handle(path: &str, access: u32) -> io::Result<OwnedHandle> {
    let name = wide(path);
    // SAFETY: `name` is a NUL-terminated UTF-16 string that outlives the call.
    let handle = unsafe {
        CreateFileW(
            name.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedHandle(handle))
}

/// Issues an output-only `DeviceIoControl` that fills a plain C struct.
fn ioctl_out<T: Copy>(handle: &OwnedHandle, code: u32) -> io::Result<T> {
    // SAFETY: T is a windows-sys POD struct for which the all-zero pattern is valid, and the
    // output buffer size passed to the kernel matches its size.
    unsafe {
        let mut out: T = mem::zeroed();
        let mut returned: u32 = 0;
        let ok = DeviceIoControl(
            handle.0,
            code,
            std::ptr::null(),
            0,
            &mut out as *mut T as *mut c_void,
            mem::size_of::<T>() as u32,
            &mut returned,
            std::ptr::null_mut(),
        );
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(out)
    }
}

/// Letters of the mounted volumes the OS reports as removable.
fn removable_volume_letters() -> Vec<char> {
    // SAFETY: no arguments; returns a bitmask of drive letters.
    let mask = unsafe { GetLogicalDrives() };

    (0..26u8)
        .filter(|i| mask & (1 << i) != 0)
        .map(|i| (b'A' + i) as char)
        .filter(|letter| {
            let root = wide(&format!("{}:\\", letter));
            // SAFETY: `root` is NUL-terminated and outlives the call.
            unsafe { GetDriveTypeW(root.as_ptr()) == DRIVE_REMOVABLE }
        })
        .collect()
}

fn disk_number_of_volume(letter: char) -> io::Result<u32> {
    let volume = open_handle(&format!(r"\\.\{}:", letter), 0)?;
    let number: STORAGE_DEVICE_NUMBER = ioctl_out(&volume, IOCTL_STORAGE_GET_DEVICE_NUMBER)?;
    Ok(number.DeviceNumber)
}

/// `\\.\PhysicalDrive3` -> `3`.
fn disk_number(device: &Path) -> Option<u32> {
    device
        .to_str()?
        .strip_prefix(PHYSICAL_DRIVE_PREFIX)?
        .parse()
        .ok()
}

fn diskpart_clean_script(disk: u32) -> String {
    format!("select disk {}\nclean\n", disk)
}

/// Runs `diskpart` with a script held in a temp file. The file is removed when this
/// function returns, whatever the outcome.
fn run_diskpart(script: &str) -> io::Result<()> {
    let mut script_file = tempfile::Builder::new()
        .prefix("driveflash-diskpart-")
        .suffix(".txt")
        .tempfile()?;
    script_file.write_all(script.as_bytes())?;
    script_file.flush()?;

    debug!(script = %script_file.path().display(), "running diskpart");
    let output = Command::new("diskpart")
        .arg("/s")
        .arg(script_file.path())
        .output()?;

    if !output.status.success() {
        return Err(io::Error::other(format!(
            "diskpart exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stdout).trim()
        )));
    }
    Ok(())
}

impl Probe for WindowsProbe {
    fn name(&self) -> &'static str {
        "windows"
    }

    /// Maps every removable volume to the physical drive backing it. Several volumes on one
    /// stick collapse into a single device.
    fn enumerate_removable_devices(&self) -> Result<Vec<Device>> {
        let mut disks: BTreeMap<u32, Vec<char>> = BTreeMap::new();
        for letter in removable_volume_letters() {
            match disk_number_of_volume(letter) {
                Ok(number) => disks.entry(number).or_default().push(letter),
                Err(e) => debug!(volume = %letter, error = %e, "skipping volume"),
            }
        }

        let devices: Vec<Device> = disks
            .into_iter()
            .map(|(number, letters)| {
                let path = format!("{}{}", PHYSICAL_DRIVE_PREFIX, number);
                let volumes: Vec<String> = letters.iter().map(|l| format!("{}:", l)).collect();
                Device {
                    capacity: self.query_capacity(Path::new(&path)).ok(),
                    label: format!("Removable disk ({})", volumes.join(", ")),
                    mount_point: letters.first().map(|l| format!("{}:\\", l)),
                    removable: true,
                    path: path.into(),
                }
            })
            .collect();

        debug!(count = devices.len(), "enumerated removable devices");
        Ok(devices)
    }

    /// Reads the total length of the physical drive, not the free space of a volume on it.
    fn query_capacity(&self, device: &Path) -> Result<u64> {
        let unavailable = || Error::CapacityUnavailable(device.display().to_string());
        let path = device.to_str().ok_or_else(unavailable)?;

        let handle = open_handle(path, GENERIC_READ).map_err(|_| unavailable())?;
        let info: GET_LENGTH_INFORMATION =
            ioctl_out(&handle, IOCTL_DISK_GET_LENGTH_INFO).map_err(|_| unavailable())?;

        match u64::try_from(info.Length) {
            Ok(bytes) if bytes > 0 => Ok(bytes),
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
        let mut device_file = OpenOptions::new()
            .write(true)
            .open(device)
            .map_err(Error::WriteFailed)?;
        info!(device = %device.display(), bytes = total, "streaming image to device");

        self.transfer()
            .run(source, &mut device_file, total, progress, cancel)
            .map_err(|e| transfer::into_error(e, Error::WriteFailed))?;

        device_file.sync_all().map_err(Error::WriteFailed)?;
        Ok(())
    }

    /// Runs `diskpart`'s `clean`, which wipes the partition and hidden sectors only.
    fn erase(&self, device: &Path) -> Result<()> {
        let number = disk_number(device).ok_or_else(|| {
            Error::erase_failed(format!("{} is not a physical drive path", device.display()))
        })?;

        info!(disk = number, "clearing partition table with diskpart");
        run_diskpart(&diskpart_clean_script(number)).map_err(Error::EraseFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_number() {
        assert_eq!(disk_number(Path::new(r"\\.\PhysicalDrive3")), Some(3));
        assert_eq!(disk_number(Path::new(r"\\.\E:")), None);
        assert_eq!(disk_number(Path::new(r"\\.\PhysicalDriveX")), None);
    }

    #[test]
    fn test_clean_script_selects_disk() {
        assert_eq!(diskpart_clean_script(2), "select disk 2\nclean\n");
    }
}
