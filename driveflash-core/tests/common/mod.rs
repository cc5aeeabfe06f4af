//! In-memory probe for exercising the orchestrator without real hardware.
#![allow(dead_code)]

use driveflash_core::platform::ProgressFn;
use driveflash_core::{CancelToken, Device, Error, Probe, Result};
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Bytes the fake erase zeroes.
pub const ERASE_LEN: usize = 4096;
/// Bytes the fake moves per buffer.
pub const CHUNK: usize = 64 * 1024;
/// Filler for "previous contents" of a fake device.
pub const OLD_BYTE: u8 = 0xEE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Enumerate,
    QueryCapacity(PathBuf),
    Erase(PathBuf),
    RawWrite(PathBuf),
}

/// A one-shot barrier: the probe blocks in `pass` until the test calls `open`, and the
/// test can wait until the probe has arrived.
#[derive(Default)]
pub struct Gate {
    state: Mutex<(bool, bool)>, // (entered, open)
    cv: Condvar,
}

impl Gate {
    pub fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.cv.notify_all();
        while !state.1 {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn wait_entered(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.0 {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().1 = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
pub struct FakeProbe {
    devices: Mutex<Vec<Device>>,
    disks: Mutex<HashMap<PathBuf, Vec<u8>>>,
    calls: Mutex<Vec<Call>>,
    pub fail_enumerate: AtomicBool,
    pub fail_capacity: AtomicBool,
    pub fail_erase: AtomicBool,
    pub fail_write: AtomicBool,
    /// Blocks `query_capacity` until opened.
    pub capacity_gate: Option<Gate>,
    /// Blocks `erase` until opened.
    pub erase_gate: Option<Gate>,
    /// Blocks `raw_write` after its first buffer until opened.
    pub write_gate: Option<Gate>,
}

pub fn device(path: &str, capacity: Option<u64>) -> Device {
    Device {
        path: PathBuf::from(path),
        label: format!("Fake {}", path),
        capacity,
        removable: true,
        mount_point: None,
    }
}

impl FakeProbe {
    pub fn new(devices: Vec<Device>) -> Self {
        let probe = Self::default();
        probe.set_devices(devices);
        probe
    }

    pub fn with_capacity_gate(mut self) -> Self {
        self.capacity_gate = Some(Gate::default());
        self
    }

    pub fn with_erase_gate(mut self) -> Self {
        self.erase_gate = Some(Gate::default());
        self
    }

    pub fn with_write_gate(mut self) -> Self {
        self.write_gate = Some(Gate::default());
        self
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        let mut disks = self.disks.lock().unwrap();
        for d in &devices {
            disks
                .entry(d.path.clone())
                .or_insert_with(|| vec![OLD_BYTE; 2 * ERASE_LEN]);
        }
        *self.devices.lock().unwrap() = devices;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn touched_device(&self) -> bool {
        self.calls()
            .iter()
            .any(|c| matches!(c, Call::Erase(_) | Call::RawWrite(_)))
    }

    pub fn disk(&self, path: &str) -> Vec<u8> {
        self.disks.lock().unwrap()[Path::new(path)].clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn write_at(&self, device: &Path, offset: usize, data: &[u8]) {
        let mut disks = self.disks.lock().unwrap();
        let disk = disks.entry(device.to_path_buf()).or_default();
        if disk.len() < offset + data.len() {
            disk.resize(offset + data.len(), 0);
        }
        disk[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Probe for FakeProbe {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn enumerate_removable_devices(&self) -> Result<Vec<Device>> {
        self.record(Call::Enumerate);
        if self.fail_enumerate.load(Ordering::SeqCst) {
            return Err(Error::EnumerationFailed(io::Error::other("no /sys")));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    fn query_capacity(&self, device: &Path) -> Result<u64> {
        self.record(Call::QueryCapacity(device.to_path_buf()));
        if let Some(gate) = &self.capacity_gate {
            gate.pass();
        }
        let unavailable = || Error::CapacityUnavailable(device.display().to_string());
        if self.fail_capacity.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.path == device)
            .and_then(|d| d.capacity)
            .ok_or_else(unavailable)
    }

    fn raw_write(
        &self,
        device: &Path,
        source: &mut dyn Read,
        total: u64,
        progress: &mut ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.record(Call::RawWrite(device.to_path_buf()));
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(Error::WriteFailed(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }

        let mut buffer = vec![0u8; CHUNK];
        let mut written = 0u64;
        while written < total {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let n = std::cmp::min(CHUNK as u64, total - written) as usize;
            source
                .read_exact(&mut buffer[..n])
                .map_err(Error::WriteFailed)?;
            self.write_at(device, written as usize, &buffer[..n]);
            written += n as u64;
            progress(written, total);

            if let Some(gate) = &self.write_gate {
                gate.pass();
            }
        }
        Ok(())
    }

    fn erase(&self, device: &Path) -> Result<()> {
        self.record(Call::Erase(device.to_path_buf()));
        if let Some(gate) = &self.erase_gate {
            gate.pass();
        }
        if self.fail_erase.load(Ordering::SeqCst) {
            return Err(Error::EraseFailed(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        self.write_at(device, 0, &[0u8; ERASE_LEN]);
        Ok(())
    }
}
