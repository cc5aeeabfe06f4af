//! Runs write jobs on worker threads and reports their progress.
//!
//! A job moves through `Idle → Validating → Erasing → Writing → Succeeded | Failed`.
//! Status events are delivered to the status sink in order, from the worker thread. The
//! completion sink runs exactly once, as the last thing the job does, and no status event
//! follows it.
use crate::cancel::CancelToken;
use crate::config::FlashConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::ImageSource;
use crate::job::{JobEvent, JobEvents, JobHandle, JobState, StatusEvent, WriteOutcome};
use crate::platform::{self, Probe};
use crate::registry::DeviceRegistry;
use crate::stage;
use crate::validate::validate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{info, info_span, warn};

type StatusSink = Box<dyn FnMut(StatusEvent) + Send>;
type CompletionSink = Box<dyn FnOnce(WriteOutcome) + Send>;

/// The set of device paths with a job in flight.
#[derive(Default)]
struct InFlight {
    devices: Mutex<HashSet<PathBuf>>,
}

impl InFlight {
    fn claim(this: &Arc<Self>, device: &Path) -> Result<InFlightGuard> {
        let mut devices = this.devices.lock().unwrap_or_else(|e| e.into_inner());
        if !devices.insert(device.to_path_buf()) {
            return Err(Error::AlreadyInProgress(device.display().to_string()));
        }
        Ok(InFlightGuard {
            owner: Arc::clone(this),
            device: device.to_path_buf(),
        })
    }
}

/// Releases the device's in-flight claim on drop.
struct InFlightGuard {
    owner: Arc<InFlight>,
    device: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.device);
    }
}

/// Entry point for front-ends: lists devices and starts, observes and cancels write jobs.
pub struct Orchestrator {
    probe: Arc<dyn Probe>,
    registry: Arc<DeviceRegistry>,
    in_flight: Arc<InFlight>,
}

impl Orchestrator {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new(Arc::clone(&probe))),
            probe,
            in_flight: Arc::default(),
        }
    }

    /// Builds an orchestrator around the probe for the running OS.
    pub fn native(config: &FlashConfig) -> Result<Self> {
        Ok(Self::new(platform::native(config)?))
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Re-enumerates removable devices and returns the fresh list. An empty list is not
    /// an error.
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.registry.refresh()?.to_vec())
    }

    /// Starts writing `image_path` onto `device_id` on a new worker thread.
    ///
    /// Returns as soon as the job is scheduled. The inputs are checked first: the image must
    /// be a readable file, and the device must be one of the listed removable devices with
    /// no other job running against it.
    ///
    /// `on_status` receives every [`StatusEvent`] in order. `on_complete` is called exactly
    /// once with the final [`WriteOutcome`]; failures are reported only through it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty device id, an unreadable image, or a device
    ///   that is not a listed removable device.
    /// - [`Error::AlreadyInProgress`] if a job already targets the device.
    /// - [`Error::Io`] if the worker thread cannot be spawned.
    pub fn start_write<S, C>(
        &self,
        image_path: impl AsRef<Path>,
        device_id: impl AsRef<Path>,
        on_status: S,
        on_complete: C,
    ) -> Result<JobHandle>
    where
        S: FnMut(StatusEvent) + Send + 'static,
        C: FnOnce(WriteOutcome) + Send + 'static,
    {
        let device_id = device_id.as_ref();
        if device_id.as_os_str().is_empty() {
            return Err(Error::InvalidInput("no device selected".to_string()));
        }

        let image = ImageSource::open(image_path)?;
        let device = self.lookup(device_id)?;
        let guard = InFlight::claim(&self.in_flight, &device.path)?;

        let cancel = CancelToken::new();
        let state = Arc::new(Mutex::new(JobState::Idle));

        let worker = Worker {
            probe: Arc::clone(&self.probe),
            image,
            device: device.clone(),
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            on_status: Box::new(on_status),
            on_complete: Box::new(on_complete),
            guard,
        };

        let handle = thread::Builder::new()
            .name("driveflash-job".to_string())
            .spawn(move || worker.run())?;

        Ok(JobHandle {
            device: device.path,
            cancel,
            state,
            worker: Some(handle),
        })
    }

    /// Like [`start_write`](Self::start_write), but delivers the job's events as a finite
    /// iterator instead of through callbacks.
    pub fn start_write_events(
        &self,
        image_path: impl AsRef<Path>,
        device_id: impl AsRef<Path>,
    ) -> Result<(JobHandle, JobEvents)> {
        let (tx, rx) = mpsc::channel();
        let status_tx = tx.clone();

        let handle = self.start_write(
            image_path,
            device_id,
            move |event| {
                let _ = status_tx.send(JobEvent::Status(event));
            },
            move |outcome| {
                let _ = tx.send(JobEvent::Finished(outcome));
            },
        )?;

        Ok((handle, JobEvents { rx, done: false }))
    }

    /// Finds `path` among the listed removable devices, refreshing the list once if needed.
    fn lookup(&self, path: &Path) -> Result<Device> {
        if let Some(device) = self.registry.find(path) {
            return Ok(device);
        }
        self.registry.refresh()?;
        self.registry.find(path).ok_or_else(|| {
            Error::InvalidInput(format!("{} is not a removable device", path.display()))
        })
    }
}

/// Everything a job owns while it runs on its worker thread.
struct Worker {
    probe: Arc<dyn Probe>,
    image: ImageSource,
    device: Device,
    cancel: CancelToken,
    state: Arc<Mutex<JobState>>,
    on_status: StatusSink,
    on_complete: CompletionSink,
    guard: InFlightGuard,
}

impl Worker {
    fn run(mut self) {
        let span = info_span!("job", device = %self.device.path.display());
        let _enter = span.enter();

        let outcome = match self.execute() {
            Ok(()) => {
                self.enter(JobState::Succeeded, "image written successfully");
                info!(image = %self.image.path.display(), "job succeeded");
                WriteOutcome::Success
            }
            Err(e) => {
                self.set_state(JobState::Failed);
                warn!(error = %e, "job failed");
                WriteOutcome::Failure(e)
            }
        };

        // Release the device before notifying so the sink may start a new job on it.
        let Worker {
            on_complete, guard, ..
        } = self;
        drop(guard);
        on_complete(outcome);
    }

    fn execute(&mut self) -> Result<()> {
        self.enter(JobState::Validating, "checking device capacity");
        self.check_cancelled()?;
        let device = self.with_live_capacity();
        validate(self.image.size, &device)?;
        self.check_cancelled()?;

        self.enter(JobState::Erasing, "clearing device");
        stage::erase(&*self.probe, &device, &self.cancel)?;

        self.enter(JobState::Writing, "writing image");
        let on_status = &mut self.on_status;
        let mut last_percent = None;
        let mut on_progress = |written: u64, total: u64| {
            let percent = (written as u128 * 100 / total.max(1) as u128) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                on_status(StatusEvent::progress(percent));
            }
        };
        stage::write(
            &*self.probe,
            &device,
            &self.image,
            &mut on_progress,
            &self.cancel,
        )
    }

    /// The device with its capacity re-read from the probe. Falls back to the size seen at
    /// enumeration when the query fails.
    fn with_live_capacity(&self) -> Device {
        match self.probe.query_capacity(&self.device.path) {
            Ok(capacity) => Device {
                capacity: Some(capacity),
                ..self.device.clone()
            },
            Err(e) => {
                warn!(error = %e, "using capacity from device listing");
                self.device.clone()
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn enter(&mut self, state: JobState, message: &str) {
        self.set_state(state);
        info!(state = ?state, "{}", message);
        (self.on_status)(StatusEvent::stage(state, message));
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}
