//! Types describing a single write job and its observable lifecycle.
use crate::cancel::CancelToken;
use crate::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// States of a write job. `Succeeded` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Idle,
    Validating,
    Erasing,
    Writing,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// A human-readable progress report. Events of one job arrive in pipeline order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    /// The stage the job was in when the event was produced.
    pub stage: JobState,
    pub message: String,
    /// Percentage of the image written. Only set on progress ticks during `Writing`.
    pub percent: Option<u8>,
}

impl StatusEvent {
    pub(crate) fn stage(stage: JobState, message: &str) -> Self {
        Self {
            stage,
            message: message.to_string(),
            percent: None,
        }
    }

    pub(crate) fn progress(percent: u8) -> Self {
        Self {
            stage: JobState::Writing,
            message: "writing image".to_string(),
            percent: Some(percent),
        }
    }

    /// Whether this event marks entry into a new stage rather than a progress tick.
    pub fn is_transition(&self) -> bool {
        self.percent.is_none()
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent {
            Some(p) => write!(f, "{} ({}%)", self.message, p),
            None => f.write_str(&self.message),
        }
    }
}

/// The single terminal result of a job.
#[derive(Debug)]
pub enum WriteOutcome {
    Success,
    Failure(Error),
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Success)
    }

    /// A message suitable for showing to the user.
    pub fn message(&self) -> String {
        match self {
            WriteOutcome::Success => "Image written successfully.".to_string(),
            WriteOutcome::Failure(e) => format!("Failed to write image: {}", e),
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            WriteOutcome::Success => None,
            WriteOutcome::Failure(e) => Some(e),
        }
    }
}

/// A handle to an in-flight job, returned by
/// [`Orchestrator::start_write`](crate::orchestrator::Orchestrator::start_write).
pub struct JobHandle {
    pub(crate) device: PathBuf,
    pub(crate) cancel: CancelToken,
    pub(crate) state: Arc<Mutex<JobState>>,
    pub(crate) worker: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Requests cancellation. Best effort: the worker notices it before erasing or at the
    /// next buffer boundary while writing. Does nothing once the job has finished.
    pub fn cancel(&self) {
        if !self.state().is_terminal() {
            self.cancel.cancel();
        }
    }

    /// A token that cancels this job, for handing to another thread (e.g. a signal handler).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Blocks until the worker thread has exited, i.e. after the completion sink has run.
    pub fn join(mut self) -> JobState {
        if let Some(worker) = self.worker.take() {
            // A panic inside a caller-supplied sink is not propagated.
            let _ = worker.join();
        }
        self.state()
    }
}

/// An item of the event-stream form of a job.
#[derive(Debug)]
pub enum JobEvent {
    Status(StatusEvent),
    Finished(WriteOutcome),
}

/// A finite stream of a job's events: zero or more `Status` items followed by exactly one
/// `Finished`, after which iteration ends.
pub struct JobEvents {
    pub(crate) rx: Receiver<JobEvent>,
    pub(crate) done: bool,
}

impl Iterator for JobEvents {
    type Item = JobEvent;

    fn next(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().ok()?;
        if matches!(event, JobEvent::Finished(_)) {
            self.done = true;
        }
        Some(event)
    }
}
