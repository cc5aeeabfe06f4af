//! The core, UI-agnostic library for the `driveflash` disk imaging utility.
//!
//! `driveflash-core` writes a disk image onto a removable device, destroying whatever was on
//! it. Any front-end can drive it, whether a command-line interface (like `driveflash`) or
//! a graphical one. It handles device discovery, capacity checks, the destructive low-level
//! write, and running that write off the caller's thread.
//!
//! The library is structured into several key modules:
//! - [`platform`]: the [`Probe`] trait and one adapter per OS family, for discovering
//!   removable devices, querying their size, and raw erase/write.
//! - [`registry`]: the current snapshot of removable devices.
//! - [`mod@validate`]: the pre-flight capacity check.
//! - [`stage`]: the erase and write stages of a job.
//! - [`orchestrator`]: runs jobs on worker threads and reports status and completion.
//!
//! The primary entry point is [`Orchestrator`]. A job is started with
//! [`Orchestrator::start_write`] and reports back through two callbacks: one for ordered
//! status events and one that fires exactly once with the outcome. The returned
//! [`JobHandle`] can cancel the job.
//!
//! Cancelling a job that has started writing leaves the device partially written and not
//! bootable. Nothing is rolled back.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use driveflash_core::{FlashConfig, Orchestrator};
//! use std::sync::mpsc;
//!
//! fn main() -> driveflash_core::Result<()> {
//!     let orchestrator = Orchestrator::native(&FlashConfig::default())?;
//!     let devices = orchestrator.list_devices()?;
//!     let device = devices.first().expect("No removable devices found.");
//!
//!     let (done_tx, done_rx) = mpsc::channel();
//!     let job = orchestrator.start_write(
//!         "path/to/image.iso",
//!         &device.path,
//!         |status| println!("{}", status),
//!         move |outcome| {
//!             let _ = done_tx.send(outcome);
//!         },
//!     )?;
//!
//!     // `job.cancel()` may be called from any thread, e.g. a Ctrl+C handler.
//!     let outcome = done_rx.recv().expect("job always completes");
//!     println!("{}", outcome.message());
//!     job.join();
//!
//!     Ok(())
//! }
//! ```

mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod job;
pub mod orchestrator;
pub mod platform;
pub mod registry;
pub mod stage;
mod transfer;
pub mod validate;

pub use cancel::CancelToken;
pub use config::FlashConfig;
pub use device::Device;
pub use error::{Error, Result, ValidationError};
pub use image::ImageSource;
pub use job::{JobEvent, JobEvents, JobHandle, JobState, StatusEvent, WriteOutcome};
pub use orchestrator::Orchestrator;
pub use platform::Probe;
pub use registry::DeviceRegistry;
pub use validate::validate;
