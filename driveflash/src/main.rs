use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use driveflash_core::config::MAX_ERASE_LEN;
use driveflash_core::{
    CancelToken, Device, Error, FlashConfig, JobEvent, JobState, Orchestrator, WriteOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod term;

const MIB: usize = 1024 * 1024;
const MAX_ERASE_MIB: i64 = (MAX_ERASE_LEN / MIB as u64) as i64;

#[derive(Parser)]
#[command(name = "driveflash")]
#[command(about = "Write a disk image onto a removable USB or SD device", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a removable device, erasing it
    Write {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        /// Target device (e.g. /dev/sdb); prompts for one when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Transfer buffer size in MiB
        #[arg(long, value_name = "MIB", default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=4))]
        buffer_size: u8,

        /// Size of the leading region cleared before writing, in MiB
        #[arg(long, value_name = "MIB", default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..=MAX_ERASE_MIB))]
        erase_size: u16,
    },
    /// List available removable devices
    List,
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// What a Ctrl+C press did.
#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// The running job was asked to stop.
    Cancelled,
    /// A job is being started; it is cancelled as soon as it is registered.
    Deferred,
    /// Nothing is running, so the process should exit.
    Exit,
}

#[derive(Default)]
struct JobSlot {
    starting: bool,
    cancel_requested: bool,
    token: Option<CancelToken>,
}

/// The job Ctrl+C should cancel, shared between `write` and the signal handler.
#[derive(Default)]
struct ActiveJob {
    slot: Mutex<JobSlot>,
}

impl ActiveJob {
    fn lock(&self) -> std::sync::MutexGuard<'_, JobSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks a job as about to start, so an interrupt no longer exits the process.
    fn begin(&self) {
        *self.lock() = JobSlot {
            starting: true,
            ..JobSlot::default()
        };
    }

    /// Registers the started job, cancelling it at once if Ctrl+C arrived meanwhile.
    fn attach(&self, token: CancelToken) {
        let mut slot = self.lock();
        if slot.cancel_requested {
            token.cancel();
        }
        slot.starting = false;
        slot.token = Some(token);
    }

    fn clear(&self) {
        *self.lock() = JobSlot::default();
    }

    fn interrupt(&self) -> Interrupt {
        let mut slot = self.lock();
        match &slot.token {
            Some(token) => {
                token.cancel();
                Interrupt::Cancelled
            }
            None if slot.starting => {
                slot.cancel_requested = true;
                Interrupt::Deferred
            }
            None => Interrupt::Exit,
        }
    }
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{}/black}}] {{pos:>3}}% {{msg}}",
        color
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn list(orchestrator: &Orchestrator) -> Result<()> {
    let devices = orchestrator.list_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<22} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<22} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let size = device
            .capacity_gb()
            .map_or_else(|| "unknown".to_string(), |gb| format!("{:.1} GB", gb));
        let location = device
            .mount_point
            .unwrap_or_else(|| "(Not mounted)".to_string());
        println!(
            "  {:<22} {:<25} {:>10}  {}",
            device.path.display(),
            device.label,
            size,
            location
        );
    }
    Ok(())
}

fn write(
    orchestrator: &Orchestrator,
    active_job: &ActiveJob,
    image: PathBuf,
    device: Option<PathBuf>,
    yes: bool,
) -> Result<()> {
    let devices = orchestrator.list_devices()?;
    let device = match device {
        Some(path) => devices
            .iter()
            .find(|d| d.path == path)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not a removable device.", path.display()))?,
        None => select_device(&devices, "Select the target device to WRITE to")?,
    };
    debug!(device = %device.path.display(), capacity = ?device.capacity, "target device selected");

    let size = device
        .capacity_gb()
        .map_or_else(|| "unknown size".to_string(), |gb| format!("{:.1} GB", gb));
    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        device.label,
        size,
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    if let Some(mp) = &device.mount_point {
        println!("  {} the device is mounted at {}", style("Note:").yellow(), mp);
    }
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }

    println!();

    active_job.begin();
    let (handle, events) = match orchestrator.start_write_events(&image, &device.path) {
        Ok(started) => started,
        Err(e) => {
            active_job.clear();
            return Err(e)
                .with_context(|| format!("could not start writing to {}", device.path.display()));
        }
    };
    active_job.attach(handle.cancel_token());
    debug!(image = %image.display(), device = %device.path.display(), "write job started");

    let clear_pb = ProgressBar::new_spinner();
    clear_pb.set_prefix("Clearing");
    let write_pb = ProgressBar::new(100);
    write_pb.set_prefix("Writing");
    write_pb.set_style(bar_style("green")?);

    let mut outcome = None;
    for event in events {
        match event {
            JobEvent::Status(status) => match (status.stage, status.percent) {
                (JobState::Erasing, _) => {
                    clear_pb.set_message(status.message);
                    clear_pb.enable_steady_tick(Duration::from_millis(100));
                }
                (JobState::Writing, None) => {
                    clear_pb.finish_with_message("Partition table cleared.");
                }
                (JobState::Writing, Some(percent)) => {
                    write_pb.set_position(percent as u64);
                }
                (JobState::Succeeded, _) => write_pb.finish_with_message("Write complete."),
                _ => {}
            },
            JobEvent::Finished(result) => outcome = Some(result),
        }
    }

    let state = handle.join();
    active_job.clear();
    info!(state = ?state, "write job finished");

    match outcome {
        Some(WriteOutcome::Success) => {
            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(device.path.display()).cyan(),
                style(image.display()).cyan()
            );
            Ok(())
        }
        Some(WriteOutcome::Failure(e)) => {
            clear_pb.finish_and_clear();
            write_pb.abandon_with_message("❌ Operation failed.");
            if matches!(e, Error::Cancelled) {
                eprintln!(
                    "{} {} may be partially written and will not boot.",
                    style("Note:").yellow(),
                    device.path.display()
                );
            }
            Err(e.into())
        }
        None => Err(anyhow!("the write job ended without reporting an outcome")),
    }
}

fn main() -> Result<()> {
    init_logging();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _echo_guard = term::EchoGuard::new();

    let cli = Cli::parse();

    // Ctrl+C cancels the running job; with no job running it restores the terminal and exits.
    let active_job = Arc::new(ActiveJob::default());
    let handler_job = Arc::clone(&active_job);
    ctrlc::set_handler(move || {
        let action = handler_job.interrupt();
        debug!(?action, "interrupt received");
        if action == Interrupt::Exit {
            term::restore();
            std::process::exit(130);
        }
    })?;

    match cli.command {
        Commands::Write {
            image,
            device,
            yes,
            buffer_size,
            erase_size,
        } => {
            let config = FlashConfig::default()
                .with_buffer_size(buffer_size as usize * MIB)?
                .with_erase_len(erase_size as u64 * MIB as u64)?;
            let orchestrator = Orchestrator::native(&config)?;
            write(&orchestrator, &active_job, image, device, yes)?;
        }
        Commands::List => {
            let orchestrator = Orchestrator::native(&FlashConfig::default())?;
            list(&orchestrator)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_with_no_job_exits() {
        let active = ActiveJob::default();
        assert_eq!(active.interrupt(), Interrupt::Exit);
    }

    #[test]
    fn test_interrupt_cancels_running_job() {
        let active = ActiveJob::default();
        let token = CancelToken::new();
        active.begin();
        active.attach(token.clone());

        assert_eq!(active.interrupt(), Interrupt::Cancelled);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_interrupt_while_starting_cancels_once_registered() {
        let active = ActiveJob::default();
        active.begin();
        assert_eq!(active.interrupt(), Interrupt::Deferred);

        let token = CancelToken::new();
        active.attach(token.clone());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cleared_slot_exits_again() {
        let active = ActiveJob::default();
        active.begin();
        active.attach(CancelToken::new());
        active.clear();
        assert_eq!(active.interrupt(), Interrupt::Exit);
    }

    #[test]
    fn test_erase_size_is_bounded() {
        assert!(Cli::try_parse_from(["driveflash", "write", "img", "--erase-size", "64"]).is_ok());
        assert!(Cli::try_parse_from(["driveflash", "write", "img", "--erase-size", "65"]).is_err());
        assert!(
            Cli::try_parse_from(["driveflash", "write", "img", "--erase-size", "65535"]).is_err()
        );
    }
}
