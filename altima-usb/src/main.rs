use altima_usb_core::catalog::{ChecksumRef, ImageDescriptor};
use altima_usb_core::config::Config;
use altima_usb_core::device::RemovableDevice;
use altima_usb_core::error::JobError;
use altima_usb_core::job::{
    ChecksumPolicy, ChecksumStatus, EjectStatus, JobEvent, JobEventKind, JobId, JobOptions, JobState, Phase,
    ProvisioningJob,
};
use altima_usb_core::orchestrator::Orchestrator;
use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const CONFIG_ENV: &str = "ALTIMA_USB_CONFIG";

#[derive(Parser)]
#[command(name = "altima-usb")]
#[command(about = "Prepare bootable Altima Linux USB media", version)]
struct Cli {
    /// JSON configuration file (defaults to $ALTIMA_USB_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List removable devices that can be provisioned
    List,
    /// List the images available for download
    Images,
    /// Install the loader on a device and copy an image onto it
    Provision {
        /// Device identifier as shown by `list` (prompted for if omitted)
        #[arg(short, long)]
        device: Option<String>,

        /// Image file name as shown by `images` (prompted for if omitted)
        #[arg(short, long)]
        image: Option<String>,

        /// Continue when a published checksum cannot be retrieved
        #[arg(long)]
        allow_unverified: bool,

        /// Leave the device attached when done
        #[arg(long)]
        no_eject: bool,

        /// Use a local loader archive instead of downloading one
        #[arg(long, value_name = "PATH")]
        loader_archive: Option<PathBuf>,

        /// Do not ask for confirmation before erasing the device
        #[arg(short, long)]
        yes: bool,
    },
}

/// On Unix, stops the terminal from echoing `^C` while a job is cancelled.
/// The original settings come back when this is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            Self {
                original: Self::disable_echoctl(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    #[cfg(unix)]
    fn disable_echoctl() -> Option<Termios> {
        if !stdout().is_terminal() {
            return None;
        }
        let fd = stdout().as_raw_fd();
        let original = Termios::from_fd(fd).ok()?;
        let mut quiet = original;
        quiet.c_lflag &= !ECHOCTL;
        tcsetattr(fd, TCSANOW, &quiet).ok()?;
        Some(original)
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original) = &self.original {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    match path {
        Some(path) => {
            debug!("loading config from {}", path.display());
            Config::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

/// Renders job events: one line per phase, and a byte bar for phases that
/// report progress.
struct PhaseDisplay {
    bar: Mutex<Option<(Phase, ProgressBar)>>,
}

impl PhaseDisplay {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn handle(&self, event: &JobEvent) {
        let mut current = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        match &event.kind {
            JobEventKind::State(state) => {
                if let Some((_, bar)) = current.take() {
                    bar.finish();
                }
                if let JobState::Running(phase) = state {
                    if *phase != Phase::Idle {
                        println!("{} {}", style("==>").blue().bold(), capitalize(&phase.to_string()));
                    }
                }
            }
            JobEventKind::Progress { phase, done, total } => {
                if current.as_ref().map(|(p, _)| p) != Some(phase) {
                    *current = Some((*phase, Self::new_bar(*phase, *total)));
                }
                if let Some((_, bar)) = current.as_ref() {
                    bar.set_position(*done);
                }
            }
        }
    }

    fn new_bar(phase: Phase, total: Option<u64>) -> ProgressBar {
        let color = match phase {
            Phase::Verifying => "magenta",
            Phase::Writing => "green",
            _ => "cyan",
        };
        let bar = match total {
            Some(len) => ProgressBar::new(len).with_style(bar_style(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
            ))),
            None => {
                let spinner = ProgressBar::new_spinner().with_style(
                    ProgressStyle::with_template(
                        "{prefix:12} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                spinner.enable_steady_tick(Duration::from_millis(100));
                spinner
            }
        };
        let prefix = match phase {
            Phase::InstallingLoader => "Loader",
            Phase::Downloading => "Download",
            Phase::Verifying => "Verify",
            Phase::Writing => "Write",
            _ => "Progress",
        };
        bar.set_prefix(prefix);
        bar
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[RemovableDevice], wanted: Option<&str>) -> Result<RemovableDevice> {
    if let Some(id) = wanted {
        return devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("{id} is not a removable device that can be provisioned"));
    }
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the USB device to provision")
        .items(&items)
        .default(0)
        .interact()?;
    Ok(devices[selection].clone())
}

fn select_image(images: &[ImageDescriptor], wanted: Option<&str>) -> Result<ImageDescriptor> {
    if let Some(file) = wanted {
        return images
            .iter()
            .find(|i| i.id() == file)
            .cloned()
            .ok_or_else(|| anyhow!("{file} is not in the image catalog"));
    }
    let items: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the image to install")
        .items(&items)
        .default(0)
        .interact()?;
    Ok(images[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmation)
}

fn print_devices(devices: &[RemovableDevice]) {
    if devices.is_empty() {
        println!("No removable devices found.");
        return;
    }
    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<15} {:<30} {:<10} {}", "DEVICE", "NAME", "SIZE", "BUS");
    println!("  {:-<15} {:-<30} {:-<10} {:-<10}", "", "", "", "");
    for device in devices {
        println!(
            "  {:<15} {:<30} {:>7.1} GB  {}",
            device.id,
            device.label,
            device.size_gb(),
            device.bus
        );
    }
}

fn print_images(images: &[ImageDescriptor]) {
    println!("\n  {:<35} {:<30} {}", "NAME", "FILE", "CHECKSUM");
    println!("  {:-<35} {:-<30} {:-<10}", "", "", "");
    for image in images {
        let checksum = match &image.checksum {
            Some(ChecksumRef::Inline(_)) => "published",
            Some(ChecksumRef::Detached(_)) => "detached",
            None => "none",
        };
        println!("  {:<35} {:<30} {}", image.name, image.file, checksum);
    }
}

fn report(job: &ProvisioningJob) -> Result<()> {
    match &job.state {
        JobState::Complete => {
            match job.checksum {
                ChecksumStatus::Verified => println!("  Checksum verified."),
                ChecksumStatus::NotClaimed => println!("  No checksum is published for this image."),
                ChecksumStatus::Unavailable | ChecksumStatus::Pending => println!(
                    "{} The published checksum could not be retrieved; the image was NOT verified.",
                    style("WARNING:").yellow().bold()
                ),
            }
            println!(
                "\n✨ {} is ready on {}.",
                style(&job.image.name).cyan(),
                style(&job.device.id).cyan()
            );
            match &job.eject {
                EjectStatus::Ejected => println!("  The device has been ejected and can be removed."),
                EjectStatus::Skipped | EjectStatus::Pending => {
                    println!("  Eject the device before removing it.")
                }
                EjectStatus::Failed(msg) => println!(
                    "{} Could not eject the device ({msg}). Eject it manually before removing it.",
                    style("WARNING:").yellow().bold()
                ),
            }
            Ok(())
        }
        JobState::Failed { phase, error } => {
            if job.needs_rescan {
                println!(
                    "{} {} may be left in an inconsistent state. Rescan and confirm the device before trying again.",
                    style("WARNING:").red().bold(),
                    job.device.id
                );
            }
            if matches!(**error, JobError::ChecksumUnavailable { .. }) {
                println!("  Re-run with --allow-unverified to write the image without verification.");
            }
            Err(anyhow!("{} failed while {phase}: {error}", job.id))
        }
        JobState::Running(phase) => Err(anyhow!("{} stopped while {phase}", job.id)),
    }
}

fn provision(
    config: Config,
    device: Option<String>,
    image: Option<String>,
    options: JobOptions,
    yes: bool,
) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::native(config)?);
    let active: Arc<Mutex<Option<JobId>>> = Arc::new(Mutex::new(None));
    let interrupted = Arc::new(AtomicBool::new(false));

    {
        let orchestrator = Arc::clone(&orchestrator);
        let active = Arc::clone(&active);
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            let job = *active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = job {
                if orchestrator.cancel(id) {
                    warn!("cancel requested for {id}");
                    eprintln!("\nCancelling; waiting for the current step to stop...");
                }
            }
        })?;
    }

    let devices = orchestrator.rescan_devices()?;
    let mut target = select_device(&devices, device.as_deref())?;
    let images = orchestrator.images()?;
    let chosen = select_image(&images, image.as_deref())?;

    let display = Arc::new(PhaseDisplay::new());
    let sink = Arc::clone(&display);
    orchestrator.set_observer(Arc::new(move |event: &JobEvent| sink.handle(event)));

    let id = loop {
        println!(
            "{} This will erase all data on '{}' ({:.1} GB).",
            style("WARNING:").red().bold(),
            target.label,
            target.size_gb(),
        );
        println!("  Device: {}", style(&target.id).cyan());
        println!("  Image:  {}", style(&chosen.name).cyan());
        println!();

        if !yes && !confirm_operation("Are you sure you want to proceed?")? {
            println!("Provisioning cancelled.");
            return Ok(());
        }
        if interrupted.load(Ordering::SeqCst) {
            return Err(anyhow!("Interrupted."));
        }

        match orchestrator.start_provisioning_with(&target.id, chosen.id(), options) {
            Ok(id) => break id,
            Err(JobError::SelectionExpired(_)) if !yes => {
                info!("selection of {} expired, rescanning", target.id);
                println!("The device list is out of date; scanning again.");
                let devices = orchestrator.rescan_devices()?;
                target = select_device(&devices, Some(target.id.as_str()))?;
            }
            Err(e) => return Err(e.into()),
        }
    };
    *active.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    info!("{id}: provisioning {} with {}", target.id, chosen.file);
    println!();

    let job = orchestrator
        .wait(id)
        .ok_or_else(|| anyhow!("{id} disappeared"))?;
    report(&job)
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::List => {
            let orchestrator = Orchestrator::native(config)?;
            print_devices(&orchestrator.rescan_devices()?);
        }
        Commands::Images => {
            let orchestrator = Orchestrator::native(config)?;
            print_images(&orchestrator.images()?);
        }
        Commands::Provision {
            device,
            image,
            allow_unverified,
            no_eject,
            loader_archive,
            yes,
        } => {
            if let Some(path) = loader_archive {
                config.loader_archive = Some(path);
            }
            let options = JobOptions {
                checksum_policy: if allow_unverified {
                    ChecksumPolicy::AllowUnavailable
                } else {
                    ChecksumPolicy::Require
                },
                eject: !no_eject,
            };
            provision(config, device, image, options, yes)?;
        }
    }

    Ok(())
}
