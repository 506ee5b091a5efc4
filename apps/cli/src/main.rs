use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use prime_core::{CancelToken, Progress, UpdateConfig, UpdateError, Updater};
use tracing::{error, info};

/// Progress bar resolution; percentages map onto this many steps.
const BAR_STEPS: u64 = 1000;

#[derive(Parser, Debug)]
#[command(
    name = "primeflash",
    author,
    version,
    about = "Firmware update tool for Denon Prime hardware",
    long_about = "Flashes vendor firmware images onto Denon Prime 4 family devices \
                  halted in their fastboot bootloader."
)]
struct Args {
    /// Path to the updater configuration
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Parse and verify the image but transmit nothing over USB
    #[arg(long)]
    dry_run: bool,

    /// Leave the device in the bootloader after flashing (overrides config)
    #[arg(long)]
    skip_reboot: bool,

    /// Application log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    debug: String,

    /// libusb debug level
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    libusb_debug: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(&args.debug);

    match run(args) {
        Ok(()) => {}
        Err(e) => {
            if e.downcast_ref::<UpdateError>()
                .is_some_and(|e| matches!(e, UpdateError::Cancelled))
            {
                eprintln!("✗ Cancelled");
                std::process::exit(130);
            }
            error!("update failed: {e:#}");
            eprintln!("✗ FAILED: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging(level: &str) {
    let default = match level {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::WARN,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn run(args: Args) -> Result<()> {
    let mut config = UpdateConfig::load_from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.skip_reboot {
        config.skip_reboot_after_flash = true;
    }
    config.libusb_debug_level = args.libusb_debug;

    let mut updater = Updater::new(config).context("unusable configuration")?;
    updater.dry_run = args.dry_run;

    let root = CancelToken::new();
    let cancel = root.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupt received, cancelling...");
        cancel.cancel();
    })
    .context("installing signal handler")?;

    info!(
        device = %updater.config().devices[0].name,
        image = %updater.config().devices[0].image_path.display(),
        dry_run = updater.dry_run,
        "starting update"
    );

    let (tx, rx) = crossbeam_channel::bounded::<Progress>(1);
    let reporter = thread::spawn(move || {
        let bar = ProgressBar::new(BAR_STEPS);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:40}] {percent:>3}% {wide_msg}")
                .expect("static template")
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        for progress in rx.iter() {
            let message = progress.text.replace('\n', " ");
            if !progress.indeterminate {
                bar.set_position((progress.percentage.clamp(0.0, 1.0) * BAR_STEPS as f64) as u64);
            }
            bar.set_message(message);
        }
        bar.finish_and_clear();
    });

    let result = updater.run(&root, tx);
    let _ = reporter.join();

    match result {
        Ok(()) => {
            eprintln!("✓ Update complete");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
