use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use log::{debug, LevelFilter};
use miette::{IntoDiagnostic, Result};
use qdl::{
    config::Config,
    discovery::{DeviceLocator, EDL_PID, EDL_VID},
    flasher::Flasher,
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[clap(about, version, propagate_version = true)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Serial port of a device already in emergency download mode,
    /// bypassing discovery
    #[arg(long)]
    port: Option<String>,

    /// Baud rate to open the serial port at
    #[arg(short = 'b', long)]
    baud: Option<u32>,

    /// Treat an execution-phase failure as a process failure
    #[arg(long)]
    strict: bool,

    /// Directory to resolve program data files against, instead of the
    /// directory of the artifact that names them
    #[arg(long, value_name = "DIR")]
    include: Option<PathBuf>,

    /// Boot image uploaded during the bootstrap phase
    /// (e.g. prog_firehose.mbn)
    boot_image: PathBuf,

    /// rawprogram/patch XML artifacts, applied in command-line order
    #[arg(required = true)]
    artifacts: Vec<PathBuf>,
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    let cli = Cli::parse();
    initialize_logger(if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    debug!("{cli:#?}");

    let config = Config::load()?;

    // Everything file-shaped is classified and loaded up front, before the
    // operator has even put the device into download mode.
    let mut flasher = Flasher::new(cli.boot_image, cli.strict || config.strict);
    if let Some(baud) = cli.baud.or(config.baud) {
        flasher = flasher.with_baud(baud);
    }
    flasher.load_artifacts(&cli.artifacts)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)).into_diagnostic()?;
    }

    let (vid, pid) = config
        .usb_device
        .as_ref()
        .map_or((EDL_VID, EDL_PID), |usb| (usb.vid, usb.pid));
    let locator = DeviceLocator::new(vid, pid).with_cancel(cancel);

    flasher.run(&locator, cli.port.as_deref(), cli.include)?;

    Ok(())
}
