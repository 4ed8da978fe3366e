#![forbid(unsafe_code)]

mod capture;

use capture::CaptureSource;
use clap::Parser;
use pcapstats_core::config::Config;
use pcapstats_core::Pipeline;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// A passive network-traffic analyzer: IP fragment reassembly, TCP
/// session tracking, and aging flow/host tables under a memory budget.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Live capture interface.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    interface: Option<String>,

    /// Offline capture file.
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    read: Option<PathBuf>,

    /// Alternate configuration file.
    #[arg(short = 'c', long = "config-file", value_name = "FILE", default_value = "/etc/pcapstats.conf")]
    config_file: PathBuf,

    /// Parse the configuration file and exit.
    #[arg(short = 'T', long = "config-test")]
    config_test: bool,

    /// Run in the background.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,
}

const EXIT_SUCCESS: u8 = 0;
const EXIT_USAGE_OR_CONFIG: u8 = 1;
const EXIT_FATAL: u8 = 255;

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let config = match load_config(&cli.config_file) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::from(EXIT_USAGE_OR_CONFIG);
        }
    };

    if cli.config_test {
        info!("configuration OK");
        return ExitCode::from(EXIT_SUCCESS);
    }

    if cli.daemon {
        if let Err(err) = daemonize::Daemonize::new().start() {
            error!(%err, "failed to daemonize");
            return ExitCode::from(EXIT_FATAL);
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        if let Err(err) = flag::register(sig, shutdown.clone()) {
            error!(%err, "failed to register signal handler");
            return ExitCode::from(EXIT_FATAL);
        }
    }
    if let Err(err) = flag::register(SIGHUP, reload.clone()) {
        error!(%err, "failed to register signal handler");
        return ExitCode::from(EXIT_FATAL);
    }

    let source: Box<dyn CaptureSource> = match open_capture(&cli) {
        Ok(source) => source,
        Err(err) => {
            error!(%err, "failed to open capture source");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match run(source, config, &cli.config_file, &shutdown, &reload) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(err) => {
            error!(%err, "fatal runtime error");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn load_config(path: &PathBuf) -> Result<Config, pcapstats_core::Error> {
    match Config::from_file(path) {
        Ok(config) => Ok(config),
        Err(_) if !path.exists() => {
            warn!(path = %path.display(), "no configuration file, using defaults");
            Ok(Config::default())
        }
        Err(err) => Err(err),
    }
}

fn open_capture(cli: &Cli) -> Result<Box<dyn CaptureSource>, pcapstats_core::Error> {
    #[cfg(feature = "live-capture")]
    {
        if let Some(interface) = &cli.interface {
            return Ok(Box::new(capture::PcapCapture::open_live(interface)?));
        }
        if let Some(path) = &cli.read {
            let path = path.to_string_lossy().into_owned();
            return Ok(Box::new(capture::PcapOfflineCapture::open_file(&path)?));
        }
    }
    #[cfg(not(feature = "live-capture"))]
    {
        let _ = cli;
    }
    Err(pcapstats_core::Error::Fatal(
        "no capture source: pass -i/-r, and build with --features live-capture".to_string(),
    ))
}

fn run(
    mut source: Box<dyn CaptureSource>,
    mut config: Config,
    config_path: &PathBuf,
    shutdown: &AtomicBool,
    reload: &AtomicBool,
) -> Result<(), pcapstats_core::Error> {
    let mut pipeline = Pipeline::new(&config);
    info!("pcapstats started");

    while !shutdown.load(Ordering::Relaxed) {
        if reload.swap(false, Ordering::Relaxed) {
            match Config::from_file(config_path).and_then(|candidate| config.reload(candidate)) {
                Ok(()) => info!("configuration reloaded"),
                Err(err) => warn!(%err, "configuration reload rejected, keeping running config"),
            }
        }

        let Some(frame) = source.next_frame()? else {
            break;
        };
        if frame.is_empty() {
            continue;
        }

        let now = now_seconds();
        pipeline.handle(&frame, now);
    }

    let stats = pipeline.stats();
    info!(
        received = stats.received,
        malformed = stats.malformed,
        tcp_accepted = stats.tcp_accepted,
        tcp_rejected = stats.tcp_rejected,
        "pcapstats stopped"
    );

    pipeline.shutdown()?;
    Ok(())
}

fn now_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}
