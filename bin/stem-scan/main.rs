mod config;

use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use crossbeam_channel::bounded;
use env_logger::Env;
use log::{error, info, LevelFilter};
use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use stem_scan::digitizer::synthetic_specimen;
use stem_scan::{
    plan_scan, plot_row_profile, plot_trace, run_live, Acquisition, AcquisitionMode,
    DispatchSettings, JournalFormat, RunJournal, ScanError, ScanGrid, ScanProgram, ScanRecord,
    ScanRequest, ScanScheme, SimulatedAwg, SimulatedCamera, SimulatedDigitizer,
};

use crate::config::{load_config_or_default, AppConfig};

/// STEM beam scan planning and acquisition
#[derive(Parser, Debug)]
#[command(name = "stem-scan")]
#[command(about = "Plan and run STEM beam scans", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve timing and synthesize waveforms without touching hardware
    Plan(ScanArgs),
    /// Run a full scan against the simulated generator and digitizer
    Simulate {
        #[command(flatten)]
        scan: ScanArgs,
        /// Print the detector trace and the centre row profile
        #[arg(long)]
        plot: bool,
    },
    /// Stream one camera frame per position through a virtual annular detector
    Live {
        #[command(flatten)]
        scan: ScanArgs,
        /// Simulated camera frame edge length in pixels
        #[arg(long, default_value_t = 32)]
        frame_size: usize,
        #[arg(long)]
        plot: bool,
    },
}

#[derive(ClapArgs, Debug, Clone)]
struct ScanArgs {
    #[arg(long, default_value_t = 64)]
    width: usize,
    #[arg(long, default_value_t = 64)]
    height: usize,
    /// Beam positions per second
    #[arg(long, default_value_t = 1000.0)]
    frame_rate: f64,
    /// Detector-only scan with this dwell per pixel (us); overrides --frame-rate
    #[arg(long)]
    dwell_us: Option<f64>,
    #[arg(long, default_value_t = 1)]
    frames: u32,
    #[arg(long, value_enum)]
    scheme: Option<SchemeArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SchemeArg {
    Conventional,
    Serpentine,
}

impl From<SchemeArg> for ScanScheme {
    fn from(arg: SchemeArg) -> Self {
        match arg {
            SchemeArg::Conventional => ScanScheme::Conventional,
            SchemeArg::Serpentine => ScanScheme::Serpentine,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, args.config.as_ref());

    let shutdown_flag = setup_shutdown_handler()?;

    match args.command {
        Command::Plan(scan) => {
            let request = build_request(&scan, &mut config)?;
            let program = plan_scan(&request, &config.scan)?;
            log_program(&program);
            println!(
                "{}",
                serde_json::to_string_pretty(&ScanRecord::planned(&program))?
            );
            Ok(())
        }
        Command::Simulate { scan, plot } => {
            let request = build_request(&scan, &mut config)?;
            run_and_report(&config, &request, plot, shutdown_flag)
        }
        Command::Live {
            scan,
            frame_size,
            plot,
        } => run_live_preview(&mut config, &scan, frame_size, plot, &shutdown_flag),
    }
}

/// Apply command line overrides to the loaded configuration and build the request
fn build_request(scan: &ScanArgs, config: &mut AppConfig) -> Result<ScanRequest, ScanError> {
    if let Some(scheme) = scan.scheme {
        config.scan.scheme = scheme.into();
    }

    let request = match scan.dwell_us {
        Some(dwell_us) => {
            config.scan.mode = AcquisitionMode::TwoD;
            ScanRequest::from_dwell_time(scan.width, scan.height, dwell_us)?
        }
        None => ScanRequest::grid(scan.width, scan.height, scan.frame_rate),
    };
    Ok(request.with_frames(scan.frames))
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&PathBuf>) {
    info!("=== STEM Scan Control ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!(
        "Scheme: {:?} | Mode: {:?} | Range: [{}, {}]",
        config.scan.scheme,
        config.scan.mode,
        config.scan.scan_range.low,
        config.scan.scan_range.high
    );
}

fn log_program(program: &ScanProgram) {
    info!(
        "Grid: {} x {} ({:?}), {} frame(s)",
        program.grid.width, program.grid.height, program.grid.scheme, program.frames
    );
    info!(
        "Timing: {} samples x prescale {} -> {:.3} Hz (requested {:.3} Hz)",
        program.timing.sample_count,
        program.timing.prescale,
        program.timing.effective_rate,
        program.frame_rate
    );
    if let Some(row) = program.row_timing {
        info!(
            "Row axis: prescale {} with {} samples per position",
            row.row.prescale, row.samples_per_position
        );
    }
    info!(
        "Waveform memory: {:.2} MB",
        program.waveforms.memory_bytes() as f64 / 1e6
    );
}

/// Setup Ctrl+C handler for aborting before dispatch
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - scan will not be dispatched");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

fn open_journal(
    config: &AppConfig,
) -> Result<Option<RunJournal<ScanRecord>>, Box<dyn std::error::Error>> {
    if !config.experiment_logging.enabled {
        return Ok(None);
    }
    let dir = PathBuf::from(&config.experiment_logging.output_path);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("scan_{}", Utc::now().format("%Y%m%d_%H%M%S")));
    Ok(Some(RunJournal::new(path, 1, JournalFormat::Lines)))
}

/// Run a simulated scan and report results
fn run_and_report(
    config: &AppConfig,
    request: &ScanRequest,
    plot: bool,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let program = plan_scan(request, &config.scan)?;
    log_program(&program);

    let mut journal = open_journal(config)?;
    let record = ScanRecord::planned(&program);

    let (start_tx, start_rx) = bounded(1);
    let mut awg = SimulatedAwg::new().with_start_signal(start_tx);
    let specimen = synthetic_specimen(program.grid.width, program.grid.height);
    let mut digitizer =
        SimulatedDigitizer::new(specimen, program.timing.dwell_period(), program.grid.scheme)
            .with_trigger(start_rx, config.scan.settle_delay() + Duration::from_secs(10));

    let acquisition = Acquisition::with_abort_flag(shutdown_flag.clone());
    let settings = DispatchSettings::from_config(&config.scan);

    info!("Starting scan...");
    let result = acquisition.run(&program, &mut awg, &mut digitizer, &settings);

    let (record, outcome) = match result {
        Ok(outcome) => {
            info!(
                "✓ Scan completed: {} samples used, {} dead-time samples dropped",
                outcome.reassembly.samples_used, outcome.reassembly.dead_time_discards
            );
            (record.with_outcome(&outcome), Ok(outcome))
        }
        Err(e) => {
            if shutdown_flag.load(Ordering::SeqCst) {
                info!("✓ Scan aborted by user before dispatch");
            } else {
                error!("✗ Scan failed: {e}");
            }
            (record.with_error(&e), Err(e))
        }
    };

    if let Some(journal) = journal.as_mut() {
        journal.record(record)?;
        info!("Journal: {}", journal.path().display());
    }

    let outcome = outcome?;
    if plot {
        plot_trace(outcome.trace.samples(), "Detector trace", None, None)?;
        plot_row_profile(&outcome.image, outcome.image.height() / 2)?;
    }
    Ok(())
}

fn run_live_preview(
    config: &mut AppConfig,
    scan: &ScanArgs,
    frame_size: usize,
    plot: bool,
    shutdown_flag: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(scheme) = scan.scheme {
        config.scan.scheme = scheme.into();
    }
    let grid = ScanGrid::new(scan.width, scan.height, config.scan.scheme);
    let specimen = synthetic_specimen(grid.width, grid.height);
    let mut camera = SimulatedCamera::new(specimen, grid.scheme, frame_size, frame_size);

    let mut settings = config.live.clone();
    settings.frame_rate = scan.frame_rate;

    match run_live(&mut camera, &grid, &settings, shutdown_flag) {
        Ok((image, stats)) => {
            info!(
                "✓ Live stream finished: {} frames, {} dropped, peak queue depth {}",
                stats.consumed, stats.dropped, stats.peak_depth
            );
            if plot {
                plot_row_profile(&image, image.height() / 2)?;
            }
            Ok(())
        }
        Err(e) => {
            error!("✗ Live stream failed: {e}");
            Err(e.into())
        }
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
