use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ScanConfiguration;
use crate::digitizer::{minimum_record_size, record_size, Digitizer, SampleStream};
use crate::error::ScanError;
use crate::hardware::{dispatch, AwgDevice, DispatchReport, DispatchSettings};
use crate::pattern::{generate, generate_region, ScanAxisPlan};
use crate::reassembly::{reassemble, ReassemblyReport, ReconstructedImage};
use crate::timing::{self, SecondaryTiming, TimingParameters};
use crate::types::{parse_numeric_field, AcquisitionMode, ScanGrid, ScanRegion, ScanScheme};
use crate::waveform::{synthesize, WaveformSet};

/// What part of the deflection field to scan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScanArea {
    /// Full configured range at the given resolution
    Grid { width: usize, height: usize },
    /// Square-pixel region; the row count follows from its aspect ratio
    Region { region: ScanRegion, width: usize },
}

/// User intent for one scan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub area: ScanArea,
    /// Beam positions per second (camera frame rate in 4D mode)
    pub frame_rate: f64,
    pub frames: u32,
}

impl ScanRequest {
    pub fn grid(width: usize, height: usize, frame_rate: f64) -> Self {
        Self {
            area: ScanArea::Grid { width, height },
            frame_rate,
            frames: 1,
        }
    }

    pub fn region(region: ScanRegion, width: usize, frame_rate: f64) -> Self {
        Self {
            area: ScanArea::Region { region, width },
            frame_rate,
            frames: 1,
        }
    }

    pub fn with_frames(mut self, frames: u32) -> Self {
        self.frames = frames;
        self
    }

    /// Detector-only scans are specified by dwell time per pixel in microseconds
    pub fn from_dwell_time(width: usize, height: usize, dwell_us: f64) -> Result<Self, ScanError> {
        if !(dwell_us.is_finite() && dwell_us > 0.0) {
            return Err(ScanError::InvalidInput(format!(
                "Dwell time must be positive, got {dwell_us} us"
            )));
        }
        let frame_rate = (1e6 / dwell_us).floor();
        if frame_rate < 1.0 {
            return Err(ScanError::InvalidInput(format!(
                "Dwell time of {dwell_us} us is longer than one second"
            )));
        }
        Ok(Self::grid(width, height, frame_rate))
    }

    /// Build a grid request from raw text fields
    pub fn from_fields(width: &str, height: &str, frame_rate: &str) -> Result<Self, ScanError> {
        let request = Self::grid(
            parse_numeric_field("Width", width)?,
            parse_numeric_field("Height", height)?,
            parse_numeric_field("Frame rate", frame_rate)?,
        );
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(ScanError::InvalidInput(format!(
                "Frame rate must be positive, got {}",
                self.frame_rate
            )));
        }
        if self.frames == 0 {
            return Err(ScanError::InvalidInput(
                "At least one frame must be requested".to_string(),
            ));
        }
        let (width, height) = match self.area {
            ScanArea::Grid { width, height } => (width, height),
            ScanArea::Region { width, .. } => (width, 2),
        };
        if width < 2 || height < 2 {
            return Err(ScanError::InvalidInput(format!(
                "Scan must be at least 2 x 2 positions, got {width} x {height}"
            )));
        }
        Ok(())
    }
}

/// Everything derived from a request before touching hardware
#[derive(Debug, Clone)]
pub struct ScanProgram {
    pub grid: ScanGrid,
    pub mode: AcquisitionMode,
    pub frame_rate: f64,
    pub frames: u32,
    pub x_plan: ScanAxisPlan,
    pub y_plan: ScanAxisPlan,
    pub timing: TimingParameters,
    /// Row-axis timing; `None` when the trigger delay cannot be synchronized with any row prescale
    pub row_timing: Option<SecondaryTiming>,
    pub trigger_delay: u16,
    pub waveforms: WaveformSet,
    pub sample_rate: u32,
    pub record_size: usize,
}

/// Turn a scan request into a hardware program
///
/// Fails before any hardware access if the request is invalid, no legal timing exists or the
/// waveforms would exceed the memory ceiling.
pub fn plan_scan(
    request: &ScanRequest,
    config: &ScanConfiguration,
) -> Result<ScanProgram, ScanError> {
    config.validate()?;
    request.validate()?;

    let (grid, x_plan, y_plan) = match request.area {
        ScanArea::Grid { width, height } => {
            let grid = ScanGrid::new(width, height, config.scheme);
            let (x, y) = generate(&grid, &config.scan_range, config.guard_voltage)?;
            (grid, x, y)
        }
        ScanArea::Region { region, width } => {
            generate_region(&region, width, config.scheme, config.guard_voltage)?
        }
    };

    let limits = &config.timing;
    let timing = timing::solve(request.frame_rate, limits)?;
    let trigger_delay = config
        .trigger_delay
        .resolve(&timing, request.frame_rate, limits);
    info!(
        "Trigger delay by {} ns from beam position movement",
        trigger_delay as u32 * limits.delay_resolution_ns
    );

    let row_timing =
        match timing::solve_secondary(request.frame_rate, x_plan.len(), trigger_delay, limits) {
            Ok(row) => Some(row),
            Err(ScanError::ConfigurationInfeasible(reason)) => {
                warn!("Row axis timing unavailable: {reason}");
                None
            }
            Err(err) => return Err(err),
        };

    let waveforms = synthesize(
        &x_plan,
        &y_plan,
        &timing,
        trigger_delay,
        request.frames,
        config.memory_ceiling_bytes(),
    )?;

    let digitizer = &config.digitizer;
    let sample_rate = digitizer
        .rate_ladder
        .select(request.frame_rate * digitizer.oversampling as f64);
    let record_size = record_size(
        grid.pixel_count(),
        request.frame_rate,
        sample_rate,
        digitizer.record_margin(config.mode),
    )
    .max(minimum_record_size(
        grid.pixel_count(),
        timing.dwell_period(),
        sample_rate,
    ));
    info!(
        "Digitizer will sample at {} Sa/s, {} samples in total",
        sample_rate, record_size
    );

    Ok(ScanProgram {
        grid,
        mode: config.mode,
        frame_rate: request.frame_rate,
        frames: request.frames,
        x_plan,
        y_plan,
        timing,
        row_timing,
        trigger_delay,
        waveforms,
        sample_rate,
        record_size,
    })
}

/// Result of a completed scan
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub image: ReconstructedImage,
    /// Raw detector trace the image was built from
    pub trace: SampleStream,
    pub reassembly: ReassemblyReport,
    pub dispatch: DispatchReport,
}

/// Runs scan programs against a generator and a digitizer
///
/// The abort flag is honoured only until dispatch begins; a started scan runs to completion.
#[derive(Debug, Clone, Default)]
pub struct Acquisition {
    abort: Arc<AtomicBool>,
}

impl Acquisition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abort_flag(abort: Arc<AtomicBool>) -> Self {
        Self { abort }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Dispatch the program and fetch detector samples concurrently, then reassemble
    ///
    /// The fetch thread is spawned first because it blocks on the trigger that dispatch
    /// raises. Both threads are joined before reassembly starts.
    pub fn run<A, G>(
        &self,
        program: &ScanProgram,
        awg: &mut A,
        digitizer: &mut G,
        settings: &DispatchSettings,
    ) -> Result<ScanOutcome, ScanError>
    where
        A: AwgDevice + ?Sized,
        G: Digitizer + ?Sized,
    {
        if self.abort.load(Ordering::SeqCst) {
            warn!("Abort requested, scan not dispatched");
            return Err(ScanError::Aborted);
        }

        // Raised when dispatch fails, so the fetch stops waiting for a trigger that never comes
        let cancel_fetch = AtomicBool::new(false);

        let (fetched, dispatched) = thread::scope(|s| {
            let fetch = s.spawn(|| {
                digitizer.fetch(program.record_size, program.sample_rate, &cancel_fetch)
            });
            let dispatching = s.spawn(|| {
                let result = dispatch(
                    awg,
                    &program.waveforms,
                    program.timing.prescale,
                    settings,
                );
                if result.is_err() {
                    cancel_fetch.store(true, Ordering::SeqCst);
                }
                result
            });
            (join_task(fetch, "fetch"), join_task(dispatching, "dispatch"))
        });

        let dispatch_report = dispatched?;
        let trace = fetched?;

        let (image, reassembly) =
            reassemble(&trace, &program.grid, program.timing.dwell_period())?;

        Ok(ScanOutcome {
            image,
            trace,
            reassembly,
            dispatch: dispatch_report,
        })
    }
}

fn join_task<T>(
    handle: thread::ScopedJoinHandle<'_, Result<T, ScanError>>,
    name: &str,
) -> Result<T, ScanError> {
    handle
        .join()
        .map_err(|_| ScanError::Acquisition(format!("{name} task panicked")))?
}

/// Journal entry describing one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub timestamp: DateTime<Utc>,
    pub width: usize,
    pub height: usize,
    pub scheme: ScanScheme,
    pub mode: AcquisitionMode,
    pub frame_rate: f64,
    pub frames: u32,
    pub sample_count: u32,
    pub prescale: u32,
    pub effective_rate: f64,
    pub trigger_delay: u16,
    pub row_sample_count: Option<u32>,
    pub row_prescale: Option<u32>,
    pub sample_rate: u32,
    pub record_size: usize,
    pub samples_used: Option<usize>,
    pub dead_time_discards: Option<usize>,
    pub unconsumed: Option<usize>,
    pub intensity_range: Option<(f64, f64)>,
    pub error: Option<String>,
}

impl ScanRecord {
    pub fn planned(program: &ScanProgram) -> Self {
        Self {
            timestamp: Utc::now(),
            width: program.grid.width,
            height: program.grid.height,
            scheme: program.grid.scheme,
            mode: program.mode,
            frame_rate: program.frame_rate,
            frames: program.frames,
            sample_count: program.timing.sample_count,
            prescale: program.timing.prescale,
            effective_rate: program.timing.effective_rate,
            trigger_delay: program.trigger_delay,
            row_sample_count: program.row_timing.map(|t| t.samples_per_position),
            row_prescale: program.row_timing.map(|t| t.row.prescale),
            sample_rate: program.sample_rate,
            record_size: program.record_size,
            samples_used: None,
            dead_time_discards: None,
            unconsumed: None,
            intensity_range: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: &ScanOutcome) -> Self {
        self.samples_used = Some(outcome.reassembly.samples_used);
        self.dead_time_discards = Some(outcome.reassembly.dead_time_discards);
        self.unconsumed = Some(outcome.reassembly.unconsumed);
        self.intensity_range = outcome.image.range();
        self
    }

    pub fn with_error(mut self, error: &ScanError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digitizer::{synthetic_specimen, SimulatedDigitizer};
    use crate::hardware::SimulatedAwg;
    use crate::types::VoltageRange;
    use crossbeam_channel::bounded;
    use std::time::{Duration, Instant};

    fn fast_config(mode: AcquisitionMode, scheme: ScanScheme) -> ScanConfiguration {
        ScanConfiguration {
            mode,
            scheme,
            settle_delay_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_scan_1khz() {
        let config = fast_config(AcquisitionMode::FourD, ScanScheme::Conventional);
        let program = plan_scan(&ScanRequest::grid(8, 6, 1000.0), &config).unwrap();

        assert_eq!(program.timing.sample_count, 30);
        assert_eq!(program.timing.prescale, 3500);
        assert_eq!(program.trigger_delay, 0);
        assert_eq!(program.sample_rate, 10_000);
        assert_eq!(program.record_size, 528);
        assert_eq!(program.waveforms.beam_x.len(), 30 * 8);
        assert_eq!(program.waveforms.beam_x.repeat_count, 6);
        assert!(program.row_timing.is_some());
    }

    #[test]
    fn test_plan_scan_two_d_margin() {
        let config = fast_config(AcquisitionMode::TwoD, ScanScheme::Conventional);
        let request = ScanRequest::from_dwell_time(10, 10, 1000.0).unwrap();
        assert_eq!(request.frame_rate, 1000.0);
        let program = plan_scan(&request, &config).unwrap();
        assert_eq!(program.record_size, 1_150);
    }

    #[test]
    fn test_plan_scan_region() {
        let config = fast_config(AcquisitionMode::FourD, ScanScheme::Conventional);
        let region = ScanRegion::new(VoltageRange::new(-0.5, 0.5), VoltageRange::new(0.0, 0.5));
        let program = plan_scan(&ScanRequest::region(region, 5, 1000.0), &config).unwrap();
        assert_eq!(program.grid.height, 3);
    }

    #[test]
    fn test_plan_rejects_bad_requests() {
        let config = ScanConfiguration::default();
        assert!(matches!(
            plan_scan(&ScanRequest::grid(1, 4, 1000.0), &config),
            Err(ScanError::InvalidInput(_))
        ));
        assert!(matches!(
            plan_scan(&ScanRequest::grid(4, 4, 1e7), &config),
            Err(ScanError::ConfigurationInfeasible(_))
        ));
        assert!(matches!(
            ScanRequest::from_fields("64", "sixty", "1000"),
            Err(ScanError::InvalidInput(_))
        ));
        assert!(ScanRequest::from_fields("64", "64", "1000").is_ok());
        assert!(ScanRequest::from_dwell_time(4, 4, 0.0).is_err());
    }

    #[test]
    fn test_plan_memory_ceiling() {
        let config = ScanConfiguration {
            memory_ceiling_mb: 0.001,
            ..Default::default()
        };
        assert!(matches!(
            plan_scan(&ScanRequest::grid(64, 64, 1000.0), &config),
            Err(ScanError::ConfigurationInfeasible(_))
        ));
    }

    fn run_simulated(scheme: ScanScheme) {
        let config = fast_config(AcquisitionMode::FourD, scheme);
        let program = plan_scan(&ScanRequest::grid(6, 4, 2000.0), &config).unwrap();
        let specimen = synthetic_specimen(6, 4);

        let (tx, rx) = bounded(1);
        let mut awg = SimulatedAwg::new().with_start_signal(tx);
        let mut digitizer = SimulatedDigitizer::new(
            specimen.clone(),
            program.timing.dwell_period(),
            scheme,
        )
        .with_trigger(rx, Duration::from_secs(5));

        let outcome = Acquisition::new()
            .run(
                &program,
                &mut awg,
                &mut digitizer,
                &DispatchSettings::from_config(&config),
            )
            .unwrap();

        for (got, want) in outcome.image.pixels().iter().zip(specimen.iter()) {
            assert!((got - want).abs() < 1e-9);
        }
        assert_eq!(outcome.trace.len(), program.record_size);
        assert_eq!(outcome.dispatch.start_mask.0, 0b1111);

        let record = ScanRecord::planned(&program).with_outcome(&outcome);
        assert_eq!(record.dead_time_discards, Some(24));
    }

    #[test]
    fn test_run_conventional() {
        run_simulated(ScanScheme::Conventional);
    }

    #[test]
    fn test_run_serpentine() {
        run_simulated(ScanScheme::Serpentine);
    }

    #[test]
    fn test_abort_before_dispatch() {
        let config = fast_config(AcquisitionMode::FourD, ScanScheme::Conventional);
        let program = plan_scan(&ScanRequest::grid(4, 4, 1000.0), &config).unwrap();
        let acquisition = Acquisition::new();
        acquisition.abort_flag().store(true, Ordering::SeqCst);

        let mut awg = SimulatedAwg::new();
        let mut digitizer = SimulatedDigitizer::new(
            synthetic_specimen(4, 4),
            program.timing.dwell_period(),
            ScanScheme::Conventional,
        );
        let result = acquisition.run(
            &program,
            &mut awg,
            &mut digitizer,
            &DispatchSettings::from_config(&config),
        );
        assert!(matches!(result, Err(ScanError::Aborted)));
        assert!(awg.calls().is_empty());
    }

    #[test]
    fn test_dispatch_failure_surfaces() {
        let config = fast_config(AcquisitionMode::FourD, ScanScheme::Conventional);
        let program = plan_scan(&ScanRequest::grid(4, 4, 1000.0), &config).unwrap();

        let (tx, rx) = bounded(1);
        let mut awg = SimulatedAwg::new()
            .fail_load(0, -5)
            .with_start_signal(tx);
        let mut digitizer = SimulatedDigitizer::new(
            synthetic_specimen(4, 4),
            program.timing.dwell_period(),
            ScanScheme::Conventional,
        )
        .with_trigger(rx, Duration::from_secs(30));

        let started = Instant::now();
        let result = Acquisition::new().run(
            &program,
            &mut awg,
            &mut digitizer,
            &DispatchSettings::from_config(&config),
        );
        assert!(matches!(result, Err(ScanError::StartWithheld(_))));
        // The waiting fetch is cancelled instead of running into its trigger timeout
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_at_tolerance_band_edge() {
        // Solves to a dwell 1.1 times the frame period, the top of the tolerance band
        let config = fast_config(AcquisitionMode::FourD, ScanScheme::Conventional);
        let program = plan_scan(&ScanRequest::grid(16, 16, 999_991.0), &config).unwrap();
        assert_eq!(program.timing.sample_count, 5);
        assert_eq!(program.timing.prescale, 22);
        assert_eq!(program.sample_rate, 10_000_000);
        assert!(program.record_size > 2816);

        let specimen = synthetic_specimen(16, 16);
        let mut awg = SimulatedAwg::new();
        let mut digitizer = SimulatedDigitizer::new(
            specimen.clone(),
            program.timing.dwell_period(),
            ScanScheme::Conventional,
        );
        let outcome = Acquisition::new()
            .run(
                &program,
                &mut awg,
                &mut digitizer,
                &DispatchSettings::from_config(&config),
            )
            .unwrap();

        assert_eq!(outcome.reassembly.pixels, 256);
        for (got, want) in outcome.image.pixels().iter().zip(specimen.iter()) {
            assert!((got - want).abs() < 1e-9);
        }
    }
}
