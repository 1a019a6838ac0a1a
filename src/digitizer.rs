//! Detector digitizer boundary
//!
//! The digitizer samples the annular detector on its own clock. A fetch blocks until the
//! requested number of samples has been recorded, which only starts once the generator's
//! digitizer trigger channel fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::reassembly::CLOCK_EPSILON;
use crate::types::{ChannelMask, ScanScheme};

/// Raw detector values at a fixed sample period, in acquisition order
#[derive(Debug, Clone, PartialEq)]
pub struct SampleStream {
    samples: Vec<f64>,
    sample_period: f64,
}

impl SampleStream {
    pub fn new(samples: Vec<f64>, sample_rate: u32) -> Result<Self, ScanError> {
        if sample_rate == 0 {
            return Err(ScanError::InvalidInput(
                "Sample rate must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            samples,
            sample_period: 1.0 / sample_rate as f64,
        })
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Seconds between consecutive samples
    pub fn sample_period(&self) -> f64 {
        self.sample_period
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// How often a waiting fetch checks its cancel flag
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blocking sample acquisition
pub trait Digitizer: Send {
    /// Record `sample_count` samples at `sample_rate` Sa/s and return them once complete
    ///
    /// While waiting for the trigger, implementations must poll `cancel` at least every
    /// `CANCEL_POLL_INTERVAL` and give up once it is set.
    fn fetch(
        &mut self,
        sample_count: usize,
        sample_rate: u32,
        cancel: &AtomicBool,
    ) -> Result<SampleStream, ScanError>;
}

/// Sample rates the digitizer supports, ascending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleRateLadder(Vec<u32>);

impl Default for SampleRateLadder {
    fn default() -> Self {
        Self(vec![
            1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 200_000, 500_000, 1_000_000,
            2_000_000, 5_000_000, 10_000_000, 20_000_000,
        ])
    }
}

impl SampleRateLadder {
    pub fn new(rates: Vec<u32>) -> Result<Self, ScanError> {
        let ladder = Self(rates);
        ladder.validate()?;
        Ok(ladder)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.0.is_empty() || self.0[0] == 0 {
            return Err(ScanError::InvalidInput(
                "Sample rate ladder must contain non-zero rates".to_string(),
            ));
        }
        if !self.0.windows(2).all(|w| w[0] < w[1]) {
            return Err(ScanError::InvalidInput(
                "Sample rate ladder must be strictly ascending".to_string(),
            ));
        }
        Ok(())
    }

    /// Device ceiling
    pub fn max_rate(&self) -> u32 {
        self.0.last().copied().unwrap_or(0)
    }

    /// Nearest supported rate at or above `requested`, capped at the ceiling
    pub fn select(&self, requested: f64) -> u32 {
        self.0
            .iter()
            .copied()
            .find(|&rate| rate as f64 >= requested)
            .unwrap_or_else(|| self.max_rate())
    }
}

/// Number of samples to record for a scan of `pixel_count` positions
///
/// The margin covers dead-time samples and the trailing boundary sample of the last pixel.
pub fn record_size(pixel_count: usize, frame_rate: f64, sample_rate: u32, margin: f64) -> usize {
    let nominal = (pixel_count as f64 * sample_rate as f64 / frame_rate).floor();
    (nominal * margin).floor() as usize
}

/// Fewest samples that still cover every dwell interval plus the boundary sample after the
/// last pixel
///
/// The margin in `record_size` is a ratio against the requested rate, so it comes up short when
/// the solved dwell sits at the top of the tolerance band.
pub fn minimum_record_size(pixel_count: usize, dwell_period: f64, sample_rate: u32) -> usize {
    (pixel_count as f64 * dwell_period * sample_rate as f64).ceil() as usize + 2
}

/// Digitizer that samples a synthetic specimen along the beam path
///
/// Sample `k` is taken at `(k + 1) * Ts` and reads the pixel the beam dwells on at that
/// instant; samples after the last pixel read zero.
pub struct SimulatedDigitizer {
    specimen: Array2<f64>,
    dwell_period: f64,
    scheme: ScanScheme,
    trigger: Option<(Receiver<ChannelMask>, Duration)>,
}

impl SimulatedDigitizer {
    pub fn new(specimen: Array2<f64>, dwell_period: f64, scheme: ScanScheme) -> Self {
        Self {
            specimen,
            dwell_period,
            scheme,
            trigger: None,
        }
    }

    /// Block each fetch until a generator start edge arrives or `timeout` passes
    pub fn with_trigger(mut self, start: Receiver<ChannelMask>, timeout: Duration) -> Self {
        self.trigger = Some((start, timeout));
        self
    }

    fn wait_for_trigger(
        start: &Receiver<ChannelMask>,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<ChannelMask, ScanError> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(ScanError::Acquisition(
                    "Fetch cancelled before the trigger arrived".to_string(),
                ));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScanError::Acquisition(format!(
                    "No trigger received within {timeout:?}"
                )));
            }
            match start.recv_timeout(remaining.min(CANCEL_POLL_INTERVAL)) {
                Ok(mask) => return Ok(mask),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ScanError::Acquisition(
                        "Trigger source went away".to_string(),
                    ));
                }
            }
        }
    }

    fn value_at(&self, time: f64) -> f64 {
        let (height, width) = self.specimen.dim();
        let cursor = ((time - CLOCK_EPSILON) / self.dwell_period).ceil() as i64 - 1;
        if cursor < 0 || cursor as usize >= width * height {
            return 0.0;
        }
        let cursor = cursor as usize;
        let row = cursor / width;
        let mut col = cursor % width;
        if self.scheme == ScanScheme::Serpentine && row % 2 == 1 {
            col = width - 1 - col;
        }
        self.specimen[[row, col]]
    }
}

impl Digitizer for SimulatedDigitizer {
    fn fetch(
        &mut self,
        sample_count: usize,
        sample_rate: u32,
        cancel: &AtomicBool,
    ) -> Result<SampleStream, ScanError> {
        if let Some((start, timeout)) = &self.trigger {
            let mask = Self::wait_for_trigger(start, *timeout, cancel)?;
            debug!("Simulated digitizer triggered by mask {:#06b}", mask.0);
        }

        let period = 1.0 / sample_rate as f64;
        let samples = (0..sample_count)
            .map(|k| self.value_at((k + 1) as f64 * period))
            .collect();
        info!("Simulated digitizer recorded {sample_count} samples at {sample_rate} Sa/s");
        SampleStream::new(samples, sample_rate)
    }
}

/// Bright-field-like test specimen: a few gaussian particles on a weak gradient
pub fn synthetic_specimen(width: usize, height: usize) -> Array2<f64> {
    let particles = [(0.3, 0.3, 0.12), (0.7, 0.4, 0.08), (0.45, 0.75, 0.15)];
    Array2::from_shape_fn((height, width), |(row, col)| {
        let x = (col as f64 + 0.5) / width as f64;
        let y = (row as f64 + 0.5) / height as f64;
        let background = 0.1 + 0.05 * x;
        particles.iter().fold(background, |acc, &(cx, cy, sigma)| {
            let r2 = (x - cx).powi(2) + (y - cy).powi(2);
            acc + (-r2 / (2.0 * sigma * sigma)).exp()
        })
    })
}
