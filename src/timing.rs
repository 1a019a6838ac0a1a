//! Timing parameter solver for the scan waveform generator.
//!
//! The generator plays every waveform sample for `prescale` ticks of its base clock, and each
//! beam position is held for `sample_count` samples. The pair has to be chosen so that one beam
//! position lasts a little longer than one camera frame (the tolerance band), while the prescale
//! fits the 12-bit register. Integer rounding of the prescale interacts with the band, so the
//! pair is found by a stepped search rather than solved in closed form.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Generator output clock before prescaling
pub const DEFAULT_BASE_CLOCK_HZ: f64 = 1e8;
/// Width of the prescale register
pub const DEFAULT_MAX_PRESCALE: u32 = 4095;
/// Largest sample count per beam position the instrument accepts
pub const DEFAULT_MAX_SAMPLE_COUNT: u32 = 4095;
/// Beam dwell must be at least 5% longer than the camera frame time
pub const DEFAULT_TOLERANCE_LOW: f64 = 1.05;
/// and at most 10% longer
pub const DEFAULT_TOLERANCE_HIGH: f64 = 1.10;
/// Sample counts are searched in multiples of this value
pub const DEFAULT_GRANULARITY: u32 = 5;
/// Trigger delays are programmed in units of this many nanoseconds
pub const DEFAULT_DELAY_RESOLUTION_NS: u32 = 10;
/// Derived trigger delays above this are clamped
pub const DEFAULT_MAX_TRIGGER_DELAY_NS: u32 = 25_000;

/// The row solve keeps the primary trigger delay on a grid of this many row prescale units
const ROW_SYNC_FACTOR: u64 = 10;

/// Device constraints used by the timing solver
///
/// The tolerance constants are tuned to one vendor's hardware; they set the safety margin
/// between the beam dwell and the camera integration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingLimits {
    pub base_clock_hz: f64,
    pub max_prescale: u32,
    pub max_sample_count: u32,
    pub tolerance_low: f64,
    pub tolerance_high: f64,
    pub granularity: u32,
    pub delay_resolution_ns: u32,
    pub max_trigger_delay_ns: u32,
}

impl Default for TimingLimits {
    fn default() -> Self {
        Self {
            base_clock_hz: DEFAULT_BASE_CLOCK_HZ,
            max_prescale: DEFAULT_MAX_PRESCALE,
            max_sample_count: DEFAULT_MAX_SAMPLE_COUNT,
            tolerance_low: DEFAULT_TOLERANCE_LOW,
            tolerance_high: DEFAULT_TOLERANCE_HIGH,
            granularity: DEFAULT_GRANULARITY,
            delay_resolution_ns: DEFAULT_DELAY_RESOLUTION_NS,
            max_trigger_delay_ns: DEFAULT_MAX_TRIGGER_DELAY_NS,
        }
    }
}

impl TimingLimits {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !(self.base_clock_hz.is_finite() && self.base_clock_hz > 0.0) {
            return Err(ScanError::InvalidInput(format!(
                "base_clock_hz must be positive, got {}",
                self.base_clock_hz
            )));
        }
        if self.max_prescale == 0 || self.max_sample_count == 0 || self.granularity == 0 {
            return Err(ScanError::InvalidInput(
                "max_prescale, max_sample_count and granularity must be non-zero".to_string(),
            ));
        }
        if !(self.tolerance_low > 0.0 && self.tolerance_high >= self.tolerance_low) {
            return Err(ScanError::InvalidInput(format!(
                "Tolerance band [{}, {}] is invalid",
                self.tolerance_low, self.tolerance_high
            )));
        }
        if self.delay_resolution_ns == 0 {
            return Err(ScanError::InvalidInput(
                "delay_resolution_ns must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hardware-legal timing for one scan axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingParameters {
    /// Waveform samples per beam position
    pub sample_count: u32,
    /// Base clock divider applied to the waveform output
    pub prescale: u32,
    /// Beam position rate the generator actually runs at (Hz)
    pub effective_rate: f64,
}

impl TimingParameters {
    fn new(sample_count: u32, prescale: u32, base_clock_hz: f64) -> Self {
        Self {
            sample_count,
            prescale,
            effective_rate: base_clock_hz / (prescale as f64 * sample_count as f64),
        }
    }

    /// Time the beam spends on one position (s)
    pub fn dwell_period(&self) -> f64 {
        1.0 / self.effective_rate
    }
}

/// Timing of the slow (row) axis, solved against the row repetition rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SecondaryTiming {
    /// `sample_count` counts samples per full row here
    pub row: TimingParameters,
    pub samples_per_position: u32,
}

/// How the beam-channel trigger delay is chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerDelayPolicy {
    /// Programmed as given, in delay-resolution ticks
    Fixed { ticks: u16 },
    /// Difference between the beam dwell and the camera frame time
    Derived,
}

impl Default for TriggerDelayPolicy {
    fn default() -> Self {
        // The camera's global shutter readout tolerates moving the beam immediately
        Self::Fixed { ticks: 0 }
    }
}

impl TriggerDelayPolicy {
    pub fn resolve(
        &self,
        timing: &TimingParameters,
        target_rate: f64,
        limits: &TimingLimits,
    ) -> u16 {
        match *self {
            TriggerDelayPolicy::Fixed { ticks } => ticks,
            TriggerDelayPolicy::Derived => derived_trigger_delay(timing, target_rate, limits),
        }
    }
}

/// Trigger delay covering the slack between beam dwell and camera frame time, in ticks
pub fn derived_trigger_delay(
    timing: &TimingParameters,
    target_rate: f64,
    limits: &TimingLimits,
) -> u16 {
    let slack_ns = ((timing.dwell_period() - 1.0 / target_rate) * 1e9)
        .floor()
        .max(0.0) as u64;
    let clamped_ns = slack_ns.min(limits.max_trigger_delay_ns as u64);
    let ticks = clamped_ns / limits.delay_resolution_ns as u64;
    ticks.min(u16::MAX as u64) as u16
}

fn validate_rate(target_rate: f64) -> Result<(), ScanError> {
    if !(target_rate.is_finite() && target_rate > 0.0) {
        return Err(ScanError::InvalidInput(format!(
            "Scan rate must be a positive number, got {target_rate}"
        )));
    }
    Ok(())
}

/// Step the sample count from `start` in `step` increments until `accept` yields a prescale
fn search_sample_count<F>(start: u64, step: u64, max: u64, mut accept: F) -> Option<(u64, u32)>
where
    F: FnMut(u64) -> Option<u32>,
{
    let mut n = start;
    while n <= max {
        if let Some(prescale) = accept(n) {
            return Some((n, prescale));
        }
        n += step;
    }
    None
}

/// Find the smallest legal (sample count, prescale) pair for a beam position rate
///
/// # Arguments
/// * `target_rate` - Requested beam positions per second (the camera frame rate)
/// * `limits` - Device clock, register widths and tolerance band
///
/// # Returns
/// Timing whose dwell period lies within `[tolerance_low, tolerance_high] / target_rate`,
/// or `ConfigurationInfeasible` if no pair exists below `max_sample_count`.
pub fn solve(target_rate: f64, limits: &TimingLimits) -> Result<TimingParameters, ScanError> {
    validate_rate(target_rate)?;

    let ticks = limits.tolerance_low * limits.base_clock_hz / target_rate;
    let ceiling_ticks = limits.tolerance_high * limits.base_clock_hz / target_rate;
    let step = limits.granularity as u64;
    let max_prescale = limits.max_prescale as f64;

    let start = (ticks / max_prescale).ceil();
    let max_n = limits.max_sample_count as u64;
    if start > max_n as f64 {
        return Err(infeasible(target_rate, limits));
    }
    let start = (start as u64 / step) * step;

    let found = search_sample_count(start, step, max_n, |n| {
        if n == 0 {
            return None;
        }
        let prescale = (ticks / n as f64).ceil();
        let within_band = prescale <= ceiling_ticks / n as f64;
        (prescale >= 1.0 && prescale <= max_prescale && within_band).then_some(prescale as u32)
    });

    match found {
        Some((n, prescale)) => {
            let timing = TimingParameters::new(n as u32, prescale, limits.base_clock_hz);
            debug!(
                "Prescaling factor {} will be used with {} samples per beam position ({:.3} Hz)",
                timing.prescale, timing.sample_count, timing.effective_rate
            );
            Ok(timing)
        }
        None => Err(infeasible(target_rate, limits)),
    }
}

/// Solve the row axis against the derated row rate
///
/// Must run after the primary solve: the resulting row prescale has to keep the primary
/// trigger delay on the row timing grid.
pub fn solve_secondary(
    target_rate: f64,
    fast_axis_len: usize,
    primary_delay_ticks: u16,
    limits: &TimingLimits,
) -> Result<SecondaryTiming, ScanError> {
    validate_rate(target_rate)?;
    if fast_axis_len == 0 {
        return Err(ScanError::InvalidInput(
            "Fast axis must have at least one position".to_string(),
        ));
    }

    let row_rate = target_rate / fast_axis_len as f64;
    let ticks = limits.tolerance_low * limits.base_clock_hz / row_rate;
    let ceiling_ticks = limits.tolerance_high * limits.base_clock_hz / row_rate;
    let step = limits.granularity as u64;
    let max_prescale = limits.max_prescale as f64;
    let max_n = limits.max_sample_count as u64 * fast_axis_len as u64;
    let delay = primary_delay_ticks as u64;

    let start = (ticks / max_prescale).ceil();
    if start > max_n as f64 {
        return Err(infeasible(row_rate, limits));
    }
    let start = (start as u64 / step) * step;

    let found = search_sample_count(start, step, max_n, |n| {
        if n <= 1 {
            return None;
        }
        let prescale = (ticks / n as f64).ceil();
        if prescale < 1.0 || prescale > max_prescale || prescale > ceiling_ticks / n as f64 {
            return None;
        }
        let quantum = ROW_SYNC_FACTOR * prescale as u64;
        (delay % quantum <= 1).then_some(prescale as u32)
    });

    let (n, prescale) = found.ok_or_else(|| infeasible(row_rate, limits))?;
    let row = TimingParameters::new(n as u32, prescale, limits.base_clock_hz);
    let samples_per_position = n.div_ceil(fast_axis_len as u64) as u32;

    debug!(
        "Prescaling factor for row axis {} will be used with {} samples per beam position",
        row.prescale, samples_per_position
    );

    Ok(SecondaryTiming {
        row,
        samples_per_position,
    })
}

fn infeasible(rate: f64, limits: &TimingLimits) -> ScanError {
    ScanError::ConfigurationInfeasible(format!(
        "No sample count up to {} with prescale <= {} reaches {:.3} Hz within [{}, {}]",
        limits.max_sample_count,
        limits.max_prescale,
        rate,
        limits.tolerance_low,
        limits.tolerance_high
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_solve_1khz_regression() {
        let timing = solve(1000.0, &TimingLimits::default()).unwrap();
        assert_eq!(timing.sample_count, 30);
        assert_eq!(timing.prescale, 3500);
        assert_eq!(timing.sample_count % DEFAULT_GRANULARITY, 0);
        assert!((timing.effective_rate - 1e8 / 105_000.0).abs() < 1e-9);
        assert!((timing.dwell_period() - 1.05e-3).abs() < 1e-12);
    }

    #[test]
    fn test_solve_legacy_tolerance_profile() {
        let limits = TimingLimits {
            tolerance_low: 1.0,
            tolerance_high: 1.02,
            ..Default::default()
        };
        let timing = solve(1000.0, &limits).unwrap();
        assert_eq!(timing.sample_count, 25);
        assert_eq!(timing.prescale, 4000);
    }

    #[test]
    fn test_solve_high_rate_steps_over_zero_samples() {
        // Starting count rounds down to zero and must be stepped over
        let timing = solve(100_000.0, &TimingLimits::default()).unwrap();
        assert_eq!(timing.sample_count, 5);
        assert_eq!(timing.prescale, 210);
    }

    #[test]
    fn test_solve_infeasible_rates() {
        let limits = TimingLimits::default();
        assert!(matches!(
            solve(1e7, &limits),
            Err(ScanError::ConfigurationInfeasible(_))
        ));
        assert!(matches!(
            solve(1.0, &limits),
            Err(ScanError::ConfigurationInfeasible(_))
        ));
    }

    #[test]
    fn test_solve_rejects_invalid_rate() {
        let limits = TimingLimits::default();
        for rate in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                solve(rate, &limits),
                Err(ScanError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_supported_range_always_solvable() {
        let limits = TimingLimits::default();
        let mut rate = 100.0;
        while rate <= 100_000.0 {
            let timing = solve(rate, &limits).unwrap();
            assert!(timing.prescale >= 1 && timing.prescale <= limits.max_prescale);
            assert_eq!(timing.sample_count % limits.granularity, 0);
            rate *= 1.37;
        }
    }

    #[test]
    fn test_solve_secondary_row_axis() {
        let limits = TimingLimits::default();
        let secondary = solve_secondary(1000.0, 4, 0, &limits).unwrap();
        assert_eq!(secondary.row.sample_count, 105);
        assert_eq!(secondary.row.prescale, 4000);
        assert_eq!(secondary.samples_per_position, 27);
    }

    #[test]
    fn test_solve_secondary_sync_constraint() {
        let limits = TimingLimits::default();
        // 40001 ticks is one tick past a multiple of 10 * 4000
        let synced = solve_secondary(1000.0, 4, 40_001, &limits).unwrap();
        assert_eq!(synced.row.prescale, 4000);

        // A 7-tick delay never lands on the row grid
        assert!(matches!(
            solve_secondary(1000.0, 4, 7, &limits),
            Err(ScanError::ConfigurationInfeasible(_))
        ));
    }

    #[test]
    fn test_derived_trigger_delay() {
        let limits = TimingLimits::default();

        let timing = solve(1000.0, &limits).unwrap();
        // 50 us of slack is clamped to 25 us
        assert_eq!(derived_trigger_delay(&timing, 1000.0, &limits), 2500);

        let exact = TimingParameters::new(25, 4000, limits.base_clock_hz);
        assert_eq!(derived_trigger_delay(&exact, 1000.0, &limits), 0);

        let small = TimingParameters::new(25, 4010, limits.base_clock_hz);
        let ticks = derived_trigger_delay(&small, 1000.0, &limits);
        assert!((249..=250).contains(&ticks));
    }

    #[test]
    fn test_trigger_delay_policy() {
        let limits = TimingLimits::default();
        let timing = solve(1000.0, &limits).unwrap();
        assert_eq!(
            TriggerDelayPolicy::default().resolve(&timing, 1000.0, &limits),
            0
        );
        assert_eq!(
            TriggerDelayPolicy::Derived.resolve(&timing, 1000.0, &limits),
            2500
        );
    }

    proptest! {
        #[test]
        fn prop_solve_is_legal_or_infeasible(rate in 1.0f64..2e7) {
            let limits = TimingLimits::default();
            match solve(rate, &limits) {
                Ok(timing) => {
                    prop_assert!(timing.prescale >= 1 && timing.prescale <= limits.max_prescale);
                    prop_assert!(timing.sample_count >= 1);
                    prop_assert!(timing.sample_count <= limits.max_sample_count);
                    let floor = rate / limits.tolerance_high * (1.0 - 1e-9);
                    let ceiling = rate / limits.tolerance_low * (1.0 + 1e-9);
                    prop_assert!(timing.effective_rate >= floor);
                    prop_assert!(timing.effective_rate <= ceiling);
                }
                Err(ScanError::ConfigurationInfeasible(_)) => {}
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
