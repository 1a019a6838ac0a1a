use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::digitizer::SampleRateLadder;
use crate::error::ScanError;
use crate::timing::{TimingLimits, TriggerDelayPolicy};
use crate::types::{AcquisitionMode, Channel, ScanScheme, VoltageRange};

/// Immutable scan settings passed into every planning call
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScanConfiguration {
    pub scheme: ScanScheme,
    pub mode: AcquisitionMode,
    /// Full-frame deflection range as a fraction of the beam channel amplitude
    pub scan_range: VoltageRange,
    /// Slow-axis parking value used by serpentine scans
    pub guard_voltage: f64,
    pub amplitudes: ChannelAmplitudes,
    pub timing: TimingLimits,
    pub trigger_delay: TriggerDelayPolicy,
    /// Ceiling on the total waveform memory of all four channels
    pub memory_ceiling_mb: f64,
    /// Wait between queuing the last channel and starting all of them
    pub settle_delay_ms: u64,
    pub digitizer: DigitizerSettings,
}

/// Output amplitude (V) of each generator channel
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChannelAmplitudes {
    pub beam_x: f64,
    pub beam_y: f64,
    pub camera_trigger: f64,
    pub digitizer_trigger: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DigitizerSettings {
    /// Detector samples requested per beam position before snapping to the ladder
    pub oversampling: u32,
    pub record_margin_4d: f64,
    pub record_margin_2d: f64,
    pub rate_ladder: SampleRateLadder,
}

impl Default for ScanConfiguration {
    fn default() -> Self {
        Self {
            scheme: ScanScheme::Conventional,
            mode: AcquisitionMode::FourD,
            scan_range: VoltageRange::default(),
            guard_voltage: 1.0,
            amplitudes: ChannelAmplitudes::default(),
            timing: TimingLimits::default(),
            trigger_delay: TriggerDelayPolicy::default(),
            memory_ceiling_mb: 2000.0,
            settle_delay_ms: 1000,
            digitizer: DigitizerSettings::default(),
        }
    }
}

impl Default for ChannelAmplitudes {
    fn default() -> Self {
        // Deflection calibrated against the microscope's internal scan range of +-0.15 V
        Self {
            beam_x: 0.3,
            beam_y: 0.3,
            camera_trigger: 0.5,
            digitizer_trigger: 0.25,
        }
    }
}

impl Default for DigitizerSettings {
    fn default() -> Self {
        Self {
            oversampling: 10,
            record_margin_4d: 1.1,
            record_margin_2d: 1.15,
            rate_ladder: SampleRateLadder::default(),
        }
    }
}

impl ChannelAmplitudes {
    pub fn for_channel(&self, channel: Channel) -> f64 {
        match channel {
            Channel::BeamX => self.beam_x,
            Channel::BeamY => self.beam_y,
            Channel::CameraTrigger => self.camera_trigger,
            Channel::DigitizerTrigger => self.digitizer_trigger,
        }
    }
}

impl DigitizerSettings {
    pub fn record_margin(&self, mode: AcquisitionMode) -> f64 {
        match mode {
            AcquisitionMode::FourD => self.record_margin_4d,
            AcquisitionMode::TwoD => self.record_margin_2d,
        }
    }
}

impl ScanConfiguration {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn memory_ceiling_bytes(&self) -> u64 {
        (self.memory_ceiling_mb * 1e6) as u64
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ScanError> {
        self.scan_range.validate()?;
        self.timing.validate()?;

        if !self.guard_voltage.is_finite() {
            return Err(ScanError::InvalidInput(
                "guard_voltage must be finite".to_string(),
            ));
        }

        for channel in Channel::ALL {
            let amplitude = self.amplitudes.for_channel(channel);
            if !(amplitude.is_finite() && amplitude > 0.0) {
                return Err(ScanError::InvalidInput(format!(
                    "Amplitude for {channel} must be positive, got {amplitude}"
                )));
            }
        }

        if !(self.memory_ceiling_mb > 0.0) {
            return Err(ScanError::InvalidInput(format!(
                "memory_ceiling_mb must be positive, got {}",
                self.memory_ceiling_mb
            )));
        }

        if self.digitizer.oversampling == 0 {
            return Err(ScanError::InvalidInput(
                "digitizer.oversampling must be at least 1".to_string(),
            ));
        }

        for margin in [
            self.digitizer.record_margin_4d,
            self.digitizer.record_margin_2d,
        ] {
            if !(margin >= 1.0) {
                return Err(ScanError::InvalidInput(format!(
                    "Record margins must be >= 1.0, got {margin}"
                )));
            }
        }

        self.digitizer.rate_ladder.validate()
    }
}
