use log::{debug, info};

use crate::error::ScanError;
use crate::pattern::ScanAxisPlan;
use crate::timing::TimingParameters;
use crate::types::Channel;

/// Driver-side storage per waveform sample
pub const BYTES_PER_SAMPLE: u64 = 8;
/// Trigger strobe level; the receivers fire on the falling edge
pub const TRIGGER_LOW: f64 = -1.0;

/// Samples for one generator channel plus how the hardware replays them
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    pub channel: Channel,
    pub samples: Vec<f64>,
    /// Number of times the queued waveform is played back to back
    pub repeat_count: u32,
    /// Start delay in 10 ns ticks
    pub trigger_delay: u16,
}

impl WaveformBuffer {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples actually emitted once every repeat has played
    pub fn played_samples(&self) -> u64 {
        self.samples.len() as u64 * self.repeat_count as u64
    }
}

/// The four buffers of one scan program
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformSet {
    pub beam_x: WaveformBuffer,
    pub beam_y: WaveformBuffer,
    pub camera_trigger: WaveformBuffer,
    pub digitizer_trigger: WaveformBuffer,
}

impl WaveformSet {
    pub fn get(&self, channel: Channel) -> &WaveformBuffer {
        match channel {
            Channel::BeamX => &self.beam_x,
            Channel::BeamY => &self.beam_y,
            Channel::CameraTrigger => &self.camera_trigger,
            Channel::DigitizerTrigger => &self.digitizer_trigger,
        }
    }

    /// Buffers in channel order
    pub fn iter(&self) -> impl Iterator<Item = &WaveformBuffer> {
        Channel::ALL.into_iter().map(move |ch| self.get(ch))
    }

    pub fn memory_bytes(&self) -> u64 {
        self.iter()
            .map(|b| b.len() as u64 * BYTES_PER_SAMPLE)
            .sum()
    }
}

/// Bytes the four buffers will occupy, or `None` on overflow
pub fn required_bytes(fast_len: usize, slow_len: usize, sample_count: u32) -> Option<u64> {
    let row = (fast_len as u64).checked_mul(sample_count as u64)?;
    let frame = row.checked_mul(slow_len as u64)?;
    row.checked_mul(3)?
        .checked_add(frame)?
        .checked_mul(BYTES_PER_SAMPLE)
}

/// Expand axis plans into the four channel buffers
///
/// # Arguments
/// * `x_plan` - Fast axis, one beam position per fast index
/// * `y_plan` - Slow axis, one row per slow index
/// * `timing` - Solved timing; each position is held `sample_count` samples
/// * `trigger_delay` - Start delay applied to both beam channels
/// * `frames` - Number of complete frames played per start
/// * `memory_ceiling_bytes` - Hard limit checked before anything is allocated
pub fn synthesize(
    x_plan: &ScanAxisPlan,
    y_plan: &ScanAxisPlan,
    timing: &TimingParameters,
    trigger_delay: u16,
    frames: u32,
    memory_ceiling_bytes: u64,
) -> Result<WaveformSet, ScanError> {
    if frames == 0 {
        return Err(ScanError::InvalidInput(
            "At least one frame must be requested".to_string(),
        ));
    }
    if x_plan.is_empty() || y_plan.is_empty() || timing.sample_count == 0 {
        return Err(ScanError::InvalidInput(
            "Axis plans and sample count must be non-empty".to_string(),
        ));
    }

    let hold = timing.sample_count as usize;
    let fast_len = x_plan.len();
    let slow_len = y_plan.len();

    let required = required_bytes(fast_len, slow_len, timing.sample_count);
    match required {
        Some(bytes) if bytes <= memory_ceiling_bytes => {
            debug!("Waveform memory {:.1} MB", bytes as f64 / 1e6);
        }
        _ => {
            return Err(ScanError::ConfigurationInfeasible(format!(
                "Waveforms for {} x {} positions at {} samples each exceed {:.0} MB",
                fast_len,
                slow_len,
                hold,
                memory_ceiling_bytes as f64 / 1e6
            )));
        }
    }

    let row_repeats = (slow_len as u64)
        .checked_mul(frames as u64)
        .and_then(|r| u32::try_from(r).ok())
        .ok_or_else(|| {
            ScanError::ConfigurationInfeasible(format!(
                "{slow_len} rows x {frames} frames exceeds the repeat counter"
            ))
        })?;

    // Queue convention: the last logical position is played first
    let mut beam_x = Vec::with_capacity(hold * fast_len);
    for (_, voltage) in x_plan.iter().rev() {
        beam_x.extend(std::iter::repeat_n(voltage, hold));
    }

    let mut beam_y = Vec::with_capacity(hold * fast_len * slow_len);
    for (_, voltage) in y_plan.iter().rev() {
        beam_y.extend(std::iter::repeat_n(voltage, hold * fast_len));
    }

    let mut camera_trigger = vec![0.0; hold * fast_len];
    for segment in camera_trigger.chunks_mut(hold) {
        segment[0] = TRIGGER_LOW;
    }

    let mut digitizer_trigger = vec![0.0; hold * fast_len];
    digitizer_trigger[..hold].fill(TRIGGER_LOW);

    info!(
        "Synthesized waveforms: {} samples per row, {} per frame, {} frame(s)",
        beam_x.len(),
        beam_y.len(),
        frames
    );

    Ok(WaveformSet {
        beam_x: WaveformBuffer {
            channel: Channel::BeamX,
            samples: beam_x,
            repeat_count: row_repeats,
            trigger_delay,
        },
        beam_y: WaveformBuffer {
            channel: Channel::BeamY,
            samples: beam_y,
            repeat_count: frames,
            trigger_delay,
        },
        camera_trigger: WaveformBuffer {
            channel: Channel::CameraTrigger,
            samples: camera_trigger,
            repeat_count: row_repeats,
            trigger_delay: 0,
        },
        digitizer_trigger: WaveformBuffer {
            channel: Channel::DigitizerTrigger,
            samples: digitizer_trigger,
            repeat_count: 1,
            trigger_delay: 0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::generate;
    use crate::types::{ScanGrid, ScanScheme, VoltageRange};

    fn timing(sample_count: u32) -> TimingParameters {
        TimingParameters {
            sample_count,
            prescale: 1000,
            effective_rate: 1e8 / (1000.0 * sample_count as f64),
        }
    }

    fn plans(width: usize, height: usize) -> (ScanAxisPlan, ScanAxisPlan) {
        let grid = ScanGrid::new(width, height, ScanScheme::Conventional);
        generate(&grid, &VoltageRange::default(), 1.0).unwrap()
    }

    #[test]
    fn test_buffer_layout() {
        let (x, y) = plans(2, 2);
        let set = synthesize(&x, &y, &timing(3), 7, 4, u64::MAX).unwrap();

        assert_eq!(set.beam_x.samples, vec![0.5, 0.5, 0.5, -0.5, -0.5, -0.5]);
        assert_eq!(set.beam_x.repeat_count, 8);
        assert_eq!(set.beam_x.trigger_delay, 7);

        let mut expected_y = vec![0.5; 6];
        expected_y.extend([-0.5; 6]);
        assert_eq!(set.beam_y.samples, expected_y);
        assert_eq!(set.beam_y.repeat_count, 4);

        assert_eq!(
            set.camera_trigger.samples,
            vec![-1.0, 0.0, 0.0, -1.0, 0.0, 0.0]
        );
        assert_eq!(set.camera_trigger.repeat_count, 8);
        assert_eq!(set.camera_trigger.trigger_delay, 0);

        assert_eq!(
            set.digitizer_trigger.samples,
            vec![-1.0, -1.0, -1.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(set.digitizer_trigger.repeat_count, 1);
    }

    #[test]
    fn test_played_samples_match_scan() {
        let (x, y) = plans(8, 5);
        let set = synthesize(&x, &y, &timing(30), 0, 2, u64::MAX).unwrap();
        // Both beam channels emit one full sweep per frame
        assert_eq!(set.beam_x.played_samples(), set.beam_y.played_samples());
        assert_eq!(set.beam_y.played_samples(), 30 * 8 * 5 * 2);
        assert_eq!(set.memory_bytes(), required_bytes(8, 5, 30).unwrap());
    }

    #[test]
    fn test_serpentine_lengths() {
        let grid = ScanGrid::new(4, 3, ScanScheme::Serpentine);
        let (x, y) = generate(&grid, &VoltageRange::default(), 1.0).unwrap();
        let set = synthesize(&x, &y, &timing(5), 0, 1, u64::MAX).unwrap();
        assert_eq!(set.beam_x.len(), 5 * 8);
        assert_eq!(set.beam_y.len(), 5 * 8 * 6);
        // Guard parking is the first slow position played after reversal
        assert_eq!(set.beam_y.samples[0], 1.0);
    }

    #[test]
    fn test_memory_ceiling_rejects_before_allocation() {
        let (x, y) = plans(4096, 4096);
        let result = synthesize(&x, &y, &timing(4095), 0, 1, 2_000_000_000);
        assert!(matches!(
            result,
            Err(ScanError::ConfigurationInfeasible(_))
        ));
    }

    #[test]
    fn test_rejects_zero_frames() {
        let (x, y) = plans(2, 2);
        assert!(matches!(
            synthesize(&x, &y, &timing(3), 0, 0, u64::MAX),
            Err(ScanError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_required_bytes_overflow() {
        assert_eq!(required_bytes(usize::MAX, usize::MAX, u32::MAX), None);
        assert_eq!(required_bytes(2, 2, 3), Some(8 * (3 * 6 + 12)));
    }
}
