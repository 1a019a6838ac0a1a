use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ScanError;

/// Output channels of the scan waveform generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    BeamX,
    BeamY,
    CameraTrigger,
    DigitizerTrigger,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::BeamX,
        Channel::BeamY,
        Channel::CameraTrigger,
        Channel::DigitizerTrigger,
    ];

    /// Front-panel channel number (1-based)
    pub fn number(self) -> u8 {
        match self {
            Channel::BeamX => 1,
            Channel::BeamY => 2,
            Channel::CameraTrigger => 3,
            Channel::DigitizerTrigger => 4,
        }
    }

    /// On-board waveform memory slot used for this channel
    pub fn slot(self) -> u8 {
        self.number() - 1
    }

    pub fn mask_bit(self) -> u8 {
        1 << self.slot()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::BeamX => "beam-X",
            Channel::BeamY => "beam-Y",
            Channel::CameraTrigger => "camera trigger",
            Channel::DigitizerTrigger => "digitizer trigger",
        };
        write!(f, "{} (ch{})", name, self.number())
    }
}

impl TryFrom<u8> for Channel {
    type Error = ScanError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Channel::BeamX),
            2 => Ok(Channel::BeamY),
            3 => Ok(Channel::CameraTrigger),
            4 => Ok(Channel::DigitizerTrigger),
            _ => Err(ScanError::InvalidInput(format!(
                "Invalid channel number: {value}"
            ))),
        }
    }
}

/// Bit mask selecting channels for a synchronous start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelMask(pub u8);

impl ChannelMask {
    pub fn all() -> Self {
        Self(Channel::ALL.iter().fold(0, |mask, ch| mask | ch.mask_bit()))
    }

    pub fn without(self, channel: Channel) -> Self {
        Self(self.0 & !channel.mask_bit())
    }

    pub fn contains(self, channel: Channel) -> bool {
        self.0 & channel.mask_bit() != 0
    }
}

/// How a queued waveform waits for its start condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Start immediately once the channel is started
    Auto = 0,
    /// Wait for the external trigger input
    External = 1,
}

/// Output function of a generator channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveShape {
    /// Output held at zero
    Off,
    Arbitrary,
}

/// Row topology of a raster scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanScheme {
    /// Every row runs in the same direction, with flyback between rows
    #[default]
    Conventional,
    /// Alternating row direction with guard parking on the slow axis
    Serpentine,
}

/// Whether the camera takes a frame per beam position or only the detector signal is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Camera frame per beam position plus detector signal
    #[default]
    FourD,
    /// Detector signal only; the camera trigger channel stays idle
    TwoD,
}

impl AcquisitionMode {
    pub fn start_mask(self) -> ChannelMask {
        match self {
            AcquisitionMode::FourD => ChannelMask::all(),
            AcquisitionMode::TwoD => ChannelMask::all().without(Channel::CameraTrigger),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanGrid {
    pub width: usize,
    pub height: usize,
    pub scheme: ScanScheme,
}

impl ScanGrid {
    pub fn new(width: usize, height: usize, scheme: ScanScheme) -> Self {
        Self {
            width,
            height,
            scheme,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Normalized deflection range, as a fraction of the channel amplitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub low: f64,
    pub high: f64,
}

impl VoltageRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn span(&self) -> f64 {
        self.high - self.low
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if !self.low.is_finite() || !self.high.is_finite() || self.low >= self.high {
            return Err(ScanError::InvalidInput(format!(
                "Voltage range [{}, {}] must be finite and increasing",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self::new(-0.5, 0.5)
    }
}

/// Rectangular region of interest on both deflection axes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRegion {
    pub x: VoltageRange,
    pub y: VoltageRange,
}

impl ScanRegion {
    pub fn new(x: VoltageRange, y: VoltageRange) -> Self {
        Self { x, y }
    }

    /// Map a rectangle drawn on a square preview of `display_px` pixels into the
    /// normalized deflection range [-0.5, 0.5]
    pub fn from_display(
        start: (f64, f64),
        end: (f64, f64),
        display_px: f64,
    ) -> Result<Self, ScanError> {
        if display_px <= 0.0 {
            return Err(ScanError::InvalidInput(format!(
                "Display size must be positive, got {display_px}"
            )));
        }
        let half = display_px / 2.0;
        let to_fraction = |px: f64| (px - half) / half / 2.0;

        let region = Self {
            x: VoltageRange::new(to_fraction(start.0), to_fraction(end.0)),
            y: VoltageRange::new(to_fraction(start.1), to_fraction(end.1)),
        };
        region.x.validate()?;
        region.y.validate()?;
        Ok(region)
    }
}

impl Default for ScanRegion {
    fn default() -> Self {
        Self::new(VoltageRange::default(), VoltageRange::default())
    }
}

/// Parse a user or instrument supplied text field into a number
pub fn parse_numeric_field<T>(field: &str, text: &str) -> Result<T, ScanError>
where
    T: FromStr,
{
    text.trim().parse::<T>().map_err(|_| {
        ScanError::InvalidInput(format!("{field} is not a valid number: '{text}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_numbering() {
        assert_eq!(Channel::BeamX.number(), 1);
        assert_eq!(Channel::DigitizerTrigger.slot(), 3);
        assert_eq!(Channel::try_from(3).unwrap(), Channel::CameraTrigger);
        assert!(Channel::try_from(5).is_err());
    }

    #[test]
    fn test_start_masks() {
        assert_eq!(AcquisitionMode::FourD.start_mask().0, 0b1111);
        assert_eq!(AcquisitionMode::TwoD.start_mask().0, 0b1011);
        assert!(!AcquisitionMode::TwoD
            .start_mask()
            .contains(Channel::CameraTrigger));
    }

    #[test]
    fn test_region_from_display() {
        let region = ScanRegion::from_display((0.0, 128.0), (512.0, 384.0), 512.0).unwrap();
        assert_eq!(region.x, VoltageRange::new(-0.5, 0.5));
        assert_eq!(region.y, VoltageRange::new(-0.25, 0.25));

        assert!(ScanRegion::from_display((300.0, 0.0), (100.0, 512.0), 512.0).is_err());
    }

    #[test]
    fn test_parse_numeric_field() {
        let width: usize = parse_numeric_field("Image Size X", " 1024 ").unwrap();
        assert_eq!(width, 1024);

        let result: Result<usize, _> = parse_numeric_field("Frame rate", "fast");
        assert!(matches!(result, Err(ScanError::InvalidInput(_))));
    }
}
