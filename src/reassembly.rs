//! Cross-clock image reassembly
//!
//! The detector is sampled on the digitizer clock while the beam steps on the generator
//! clock. Neither period is a multiple of the other, so samples are assigned to pixels by
//! running two time accumulators side by side. The sample that straddles a beam step is
//! dead time and is dropped.

use image::{ImageBuffer, Luma};
use log::{debug, info};
use ndarray::{Array2, ArrayView1};
use serde::Serialize;

use crate::digitizer::SampleStream;
use crate::error::ScanError;
use crate::types::{ScanGrid, ScanScheme};

/// Tolerance when comparing the two accumulated clocks
pub const CLOCK_EPSILON: f64 = 1e-10;

/// Counters from one reassembly pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReassemblyReport {
    pub pixels: usize,
    pub samples_used: usize,
    pub dead_time_discards: usize,
    /// Trailing samples after the last pixel
    pub unconsumed: usize,
}

/// Reassembled image, `height` rows by `width` columns
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedImage {
    pixels: Array2<f64>,
}

impl ReconstructedImage {
    pub fn from_array(pixels: Array2<f64>) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn pixels(&self) -> &Array2<f64> {
        &self.pixels
    }

    pub fn row(&self, row: usize) -> ArrayView1<'_, f64> {
        self.pixels.row(row)
    }

    /// Minimum and maximum intensity
    pub fn range(&self) -> Option<(f64, f64)> {
        self.pixels.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    /// Map intensities linearly from the image's own `[min, max]` onto `[floor, ceiling]`
    ///
    /// A flat image maps entirely to `floor`.
    pub fn rescaled(&self, floor: f64, ceiling: f64) -> Array2<f64> {
        match self.range() {
            Some((lo, hi)) if hi > lo => {
                let scale = (ceiling - floor) / (hi - lo);
                self.pixels.mapv(|v| floor + (v - lo) * scale)
            }
            _ => Array2::from_elem(self.pixels.dim(), floor),
        }
    }

    /// 16-bit grayscale rendering using the full output range
    pub fn to_luma16(&self) -> ImageBuffer<Luma<u16>, Vec<u16>> {
        let scaled = self.rescaled(0.0, u16::MAX as f64);
        ImageBuffer::from_fn(self.width() as u32, self.height() as u32, |x, y| {
            Luma([scaled[[y as usize, x as usize]].round() as u16])
        })
    }
}

/// Memory offset of the `cursor`-th pixel in traversal order
///
/// Serpentine scans play odd rows right to left, so those rows are written mirrored.
pub fn pixel_offset(cursor: usize, width: usize, scheme: ScanScheme) -> usize {
    let row = cursor / width;
    let col = cursor % width;
    match scheme {
        ScanScheme::Serpentine if row % 2 == 1 => width * (row + 1) - col - 1,
        _ => width * row + col,
    }
}

#[derive(Default)]
struct PendingMean {
    sum: f64,
    count: usize,
}

impl PendingMean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn take(&mut self) -> Option<f64> {
        let mean = (self.count > 0).then(|| self.sum / self.count as f64);
        *self = Self::default();
        mean
    }
}

/// Rebuild a pixel grid from a detector sample stream
///
/// # Arguments
/// * `stream` - Samples in acquisition order with their sample period
/// * `grid` - Image size and row topology
/// * `dwell_period` - Beam time per pixel (s); must be at least two sample periods
///
/// # Returns
/// The image plus counters, or `IncompleteStream` if the samples run out first
pub fn reassemble(
    stream: &SampleStream,
    grid: &ScanGrid,
    dwell_period: f64,
) -> Result<(ReconstructedImage, ReassemblyReport), ScanError> {
    let sample_period = stream.sample_period();
    if !(dwell_period.is_finite() && dwell_period > 0.0) {
        return Err(ScanError::InvalidInput(format!(
            "Dwell period must be positive, got {dwell_period}"
        )));
    }
    // Guarantees a kept sample between consecutive dead-time samples
    if dwell_period + CLOCK_EPSILON < 2.0 * sample_period {
        return Err(ScanError::InvalidInput(format!(
            "Dwell period {dwell_period:e} s is shorter than two samples of {sample_period:e} s"
        )));
    }
    let total = grid.pixel_count();
    if total == 0 {
        return Err(ScanError::InvalidInput("Scan grid is empty".to_string()));
    }

    let mut image = vec![0.0; total];
    let mut dwell_clock = dwell_period;
    let mut sample_clock = sample_period;
    let mut pending = PendingMean::default();
    let mut cursor = 0;
    let mut consumed = 0;
    let mut samples_used = 0;
    let mut discards = 0;

    for &value in stream.samples() {
        consumed += 1;

        if dwell_clock >= sample_clock - CLOCK_EPSILON {
            pending.push(value);
            samples_used += 1;
            sample_clock += sample_period;
            continue;
        }

        let average = pending.take().ok_or_else(|| {
            ScanError::InvalidInput(format!("Pixel {cursor} received no samples"))
        })?;
        dwell_clock += dwell_period;
        // The boundary sample straddles the beam step
        discards += 1;
        sample_clock += sample_period;

        image[pixel_offset(cursor, grid.width, grid.scheme)] = average;
        cursor += 1;
        if cursor == total {
            break;
        }
    }

    if cursor < total {
        return Err(ScanError::IncompleteStream {
            filled: cursor,
            expected: total,
        });
    }

    let report = ReassemblyReport {
        pixels: total,
        samples_used,
        dead_time_discards: discards,
        unconsumed: stream.len() - consumed,
    };
    debug!("Reassembly report: {report:?}");
    info!(
        "Reassembled {} x {} image from {} samples",
        grid.width, grid.height, consumed
    );

    let pixels = Array2::from_shape_vec((grid.height, grid.width), image)
        .map_err(|e| ScanError::InvalidInput(format!("Image shape mismatch: {e}")))?;
    Ok((ReconstructedImage::from_array(pixels), report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digitizer::{Digitizer, SimulatedDigitizer};
    use std::sync::atomic::AtomicBool;

    fn stream(samples: Vec<f64>, rate: u32) -> SampleStream {
        SampleStream::new(samples, rate).unwrap()
    }

    #[test]
    fn test_single_pixel_boundary() {
        let grid = ScanGrid::new(1, 1, ScanScheme::Conventional);
        let mut samples = vec![2.0; 10];
        samples.push(99.0);
        let (image, report) = reassemble(&stream(samples, 10_000), &grid, 1.05e-3).unwrap();

        assert_eq!(image.pixels()[[0, 0]], 2.0);
        assert_eq!(report.samples_used, 10);
        assert_eq!(report.dead_time_discards, 1);
        assert_eq!(report.unconsumed, 0);
    }

    #[test]
    fn test_trailing_samples_unconsumed() {
        let grid = ScanGrid::new(1, 1, ScanScheme::Conventional);
        let (_, report) = reassemble(&stream(vec![1.0; 20], 10_000), &grid, 1.05e-3).unwrap();
        assert_eq!(report.unconsumed, 9);
    }

    #[test]
    fn test_incomplete_stream() {
        let grid = ScanGrid::new(2, 2, ScanScheme::Conventional);
        let result = reassemble(&stream(vec![1.0; 15], 10_000), &grid, 1.05e-3);
        assert!(matches!(
            result,
            Err(ScanError::IncompleteStream {
                filled: 1,
                expected: 4
            })
        ));
    }

    #[test]
    fn test_rejects_dwell_shorter_than_two_samples() {
        let grid = ScanGrid::new(2, 2, ScanScheme::Conventional);
        let result = reassemble(&stream(vec![1.0; 100], 10_000), &grid, 1.5e-4);
        assert!(matches!(result, Err(ScanError::InvalidInput(_))));
    }

    #[test]
    fn test_pixel_offsets() {
        let conventional: Vec<_> = (0..6)
            .map(|c| pixel_offset(c, 3, ScanScheme::Conventional))
            .collect();
        assert_eq!(conventional, vec![0, 1, 2, 3, 4, 5]);

        let serpentine: Vec<_> = (0..6)
            .map(|c| pixel_offset(c, 3, ScanScheme::Serpentine))
            .collect();
        assert_eq!(serpentine, vec![0, 1, 2, 5, 4, 3]);
    }

    fn round_trip(scheme: ScanScheme) {
        let (width, height) = (7, 5);
        let specimen = Array2::from_shape_fn((height, width), |(r, c)| (r * width + c) as f64);
        let dwell = 1.05e-3;
        let rate = 7_000;

        let mut digitizer = SimulatedDigitizer::new(specimen.clone(), dwell, scheme);
        let count = crate::digitizer::record_size(width * height, 1.0 / dwell, rate, 1.1);
        let stream = digitizer.fetch(count, rate, &AtomicBool::new(false)).unwrap();

        let grid = ScanGrid::new(width, height, scheme);
        let (image, report) = reassemble(&stream, &grid, dwell).unwrap();

        for (got, want) in image.pixels().iter().zip(specimen.iter()) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
        assert_eq!(report.dead_time_discards, width * height);
    }

    #[test]
    fn test_round_trip_conventional() {
        round_trip(ScanScheme::Conventional);
    }

    #[test]
    fn test_round_trip_serpentine() {
        round_trip(ScanScheme::Serpentine);
    }

    #[test]
    fn test_rescale_and_luma() {
        let pixels = Array2::from_shape_vec((1, 3), vec![2.0, 4.0, 6.0]).unwrap();
        let image = ReconstructedImage::from_array(pixels);
        let scaled = image.rescaled(0.0, 1.0);
        assert_eq!(scaled.as_slice().unwrap(), &[0.0, 0.5, 1.0]);

        let luma = image.to_luma16();
        assert_eq!(luma.dimensions(), (3, 1));
        assert_eq!(luma.get_pixel(0, 0).0[0], 0);
        assert_eq!(luma.get_pixel(2, 0).0[0], u16::MAX);
    }

    #[test]
    fn test_flat_image_maps_to_floor() {
        let image = ReconstructedImage::from_array(Array2::from_elem((2, 2), 5.0));
        assert!(image.rescaled(10.0, 20.0).iter().all(|&v| v == 10.0));
    }
}
