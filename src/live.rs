//! Image-per-trigger live streaming
//!
//! One producer pulls camera frames and one consumer integrates each frame through a virtual
//! annular detector into a single image pixel. The queue between them is bounded and the
//! producer only ever waits `enqueue_timeout` for space; frames that miss it are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use log::{debug, info, warn};
use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::reassembly::{pixel_offset, ReconstructedImage};
use crate::types::{parse_numeric_field, ScanGrid, ScanScheme};

pub const IMAGE_SIZE_X: &str = "Image Size X";
pub const IMAGE_SIZE_Y: &str = "Image Size Y";
pub const FRAMES_PER_SECOND: &str = "Frames Per Second";

/// Property and frame access on the pixelated camera
pub trait CameraClient: Send {
    fn property(&mut self, key: &str) -> Result<String, ScanError>;

    fn set_property(&mut self, key: &str, value: &str) -> Result<(), ScanError>;

    /// Next frame as a flat row-major intensity buffer
    fn fetch_image(&mut self) -> Result<Vec<u16>, ScanError>;
}

/// Camera frame size `(width, height)` as reported by the camera
pub fn image_dimensions<C: CameraClient + ?Sized>(
    camera: &mut C,
) -> Result<(usize, usize), ScanError> {
    let width = parse_numeric_field(IMAGE_SIZE_X, &camera.property(IMAGE_SIZE_X)?)?;
    let height = parse_numeric_field(IMAGE_SIZE_Y, &camera.property(IMAGE_SIZE_Y)?)?;
    Ok((width, height))
}

/// One camera frame tagged with its beam position in traversal order
#[derive(Debug, Clone)]
pub struct Frame {
    pub position: usize,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u16>,
}

/// Ring-shaped integration mask centred on the frame, radii as fractions of half the frame width
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnularDetector {
    pub inner: f64,
    pub outer: f64,
}

impl Default for AnnularDetector {
    fn default() -> Self {
        Self {
            inner: 0.5,
            outer: 0.9,
        }
    }
}

impl AnnularDetector {
    pub fn contains(&self, x: usize, y: usize, width: usize, height: usize) -> bool {
        let cx = (width as f64 - 1.0) / 2.0;
        let cy = (height as f64 - 1.0) / 2.0;
        let half = width.min(height) as f64 / 2.0;
        let r = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt() / half;
        r >= self.inner && r <= self.outer
    }

    /// Summed intensity inside the ring
    pub fn integrate(&self, frame: &Frame) -> f64 {
        frame
            .pixels
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                self.contains(i % frame.width, i / frame.width, frame.width, frame.height)
            })
            .map(|(_, &v)| v as f64)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StreamStats {
    pub produced: usize,
    pub consumed: usize,
    pub dropped: usize,
    pub peak_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub frame_rate: f64,
    pub detector: AnnularDetector,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            enqueue_timeout_ms: 100,
            frame_rate: 1000.0,
            detector: AnnularDetector::default(),
        }
    }
}

impl LiveSettings {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

fn produce<C: CameraClient + ?Sized>(
    camera: &mut C,
    frame_size: (usize, usize),
    frame_count: usize,
    tx: Sender<Frame>,
    timeout: Duration,
    stats: &Mutex<StreamStats>,
    abort: &AtomicBool,
) -> Result<(), ScanError> {
    let (width, height) = frame_size;
    for position in 0..frame_count {
        if abort.load(Ordering::SeqCst) {
            warn!("Live stream stopped after {position} frames");
            break;
        }

        let pixels = camera.fetch_image()?;
        if pixels.len() != width * height {
            return Err(ScanError::Acquisition(format!(
                "Frame {} has {} pixels, expected {} x {}",
                position,
                pixels.len(),
                width,
                height
            )));
        }

        let frame = Frame {
            position,
            width,
            height,
            pixels,
        };
        match tx.send_timeout(frame, timeout) {
            Ok(()) => {
                // The frame just sent counts even if the consumer already took it
                let depth = tx.len().max(1);
                let mut stats = stats.lock();
                stats.produced += 1;
                stats.peak_depth = stats.peak_depth.max(depth);
            }
            Err(SendTimeoutError::Timeout(frame)) => {
                stats.lock().dropped += 1;
                debug!("Dropped frame {} after {:?}", frame.position, timeout);
            }
            Err(SendTimeoutError::Disconnected(_)) => break,
        }
    }
    Ok(())
}

fn consume(
    rx: Receiver<Frame>,
    grid: &ScanGrid,
    detector: &AnnularDetector,
    stats: &Mutex<StreamStats>,
) -> Vec<f64> {
    let mut image = vec![0.0; grid.pixel_count()];
    for frame in rx {
        image[pixel_offset(frame.position, grid.width, grid.scheme)] = detector.integrate(&frame);
        stats.lock().consumed += 1;
    }
    image
}

/// Stream one camera frame per beam position and build a virtual-detector image
///
/// # Arguments
/// * `camera` - Camera already armed for external triggering
/// * `grid` - Beam positions; one frame is fetched per position
/// * `settings` - Queue bounds and detector geometry
/// * `abort` - Stops the producer before its next fetch
pub fn run_live<C: CameraClient + ?Sized>(
    camera: &mut C,
    grid: &ScanGrid,
    settings: &LiveSettings,
    abort: &AtomicBool,
) -> Result<(ReconstructedImage, StreamStats), ScanError> {
    if settings.queue_capacity == 0 {
        return Err(ScanError::InvalidInput(
            "Live queue capacity must be at least 1".to_string(),
        ));
    }
    let frame_size = image_dimensions(camera)?;
    camera.set_property(FRAMES_PER_SECOND, &settings.frame_rate.to_string())?;
    info!(
        "Live streaming {} frames of {} x {}",
        grid.pixel_count(),
        frame_size.0,
        frame_size.1
    );

    let stats = Mutex::new(StreamStats::default());
    let (tx, rx) = bounded(settings.queue_capacity);

    let (produced, image) = thread::scope(|s| {
        let consumer = s.spawn(|| consume(rx, grid, &settings.detector, &stats));
        let produced = produce(
            camera,
            frame_size,
            grid.pixel_count(),
            tx,
            settings.enqueue_timeout(),
            &stats,
            abort,
        );
        (produced, consumer.join())
    });
    produced?;
    let image = image.map_err(|_| ScanError::Acquisition("Frame consumer panicked".to_string()))?;

    let stats = stats.into_inner();
    if stats.dropped > 0 {
        warn!("{} frame(s) dropped, peak queue depth {}", stats.dropped, stats.peak_depth);
    }

    let pixels = Array2::from_shape_vec((grid.height, grid.width), image)
        .map_err(|e| ScanError::InvalidInput(format!("Image shape mismatch: {e}")))?;
    Ok((ReconstructedImage::from_array(pixels), stats))
}

/// Camera stand-in whose ring intensity follows a specimen along the beam path
pub struct SimulatedCamera {
    properties: HashMap<String, String>,
    specimen: Array2<f64>,
    scheme: ScanScheme,
    frame_width: usize,
    frame_height: usize,
    detector: AnnularDetector,
    next: usize,
}

impl SimulatedCamera {
    pub fn new(
        specimen: Array2<f64>,
        scheme: ScanScheme,
        frame_width: usize,
        frame_height: usize,
    ) -> Self {
        let properties = HashMap::from([
            (IMAGE_SIZE_X.to_string(), frame_width.to_string()),
            (IMAGE_SIZE_Y.to_string(), frame_height.to_string()),
        ]);
        Self {
            properties,
            specimen,
            scheme,
            frame_width,
            frame_height,
            detector: AnnularDetector::default(),
            next: 0,
        }
    }
}

impl CameraClient for SimulatedCamera {
    fn property(&mut self, key: &str) -> Result<String, ScanError> {
        self.properties
            .get(key)
            .cloned()
            .ok_or_else(|| ScanError::Acquisition(format!("Unknown camera property '{key}'")))
    }

    fn set_property(&mut self, key: &str, value: &str) -> Result<(), ScanError> {
        self.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn fetch_image(&mut self) -> Result<Vec<u16>, ScanError> {
        let (rows, cols) = self.specimen.dim();
        let cursor = self.next % (rows * cols);
        self.next += 1;

        let row = cursor / cols;
        let mut col = cursor % cols;
        if self.scheme == ScanScheme::Serpentine && row % 2 == 1 {
            col = cols - 1 - col;
        }
        let scattered = (self.specimen[[row, col]] * 100.0)
            .round()
            .clamp(0.0, u16::MAX as f64) as u16;

        let (w, h) = (self.frame_width, self.frame_height);
        Ok((0..w * h)
            .map(|i| {
                if self.detector.contains(i % w, i / w, w, h) {
                    scattered
                } else {
                    // Bright-field disk and vacuum stay constant
                    1000
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MislabelledCamera;

    impl CameraClient for MislabelledCamera {
        fn property(&mut self, key: &str) -> Result<String, ScanError> {
            Ok(match key {
                IMAGE_SIZE_X => "4".to_string(),
                _ => "four".to_string(),
            })
        }

        fn set_property(&mut self, _key: &str, _value: &str) -> Result<(), ScanError> {
            Ok(())
        }

        fn fetch_image(&mut self) -> Result<Vec<u16>, ScanError> {
            Ok(vec![1; 16])
        }
    }

    #[test]
    fn test_image_dimensions_rejects_non_numeric() {
        let mut camera = MislabelledCamera;
        assert!(matches!(
            image_dimensions(&mut camera),
            Err(ScanError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_annular_detector_mask() {
        let detector = AnnularDetector::default();
        // Centre of an 8 x 8 frame is inside the bright-field disk
        assert!(!detector.contains(4, 4, 8, 8));
        assert!(detector.contains(0, 4, 8, 8) || detector.contains(1, 4, 8, 8));
        assert!(!detector.contains(0, 0, 8, 8));
    }

    #[test]
    fn test_producer_drops_when_queue_full() {
        let specimen = Array2::from_elem((2, 2), 1.0);
        let mut camera = SimulatedCamera::new(specimen, ScanScheme::Conventional, 8, 8);
        let stats = Mutex::new(StreamStats::default());
        let abort = AtomicBool::new(false);
        let (tx, rx) = bounded(1);

        produce(&mut camera, (8, 8), 4, tx, Duration::from_millis(5), &stats, &abort).unwrap();

        let stats = stats.into_inner();
        assert_eq!(stats.produced, 1);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.peak_depth, 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_producer_honours_abort() {
        let specimen = Array2::from_elem((2, 2), 1.0);
        let mut camera = SimulatedCamera::new(specimen, ScanScheme::Conventional, 4, 4);
        let stats = Mutex::new(StreamStats::default());
        let abort = AtomicBool::new(true);
        let (tx, _rx) = bounded(4);
        produce(&mut camera, (4, 4), 4, tx, Duration::from_millis(5), &stats, &abort).unwrap();
        assert_eq!(stats.lock().produced, 0);
    }

    #[test]
    fn test_run_live_recovers_specimen() {
        let specimen = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c + 1) as f64);
        let grid = ScanGrid::new(4, 3, ScanScheme::Serpentine);
        let mut camera = SimulatedCamera::new(specimen.clone(), ScanScheme::Serpentine, 16, 16);
        let settings = LiveSettings {
            enqueue_timeout_ms: 5_000,
            ..Default::default()
        };

        let (image, stats) =
            run_live(&mut camera, &grid, &settings, &AtomicBool::new(false)).unwrap();

        assert_eq!(stats.produced, 12);
        assert_eq!(stats.consumed, 12);
        assert_eq!(stats.dropped, 0);
        assert!(stats.peak_depth >= 1 && stats.peak_depth <= settings.queue_capacity);

        // Ring sum is proportional to the specimen value
        let unit = image.pixels()[[0, 0]] / specimen[[0, 0]];
        for (got, want) in image.pixels().iter().zip(specimen.iter()) {
            assert!((got / unit - want).abs() < 1e-9);
        }
        assert_eq!(camera.property(FRAMES_PER_SECOND).unwrap(), "1000");
    }
}
