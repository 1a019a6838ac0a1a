use textplots::{Chart, Plot, Shape};

use crate::error::ScanError;
use crate::reassembly::ReconstructedImage;

/// Pick a display prefix for a trace with the given peak magnitude
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 {
        (1.0, "")
    } else if max_value >= 1e-3 {
        (1e3, "m")
    } else if max_value >= 1e-6 {
        (1e6, "μ")
    } else {
        (1e9, "n")
    }
}

/// Thin a long trace to at most `max_points` by averaging consecutive blocks
fn decimate(values: &[f64], max_points: usize) -> Vec<(f32, f32)> {
    let block = values.len().div_ceil(max_points.max(1)).max(1);
    values
        .chunks(block)
        .enumerate()
        .map(|(i, chunk)| {
            let mean = chunk.iter().sum::<f64>() / chunk.len() as f64;
            ((i * block) as f32, mean as f32)
        })
        .collect()
}

/// Render a detector trace in the terminal
///
/// # Arguments
/// * `values` - Raw samples (V)
/// * `title` - Heading printed above the chart
/// * `width` - Chart width in characters (default: 140)
/// * `height` - Chart height in characters (default: 40)
pub fn plot_trace(
    values: &[f64],
    title: &str,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<(), ScanError> {
    if values.is_empty() {
        return Err(ScanError::InvalidInput("Cannot plot an empty trace".to_string()));
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(40);

    let min_value = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_value = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let (scale, unit) = determine_scale(max_value.abs().max(min_value.abs()));

    let points: Vec<(f32, f32)> = decimate(values, width as usize * 2)
        .into_iter()
        .map(|(x, y)| (x, y * scale as f32))
        .collect();

    println!("{title}");
    println!(
        "{} samples | {:.3} to {:.3} {}V",
        values.len(),
        min_value * scale,
        max_value * scale,
        unit
    );
    println!("{}", "─".repeat(width as usize));

    Chart::new(width, height, 0.0, (values.len() - 1).max(1) as f32)
        .lineplot(&Shape::Lines(&points))
        .nice();

    println!("Sample index →");
    Ok(())
}

/// Render one image row as a line profile
pub fn plot_row_profile(image: &ReconstructedImage, row: usize) -> Result<(), ScanError> {
    if row >= image.height() {
        return Err(ScanError::InvalidInput(format!(
            "Row {} is outside an image of {} rows",
            row,
            image.height()
        )));
    }
    let profile: Vec<f64> = image.row(row).to_vec();
    plot_trace(&profile, &format!("Row {row} profile"), Some(100), Some(30))
}
