use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::types::{ScanGrid, ScanRegion, ScanScheme, VoltageRange};

/// Absorbs round-off when deriving the slow-axis count from a region's aspect ratio
const COUNT_EPSILON: f64 = 1e-9;

/// Voltage table of one deflection axis together with its traversal order
///
/// The table is addressed through the index array so that a return stroke can replay
/// the same voltages backwards without a mirrored copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanAxisPlan {
    voltages: Vec<f64>,
    indices: Vec<usize>,
}

impl ScanAxisPlan {
    /// Build a plan, rejecting indices that fall outside the voltage table
    pub fn new(voltages: Vec<f64>, indices: Vec<usize>) -> Result<Self, ScanError> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= voltages.len()) {
            return Err(ScanError::InvalidInput(format!(
                "Index {} is outside a voltage table of {} entries",
                bad,
                voltages.len()
            )));
        }
        Ok(Self { voltages, indices })
    }

    fn identity(voltages: Vec<f64>) -> Self {
        let indices = (0..voltages.len()).collect();
        Self { voltages, indices }
    }

    pub fn voltages(&self) -> &[f64] {
        &self.voltages
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of positions in traversal order
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// `(index, voltage)` pairs in traversal order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (usize, f64)> + '_ {
        self.indices.iter().map(|&i| (i, self.voltages[i]))
    }
}

/// `count` equally spaced voltages from `range.low` to `range.high` inclusive
pub fn linspace(range: &VoltageRange, count: usize) -> Result<Vec<f64>, ScanError> {
    if count < 2 {
        return Err(ScanError::InvalidInput(format!(
            "An axis needs at least 2 positions, got {count}"
        )));
    }
    let step = range.span() / (count - 1) as f64;
    Ok((0..count).map(|i| range.low + i as f64 * step).collect())
}

/// Expand a scan grid into fast (X) and slow (Y) axis plans
///
/// # Arguments
/// * `grid` - Positions per axis and the row topology
/// * `range` - Deflection range shared by both axes
/// * `guard_voltage` - Slow-axis parking value for serpentine scans
pub fn generate(
    grid: &ScanGrid,
    range: &VoltageRange,
    guard_voltage: f64,
) -> Result<(ScanAxisPlan, ScanAxisPlan), ScanError> {
    range.validate()?;
    let fast = linspace(range, grid.width)?;
    let slow = linspace(range, grid.height)?;
    Ok(build_plans(fast, slow, grid.scheme, guard_voltage))
}

/// Expand a rectangular region of interest with square pixels
///
/// The slow-axis step is forced to the fast-axis step, so the row count follows from the
/// region's aspect ratio instead of being requested.
pub fn generate_region(
    region: &ScanRegion,
    width: usize,
    scheme: ScanScheme,
    guard_voltage: f64,
) -> Result<(ScanGrid, ScanAxisPlan, ScanAxisPlan), ScanError> {
    region.x.validate()?;
    region.y.validate()?;

    let fast = linspace(&region.x, width)?;
    let step = region.x.span() / (width - 1) as f64;
    let height = (region.y.span() / step + 1.0 + COUNT_EPSILON).floor() as usize;
    if height < 2 {
        return Err(ScanError::InvalidInput(format!(
            "Region of {:.4} x {:.4} is too flat for {} columns",
            region.x.span(),
            region.y.span(),
            width
        )));
    }
    let slow = (0..height)
        .map(|i| region.y.low + i as f64 * step)
        .collect();

    debug!("Region scan derived {width} x {height} positions with step {step:.6}");

    let grid = ScanGrid::new(width, height, scheme);
    let (x, y) = build_plans(fast, slow, scheme, guard_voltage);
    Ok((grid, x, y))
}

fn build_plans(
    fast: Vec<f64>,
    mut slow: Vec<f64>,
    scheme: ScanScheme,
    guard_voltage: f64,
) -> (ScanAxisPlan, ScanAxisPlan) {
    match scheme {
        ScanScheme::Conventional => (ScanAxisPlan::identity(fast), ScanAxisPlan::identity(slow)),
        ScanScheme::Serpentine => {
            let width = fast.len();
            let fast_indices = (0..width).chain((0..width).rev()).collect();

            // Park one step before the first row and two after the last
            let guard = slow.len();
            slow.push(guard_voltage);
            let slow_indices = std::iter::once(guard)
                .chain(0..guard)
                .chain([guard, guard])
                .collect();

            (
                ScanAxisPlan {
                    voltages: fast,
                    indices: fast_indices,
                },
                ScanAxisPlan {
                    voltages: slow,
                    indices: slow_indices,
                },
            )
        }
    }
}
