//! Magnetometer hard-iron / soft-iron calibration.
//!
//! A calibration sweep (device rotated through all orientations) is reduced to
//! a per-axis offset (centre of the min/max box) and a per-axis scale that
//! equalizes the box edges to their mean length.

use crate::domain::error::{BridgeError, BridgeResult};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAG_COLUMNS: [&str; 3] = ["mag_x", "mag_y", "mag_z"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationModel {
    pub offset: [f64; 3],
    pub scale: [f64; 3],
}

impl CalibrationModel {
    pub const fn identity() -> Self {
        Self {
            offset: [0.0; 3],
            scale: [1.0; 3],
        }
    }

    /// `(raw - offset) * scale`, per axis
    pub fn apply(&self, raw: [f64; 3]) -> [f64; 3] {
        [
            (raw[0] - self.offset[0]) * self.scale[0],
            (raw[1] - self.offset[1]) * self.scale[1],
            (raw[2] - self.offset[2]) * self.scale[2],
        ]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self::identity()
    }
}

/// Accumulates the min/max box of a calibration sweep.
#[derive(Debug, Clone, Default)]
pub struct MagnetometerCalibrator {
    min: [f64; 3],
    max: [f64; 3],
    count: usize,
}

impl MagnetometerCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: [f64; 3]) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            for axis in 0..3 {
                self.min[axis] = self.min[axis].min(sample[axis]);
                self.max[axis] = self.max[axis].max(sample[axis]);
            }
        }
        self.count += 1;
    }

    pub fn sample_count(&self) -> usize {
        self.count
    }

    /// Compute the model, or `None` when no samples were seen.
    pub fn finish(&self) -> Option<CalibrationModel> {
        if self.count == 0 {
            return None;
        }

        let mut offset = [0.0; 3];
        let mut range = [0.0; 3];
        for axis in 0..3 {
            offset[axis] = (self.max[axis] + self.min[axis]) / 2.0;
            range[axis] = self.max[axis] - self.min[axis];
        }

        let avg_range = range.iter().sum::<f64>() / 3.0;
        let mut scale = [1.0; 3];
        for axis in 0..3 {
            if range[axis] > 0.0 {
                scale[axis] = avg_range / range[axis];
            }
        }

        Some(CalibrationModel { offset, scale })
    }

    pub fn from_samples(samples: &[[f64; 3]]) -> Option<CalibrationModel> {
        let mut calibrator = Self::new();
        for sample in samples {
            calibrator.add_sample(*sample);
        }
        calibrator.finish()
    }
}

/// `<dir>/<device name> Calibration.csv`
pub fn calibration_path(dir: &Path, device_name: &str) -> PathBuf {
    dir.join(format!("{} Calibration.csv", device_name))
}

/// Load the calibration sweep recorded for a device.
///
/// A missing file is reported as `CalibrationMissing`; callers fall back to
/// [`CalibrationModel::identity`].
pub fn load_calibration(dir: &Path, device_name: &str) -> BridgeResult<CalibrationModel> {
    let path = calibration_path(dir, device_name);
    if !path.exists() {
        return Err(BridgeError::CalibrationMissing(path.display().to_string()));
    }

    info!("Loading magnetometer calibration from: {}", path.display());
    let contents = fs::read_to_string(&path)?;
    let samples = parse_calibration_csv(&contents)?;
    let model = MagnetometerCalibrator::from_samples(&samples).ok_or_else(|| {
        BridgeError::CalibrationMissing(format!("{} has no samples", path.display()))
    })?;

    info!(
        "Hard-iron offsets: X={:.2}, Y={:.2}, Z={:.2}",
        model.offset[0], model.offset[1], model.offset[2]
    );
    info!(
        "Soft-iron scales: X={:.3}, Y={:.3}, Z={:.3} ({} samples)",
        model.scale[0],
        model.scale[1],
        model.scale[2],
        samples.len()
    );
    Ok(model)
}

/// Load a calibration, degrading to identity on any failure.
pub fn load_or_identity(dir: &Path, device_name: &str) -> CalibrationModel {
    match load_calibration(dir, device_name) {
        Ok(model) => model,
        Err(e) => {
            warn!("{}; using identity magnetometer calibration", e);
            CalibrationModel::identity()
        }
    }
}

/// Extract the mag_x/mag_y/mag_z columns of a calibration CSV.
pub fn parse_calibration_csv(contents: &str) -> BridgeResult<Vec<[f64; 3]>> {
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| BridgeError::protocol("Calibration file is empty"))?;
    let columns: Vec<&str> = header.split(',').map(|c| c.trim().trim_matches('"')).collect();

    let mut index = [0usize; 3];
    for (slot, name) in MAG_COLUMNS.iter().enumerate() {
        index[slot] = columns.iter().position(|c| c == name).ok_or_else(|| {
            BridgeError::protocol("Calibration file missing required magnetometer columns")
        })?;
    }

    let mut samples = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let mut sample = [0.0; 3];
        for axis in 0..3 {
            sample[axis] = fields
                .get(index[axis])
                .and_then(|f| f.parse::<f64>().ok())
                .ok_or_else(|| {
                    BridgeError::protocol(format!(
                        "Invalid {} value on data line {}",
                        MAG_COLUMNS[axis],
                        line_no + 1
                    ))
                })?;
        }
        samples.push(sample);
    }

    Ok(samples)
}

/// Reduce a calibration sweep to about `target` samples.
///
/// Keeps the per-axis extremes (so the resulting model is unchanged), evenly
/// spaced samples, and samples spread over the distance from the box centre.
/// Returned samples keep their original order.
pub fn trim_samples(samples: &[[f64; 3]], target: usize) -> Vec<[f64; 3]> {
    if samples.len() <= target || target == 0 {
        return samples.to_vec();
    }

    let mut extremes = BTreeSet::new();
    for axis in 0..3 {
        let by_axis = |a: &&(usize, &[f64; 3]), b: &&(usize, &[f64; 3])| {
            a.1[axis].total_cmp(&b.1[axis])
        };
        let indexed: Vec<(usize, &[f64; 3])> = samples.iter().enumerate().collect();
        if let Some((i, _)) = indexed.iter().min_by(by_axis) {
            extremes.insert(*i);
        }
        if let Some((i, _)) = indexed.iter().max_by(by_axis) {
            extremes.insert(*i);
        }
    }

    let mut others = BTreeSet::new();
    let interval = (samples.len() / target.saturating_sub(20).max(1)).max(1);
    for i in (0..samples.len()).step_by(interval) {
        others.insert(i);
    }

    if let Some(model) = MagnetometerCalibrator::from_samples(samples) {
        let centre = model.offset;
        let mut by_distance: Vec<(usize, f64)> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let d = (0..3).map(|a| (s[a] - centre[a]).powi(2)).sum::<f64>();
                (i, d.sqrt())
            })
            .collect();
        by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));
        let step = (by_distance.len() / 50).max(1);
        for (i, _) in by_distance.iter().step_by(step) {
            others.insert(*i);
        }
    }

    let room = target.saturating_sub(extremes.len());
    let mut keep: BTreeSet<usize> = extremes.clone();
    keep.extend(others.difference(&extremes).take(room));
    keep.into_iter().map(|i| samples[i]).collect()
}
