//! IMU orientation pipeline
//!
//! Turns raw IMU Data records into smoothed roll/pitch/yaw:
//! calibration, unit scaling, axis remap, gyro noise floor, magnetometer
//! validation, Kalman fusion and yaw-safe smoothing.

use crate::domain::calibration::CalibrationModel;
use crate::domain::ekf::{quaternion_to_euler, QuaternionEkf};
use crate::domain::models::{OrientationEstimate, RawImuRecord};
use crate::domain::settings::FilterSettings;
use tracing::{debug, info, trace, warn};

/// Raw counts to g (±16 g full scale)
pub const ACCEL_SCALE: f64 = 32.0 / 65536.0;
/// Raw counts to deg/s (±2000 deg/s full scale)
pub const GYRO_SCALE: f64 = 4000.0 / 65536.0;
/// Raw counts to gauss (±50 gauss full scale)
pub const MAG_SCALE: f64 = 100.0 / 65536.0;

pub const STANDARD_GRAVITY: f64 = 9.80665;
pub const GAUSS_TO_MICROTESLA: f64 = 100.0;

/// Gyro readings below this magnitude (deg/s) are treated as zero.
pub const GYRO_NOISE_FLOOR_DPS: f64 = 5.0;
pub const MAG_MIN_NORM_GAUSS: f64 = 0.01;
pub const MAG_MAX_JUMP_GAUSS: f64 = 2.0;

const SUMMARY_INTERVAL: u64 = 30_000;

/// Permutation + sign table from the sensor frame to the output frame.
///
/// Output axis `i` is `sign[i] * input[source[i]]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMap {
    pub source: [usize; 3],
    pub sign: [f64; 3],
}

impl AxisMap {
    pub fn apply(&self, v: [f64; 3]) -> [f64; 3] {
        [
            self.sign[0] * v[self.source[0]],
            self.sign[1] * v[self.source[1]],
            self.sign[2] * v[self.source[2]],
        ]
    }
}

/// x forward, y and z flipped
pub const ACCEL_MAP: AxisMap = AxisMap {
    source: [0, 1, 2],
    sign: [1.0, -1.0, -1.0],
};
pub const GYRO_MAP: AxisMap = AxisMap {
    source: [0, 1, 2],
    sign: [1.0, -1.0, -1.0],
};
/// The magnetometer die is rotated 90 degrees against the accel/gyro die.
pub const MAG_MAP: AxisMap = AxisMap {
    source: [1, 0, 2],
    sign: [1.0, -1.0, -1.0],
};

/// Wrap an angle in degrees into [0, 360).
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Exponential smoothing of Euler angles.
///
/// Yaw is blended along the shortest arc so that 359 -> 2 moves forward
/// through 0 instead of sweeping back through 180.
#[derive(Debug, Clone)]
pub struct AngleSmoother {
    alpha: f64,
    previous: Option<(f64, f64, f64)>,
}

impl AngleSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            previous: None,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Returns smoothed (roll, pitch, yaw). Yaw input must be in [0, 360).
    pub fn apply(&mut self, roll: f64, pitch: f64, yaw: f64) -> (f64, f64, f64) {
        let smoothed = match self.previous {
            None => (roll, pitch, yaw),
            Some((prev_roll, prev_pitch, prev_yaw)) => {
                let a = self.alpha;
                let delta = (yaw - prev_yaw + 180.0).rem_euclid(360.0) - 180.0;
                (
                    a * roll + (1.0 - a) * prev_roll,
                    a * pitch + (1.0 - a) * prev_pitch,
                    wrap_degrees(prev_yaw + a * delta),
                )
            }
        };
        self.previous = Some(smoothed);
        smoothed
    }
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn scale(v: [i16; 3], factor: f64) -> [f64; 3] {
    [v[0] as f64 * factor, v[1] as f64 * factor, v[2] as f64 * factor]
}

/// Sensor-frame IMU values in physical units, before remapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledImu {
    /// g
    pub accel: [f64; 3],
    /// deg/s
    pub gyro: [f64; 3],
    /// gauss, calibrated
    pub mag: [f64; 3],
}

impl ScaledImu {
    pub fn from_record(record: &RawImuRecord, calibration: &CalibrationModel) -> Self {
        let mag_raw = [
            record.mag[0] as f64,
            record.mag[1] as f64,
            record.mag[2] as f64,
        ];
        let mag_cal = calibration.apply(mag_raw);
        Self {
            accel: scale(record.accel, ACCEL_SCALE),
            gyro: scale(record.gyro, GYRO_SCALE),
            mag: [
                mag_cal[0] * MAG_SCALE,
                mag_cal[1] * MAG_SCALE,
                mag_cal[2] * MAG_SCALE,
            ],
        }
    }
}

/// Orientation estimator for one connected device.
///
/// Owned by the device loop; reset on every (re)connect.
pub struct OrientationEstimator {
    ekf: QuaternionEkf,
    filter: FilterSettings,
    calibration: CalibrationModel,
    smoother: AngleSmoother,
    previous_mag: Option<[f64; 3]>,
    sample_rate_hz: u32,
    records: u64,
    mag_rejections: u64,
}

impl OrientationEstimator {
    pub fn new(sample_rate_hz: u32, filter: FilterSettings, smoothing_alpha: f64) -> Self {
        let rate = sample_rate_hz.max(1);
        Self {
            ekf: QuaternionEkf::new(rate as f64, filter.var_acc, filter.var_gyro, filter.var_mag),
            filter,
            calibration: CalibrationModel::identity(),
            smoother: AngleSmoother::new(smoothing_alpha),
            previous_mag: None,
            sample_rate_hz: rate,
            records: 0,
            mag_rejections: 0,
        }
    }

    /// Forget all state from a previous connection.
    pub fn reset(&mut self) {
        self.ekf = QuaternionEkf::new(
            self.sample_rate_hz as f64,
            self.filter.var_acc,
            self.filter.var_gyro,
            self.filter.var_mag,
        );
        self.smoother.reset();
        self.previous_mag = None;
        self.records = 0;
        self.mag_rejections = 0;
    }

    pub fn set_calibration(&mut self, calibration: CalibrationModel) {
        self.calibration = calibration;
    }

    pub fn calibration(&self) -> &CalibrationModel {
        &self.calibration
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    /// Match the filter's time step to the device's IMU Sample Rate.
    pub fn set_sample_rate(&mut self, sample_rate_hz: u32) {
        if sample_rate_hz == 0 {
            warn!("Ignoring IMU sample rate of 0 Hz");
            return;
        }
        if sample_rate_hz == self.sample_rate_hz {
            return;
        }
        info!(
            "Reconfiguring orientation filter: {} Hz -> {} Hz",
            self.ekf.frequency(),
            sample_rate_hz
        );
        self.sample_rate_hz = sample_rate_hz;
        self.ekf.set_frequency(sample_rate_hz as f64);
    }

    pub fn records_processed(&self) -> u64 {
        self.records
    }

    pub fn mag_rejections(&self) -> u64 {
        self.mag_rejections
    }

    /// Run one record through the pipeline.
    pub fn process(&mut self, record: &RawImuRecord) -> OrientationEstimate {
        let scaled = ScaledImu::from_record(record, &self.calibration);

        let accel = ACCEL_MAP.apply(scaled.accel);
        let mut gyro = GYRO_MAP.apply(scaled.gyro);
        let mag = MAG_MAP.apply(scaled.mag);

        for value in gyro.iter_mut() {
            if value.abs() < GYRO_NOISE_FLOOR_DPS {
                *value = 0.0;
            }
        }

        let mag_ok = self.validate_mag(mag);

        let acc_si = accel.map(|v| v * STANDARD_GRAVITY);
        let gyr_si = gyro.map(f64::to_radians);
        let mag_si = mag_ok.then(|| mag.map(|v| v * GAUSS_TO_MICROTESLA));

        let quaternion = self.ekf.update(gyr_si, acc_si, mag_si);
        let (roll, pitch, yaw) = quaternion_to_euler(quaternion);
        let (roll, pitch, yaw) = self.smoother.apply(roll, pitch, wrap_degrees(yaw));

        self.records += 1;
        trace!(
            "IMU {} roll={:.2} pitch={:.2} yaw={:.2} mag={}",
            record.sample,
            roll,
            pitch,
            yaw,
            mag_ok
        );
        if self.records % SUMMARY_INTERVAL == 0 {
            info!(
                "Orientation after {} records: roll={:.1} pitch={:.1} yaw={:.1} ({} mag rejections)",
                self.records, roll, pitch, yaw, self.mag_rejections
            );
        }

        OrientationEstimate {
            quaternion,
            roll,
            pitch,
            yaw,
            uncertainty: Some(self.ekf.covariance_trace()),
            mag_fused: mag_ok,
        }
    }

    fn validate_mag(&mut self, mag: [f64; 3]) -> bool {
        if norm(mag) < MAG_MIN_NORM_GAUSS {
            self.mag_rejections += 1;
            return false;
        }
        if let Some(prev) = self.previous_mag {
            let jump = norm([mag[0] - prev[0], mag[1] - prev[1], mag[2] - prev[2]]);
            if jump > MAG_MAX_JUMP_GAUSS {
                debug!("Magnetometer disturbance ({:.2} gauss), 6-DOF update", jump);
                self.mag_rejections += 1;
                return false;
            }
        }
        self.previous_mag = Some(mag);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGap {
    pub after: u32,
    pub before: u32,
    pub missing: u32,
}

/// Watches the IMU sample counter for dropped notifications.
#[derive(Debug, Clone, Default)]
pub struct SampleGapDetector {
    last: Option<u32>,
    gaps: u64,
    missing: u64,
}

impl SampleGapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn gap_count(&self) -> u64 {
        self.gaps
    }

    pub fn missing_total(&self) -> u64 {
        self.missing
    }

    /// Record a counter value. A counter that does not advance is treated as
    /// a device restart, not a gap.
    pub fn observe(&mut self, sample: u32) -> Option<SampleGap> {
        let previous = self.last.replace(sample);
        let last = previous?;

        if sample <= last {
            debug!("IMU sample counter restarted: {} -> {}", last, sample);
            return None;
        }

        let missing = sample - last - 1;
        if missing == 0 {
            return None;
        }

        self.gaps += 1;
        self.missing += missing as u64;
        warn!(
            "IMU sample gap: {} missing between {} and {}",
            missing, last, sample
        );
        Some(SampleGap {
            after: last,
            before: sample,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn record(sample: u32, mag: [i16; 3]) -> RawImuRecord {
        // 1 g along sensor -z, which the accel map turns into +z.
        RawImuRecord {
            sample,
            accel: [0, 0, -2048],
            gyro: [0, 0, 0],
            mag,
        }
    }

    fn estimator() -> OrientationEstimator {
        OrientationEstimator::new(100, FilterSettings::default(), 1.0)
    }

    #[test]
    fn test_yaw_smoothing_crosses_zero() {
        let mut smoother = AngleSmoother::new(0.5);
        assert_eq!(smoother.apply(0.0, 0.0, 359.0), (0.0, 0.0, 359.0));

        let (_, _, yaw) = smoother.apply(0.0, 0.0, 2.0);
        assert_abs_diff_eq!(yaw, 0.5, epsilon = 1e-9);

        let (_, _, yaw) = smoother.apply(0.0, 0.0, 2.0);
        assert_abs_diff_eq!(yaw, 1.25, epsilon = 1e-9);
    }

    #[test]
    fn test_yaw_smoothing_backwards_across_zero() {
        let mut smoother = AngleSmoother::new(0.5);
        smoother.apply(0.0, 0.0, 1.0);
        let (_, _, yaw) = smoother.apply(0.0, 0.0, 357.0);
        assert_abs_diff_eq!(yaw, 359.0, epsilon = 1e-9);
    }

    #[test]
    fn test_alpha_one_is_passthrough() {
        let mut smoother = AngleSmoother::new(1.0);
        smoother.apply(10.0, 20.0, 30.0);
        assert_eq!(smoother.apply(-5.0, 7.0, 200.0), (-5.0, 7.0, 200.0));
    }

    #[test]
    fn test_wrap_degrees() {
        assert_eq!(wrap_degrees(-90.0), 270.0);
        assert_eq!(wrap_degrees(360.0), 0.0);
        assert_eq!(wrap_degrees(725.0), 5.0);
        assert!(wrap_degrees(-1e-20) < 360.0);
    }

    #[test]
    fn test_axis_maps() {
        assert_eq!(ACCEL_MAP.apply([1.0, 2.0, 3.0]), [1.0, -2.0, -3.0]);
        assert_eq!(GYRO_MAP.apply([1.0, 2.0, 3.0]), [1.0, -2.0, -3.0]);
        assert_eq!(MAG_MAP.apply([1.0, 2.0, 3.0]), [2.0, -1.0, -3.0]);
    }

    #[test]
    fn test_scaling_and_calibration() {
        let calibration = CalibrationModel {
            offset: [100.0, 0.0, 0.0],
            scale: [2.0, 1.0, 1.0],
        };
        let raw = RawImuRecord {
            sample: 0,
            accel: [2048, 0, 0],
            gyro: [0, 16384, 0],
            mag: [1100, 0, 0],
        };
        let scaled = ScaledImu::from_record(&raw, &calibration);
        assert_abs_diff_eq!(scaled.accel[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled.gyro[1], 1000.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled.mag[0], 2000.0 * MAG_SCALE, epsilon = 1e-12);
    }

    #[test]
    fn test_static_level_device() {
        let mut est = estimator();
        let mut last = None;
        for i in 0..300 {
            last = Some(est.process(&record(i, [0, 600, -600])));
        }
        let last = last.unwrap();
        assert_abs_diff_eq!(last.roll, 0.0, epsilon = 0.5);
        assert_abs_diff_eq!(last.pitch, 0.0, epsilon = 0.5);
        assert!(last.yaw >= 0.0 && last.yaw < 360.0);
        assert!(last.mag_fused);
        assert!(last.uncertainty.unwrap().is_finite());

        let q = last.quaternion;
        let n = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        assert_abs_diff_eq!(n, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gyro_noise_floor_holds_attitude() {
        let mut est = estimator();
        let first = est.process(&record(0, [0, 600, -600]));
        for i in 1..200 {
            // ~3 deg/s, under the floor
            let mut r = record(i, [0, 600, -600]);
            r.gyro = [0, 0, 50];
            est.process(&r);
        }
        let mut r = record(200, [0, 600, -600]);
        r.gyro = [0, 0, 50];
        let last = est.process(&r);
        assert_abs_diff_eq!(last.yaw, first.yaw, epsilon = 0.5);
    }

    #[test]
    fn test_mag_disturbance_falls_back_then_recovers() {
        let mut est = estimator();
        for i in 0..5 {
            assert!(est.process(&record(i, [0, 600, -600])).mag_fused);
        }

        // Jump of ~4 gauss
        let disturbed = est.process(&record(5, [0, 3300, -600]));
        assert!(!disturbed.mag_fused);
        assert_eq!(est.mag_rejections(), 1);

        assert!(est.process(&record(6, [0, 600, -600])).mag_fused);
    }

    #[test]
    fn test_near_zero_mag_rejected() {
        let mut est = estimator();
        assert!(!est.process(&record(0, [0, 0, 0])).mag_fused);
        // No accepted reference yet, so the next sample is taken.
        assert!(est.process(&record(1, [0, 600, -600])).mag_fused);
    }

    #[test]
    fn test_sample_rate_reconfigure() {
        let mut est = estimator();
        est.process(&record(0, [0, 600, -600]));
        est.set_sample_rate(50);
        assert_eq!(est.sample_rate_hz(), 50);
        est.set_sample_rate(0);
        assert_eq!(est.sample_rate_hz(), 50);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut est = estimator();
        est.process(&record(0, [0, 0, 0]));
        est.reset();
        assert_eq!(est.records_processed(), 0);
        assert_eq!(est.mag_rejections(), 0);
    }

    #[test]
    fn test_single_gap() {
        let mut detector = SampleGapDetector::new();
        let gaps: Vec<SampleGap> = [1, 2, 3, 6, 7]
            .into_iter()
            .filter_map(|s| detector.observe(s))
            .collect();
        assert_eq!(
            gaps,
            vec![SampleGap {
                after: 3,
                before: 6,
                missing: 2
            }]
        );
        assert_eq!(detector.gap_count(), 1);
        assert_eq!(detector.missing_total(), 2);
    }

    #[test]
    fn test_counter_restart_is_not_a_gap() {
        let mut detector = SampleGapDetector::new();
        assert!(detector.observe(500).is_none());
        assert!(detector.observe(0).is_none());
        assert!(detector.observe(1).is_none());
        assert!(detector.observe(u32::MAX).is_some());
        assert!(detector.observe(0).is_none());
        assert_eq!(detector.gap_count(), 1);
    }
}
