//! Quaternion Extended Kalman Filter
//!
//! State: attitude quaternion q = (w, x, y, z) rotating body vectors into the
//! world frame (x = magnetic north, z = up).
//!
//! - Process model: first-order quaternion integration of the gyroscope,
//!   q' = (I + dt/2 * Omega(w)) q, with process noise propagated from the gyro
//!   variance through dq/dw.
//! - Measurements: normalized accelerometer (expected C(q)^T g) and, when
//!   available, normalized magnetometer (expected C(q)^T b, where b is the
//!   current field estimate in the world frame with its east component removed).

use nalgebra::{
    DMatrix, DVector, Matrix3x4, Matrix4, Matrix4x3, Quaternion, UnitQuaternion, Vector3, Vector4,
};

const GRAVITY_REF: [f64; 3] = [0.0, 0.0, 1.0];

#[derive(Debug, Clone)]
pub struct QuaternionEkf {
    q: Vector4<f64>,
    p: Matrix4<f64>,
    dt: f64,
    var_acc: f64,
    var_gyro: f64,
    var_mag: f64,
}

impl QuaternionEkf {
    pub fn new(frequency_hz: f64, var_acc: f64, var_gyro: f64, var_mag: f64) -> Self {
        Self {
            q: Vector4::new(1.0, 0.0, 0.0, 0.0),
            p: Matrix4::identity(),
            dt: 1.0 / frequency_hz.max(f64::EPSILON),
            var_acc,
            var_gyro,
            var_mag,
        }
    }

    pub fn frequency(&self) -> f64 {
        1.0 / self.dt
    }

    /// Change the sample rate. Attitude is kept, covariance restarts.
    pub fn set_frequency(&mut self, frequency_hz: f64) {
        self.dt = 1.0 / frequency_hz.max(f64::EPSILON);
        self.p = Matrix4::identity();
    }

    /// (w, x, y, z)
    pub fn quaternion(&self) -> [f64; 4] {
        [self.q[0], self.q[1], self.q[2], self.q[3]]
    }

    pub fn covariance_trace(&self) -> f64 {
        self.p.trace()
    }

    /// One filter step.
    ///
    /// `gyr` in rad/s, `acc` in m/s^2, `mag` in any consistent unit (µT).
    /// Passing `None` for `mag` runs the 6-DOF update.
    pub fn update(&mut self, gyr: [f64; 3], acc: [f64; 3], mag: Option<[f64; 3]>) -> [f64; 4] {
        self.predict(gyr);

        let acc = Vector3::from(acc);
        let acc_norm = acc.norm();
        if acc_norm <= f64::EPSILON {
            return self.quaternion();
        }
        let a = acc / acc_norm;

        let m = mag
            .map(Vector3::from)
            .filter(|m| m.norm() > f64::EPSILON)
            .map(|m| m.normalize());

        match m {
            Some(m) => {
                let b = self.horizontal_field_reference(&m);
                let g = Vector3::from(GRAVITY_REF);
                let mut z = DVector::zeros(6);
                z.fixed_rows_mut::<3>(0).copy_from(&a);
                z.fixed_rows_mut::<3>(3).copy_from(&m);

                let mut h = DVector::zeros(6);
                h.fixed_rows_mut::<3>(0).copy_from(&self.expected(&g));
                h.fixed_rows_mut::<3>(3).copy_from(&self.expected(&b));

                let mut jac = DMatrix::zeros(6, 4);
                jac.fixed_view_mut::<3, 4>(0, 0).copy_from(&self.jacobian(&g));
                jac.fixed_view_mut::<3, 4>(3, 0).copy_from(&self.jacobian(&b));

                let mut r = DMatrix::zeros(6, 6);
                for i in 0..3 {
                    r[(i, i)] = self.var_acc;
                    r[(i + 3, i + 3)] = self.var_mag;
                }
                self.correct(z, h, jac, r);
            }
            None => {
                let g = Vector3::from(GRAVITY_REF);
                let z = DVector::from_column_slice(a.as_slice());
                let h = DVector::from_column_slice(self.expected(&g).as_slice());
                let jac = DMatrix::from_column_slice(3, 4, self.jacobian(&g).as_slice());
                let r = DMatrix::from_diagonal_element(3, 3, self.var_acc);
                self.correct(z, h, jac, r);
            }
        }

        self.quaternion()
    }

    fn predict(&mut self, gyr: [f64; 3]) {
        let [wx, wy, wz] = gyr;
        let omega = Matrix4::new(
            0.0, -wx, -wy, -wz, //
            wx, 0.0, wz, -wy, //
            wy, -wz, 0.0, wx, //
            wz, wy, -wx, 0.0,
        );
        let f = Matrix4::identity() + omega * (0.5 * self.dt);

        let (qw, qx, qy, qz) = (self.q[0], self.q[1], self.q[2], self.q[3]);
        let w = Matrix4x3::new(
            -qx, -qy, -qz, //
            qw, -qz, qy, //
            qz, qw, -qx, //
            -qy, qx, qw,
        ) * (0.5 * self.dt);
        let q_noise = w * w.transpose() * self.var_gyro;

        self.q = f * self.q;
        self.normalize();
        self.p = f * self.p * f.transpose() + q_noise;
    }

    fn correct(&mut self, z: DVector<f64>, h: DVector<f64>, jac: DMatrix<f64>, r: DMatrix<f64>) {
        let p = DMatrix::from_column_slice(4, 4, self.p.as_slice());
        let s = &jac * &p * jac.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            tracing::trace!("Innovation covariance is singular, skipping correction");
            return;
        };
        let k = &p * jac.transpose() * s_inv;
        let innovation = z - h;

        let dq = &k * innovation;
        self.q += Vector4::new(dq[0], dq[1], dq[2], dq[3]);
        self.normalize();

        let p_new = (DMatrix::identity(4, 4) - &k * &jac) * p;
        self.p = Matrix4::from_column_slice(p_new.as_slice());
    }

    /// C(q)^T r: a world-frame reference vector seen from the body frame.
    fn expected(&self, r: &Vector3<f64>) -> Vector3<f64> {
        self.rotation().transpose() * r
    }

    /// d(C(q)^T r)/dq
    fn jacobian(&self, r: &Vector3<f64>) -> Matrix3x4<f64> {
        let (qw, qx, qy, qz) = (self.q[0], self.q[1], self.q[2], self.q[3]);
        let (rx, ry, rz) = (r[0], r[1], r[2]);
        Matrix3x4::new(
            ry * qz - rz * qy,
            ry * qy + rz * qz,
            -2.0 * rx * qy + ry * qx - rz * qw,
            -2.0 * rx * qz + ry * qw + rz * qx,
            //
            -rx * qz + rz * qx,
            rx * qy - 2.0 * ry * qx + rz * qw,
            rx * qx + rz * qz,
            -rx * qw - 2.0 * ry * qz + rz * qy,
            //
            rx * qy - ry * qx,
            rx * qz - ry * qw - 2.0 * rz * qx,
            rx * qw + ry * qz - 2.0 * rz * qy,
            rx * qx + ry * qy,
        ) * 2.0
    }

    /// Body-to-world rotation matrix.
    fn rotation(&self) -> nalgebra::Matrix3<f64> {
        let q = UnitQuaternion::from_quaternion(Quaternion::new(
            self.q[0], self.q[1], self.q[2], self.q[3],
        ));
        q.to_rotation_matrix().into_inner()
    }

    fn horizontal_field_reference(&self, m_body: &Vector3<f64>) -> Vector3<f64> {
        let h = self.rotation() * m_body;
        Vector3::new((h[0] * h[0] + h[1] * h[1]).sqrt(), 0.0, h[2])
    }

    fn normalize(&mut self) {
        let n = self.q.norm();
        if n > 1e-12 {
            self.q /= n;
        } else {
            self.q = Vector4::new(1.0, 0.0, 0.0, 0.0);
        }
    }
}

/// Quaternion (w, x, y, z) to (roll, pitch, yaw) in degrees, yaw in (-180, 180].
pub fn quaternion_to_euler(q: [f64; 4]) -> (f64, f64, f64) {
    let [w, x, y, z] = q;
    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quat_norm(q: [f64; 4]) -> f64 {
        q.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    #[test]
    fn test_static_level_stays_level() {
        let mut ekf = QuaternionEkf::new(100.0, 0.0001, 10.0, 0.1);
        for _ in 0..500 {
            ekf.update([0.0; 3], [0.0, 0.0, 9.80665], Some([20.0, 0.0, -40.0]));
        }
        let (roll, pitch, yaw) = quaternion_to_euler(ekf.quaternion());
        assert_abs_diff_eq!(roll, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(pitch, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(yaw, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_unit_norm_under_rotation() {
        let mut ekf = QuaternionEkf::new(100.0, 0.0001, 10.0, 0.1);
        for i in 0..2000 {
            let t = i as f64 * 0.01;
            let gyr = [0.8 * t.sin(), 1.5, -0.3 * t.cos()];
            let acc = [3.0 * t.cos(), 1.0, 9.0];
            let mag = if i % 7 == 0 { None } else { Some([25.0, 5.0 * t.sin(), -30.0]) };
            let q = ekf.update(gyr, acc, mag);
            assert_abs_diff_eq!(quat_norm(q), 1.0, epsilon = 1e-9);
        }
        assert!(ekf.covariance_trace().is_finite());
    }

    #[test]
    fn test_gyro_only_integrates_yaw() {
        // Very loose accel trust: the gyro dominates over one second.
        let mut ekf = QuaternionEkf::new(100.0, 1e6, 1e-6, 1e6);
        for _ in 0..100 {
            ekf.update([0.0, 0.0, 90f64.to_radians()], [0.0, 0.0, 1.0], None);
        }
        let (_, _, yaw) = quaternion_to_euler(ekf.quaternion());
        assert_abs_diff_eq!(yaw, 90.0, epsilon = 1.0);
    }

    #[test]
    fn test_tilt_converges_to_gravity() {
        let mut ekf = QuaternionEkf::new(100.0, 0.0001, 10.0, 0.1);
        // Body rolled +30 degrees about x: gravity appears along +y and +z.
        let roll = 30f64.to_radians();
        let acc = [0.0, roll.sin(), roll.cos()];
        for _ in 0..500 {
            ekf.update([0.0; 3], acc, None);
        }
        let (r, p, _) = quaternion_to_euler(ekf.quaternion());
        assert_abs_diff_eq!(r, 30.0, epsilon = 0.5);
        assert_abs_diff_eq!(p, 0.0, epsilon = 0.5);
    }

    #[test]
    fn test_set_frequency_keeps_attitude() {
        let mut ekf = QuaternionEkf::new(100.0, 0.0001, 10.0, 0.1);
        ekf.update([0.5, 0.0, 0.0], [0.0, 0.0, 1.0], None);
        let before = ekf.quaternion();
        ekf.set_frequency(50.0);
        assert_eq!(ekf.quaternion(), before);
        assert_abs_diff_eq!(ekf.frequency(), 50.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ekf.covariance_trace(), 4.0);
    }

    #[test]
    fn test_euler_identity() {
        let (r, p, y) = quaternion_to_euler([1.0, 0.0, 0.0, 0.0]);
        assert_eq!((r, p, y), (0.0, 0.0, 0.0));
    }
}
