//! Domain layer: device-independent logic.

pub mod calibration;
pub mod command;
pub mod ekf;
pub mod error;
pub mod imu;
pub mod models;
pub mod settings;
