//! OptoGrid bridge
//!
//! Connects an OptoGrid stimulator/IMU over BLE to external control software:
//! a request/reply command socket, a broadcast socket for telemetry, and
//! Parquet session files.

pub mod application;
pub mod domain;
pub mod infrastructure;
