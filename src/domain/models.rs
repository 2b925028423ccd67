use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One decoded IMU Data notification.
///
/// Axis values are raw sensor counts in the device-native frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawImuRecord {
    pub sample: u32,
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
    pub mag: [i16; 3],
}

impl RawImuRecord {
    /// The nine axis values in wire order (accel, gyro, mag).
    pub fn axes(&self) -> [i16; 9] {
        let mut out = [0i16; 9];
        out[0..3].copy_from_slice(&self.accel);
        out[3..6].copy_from_slice(&self.gyro);
        out[6..9].copy_from_slice(&self.mag);
        out
    }
}

/// Orientation after one filter step, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationEstimate {
    /// (w, x, y, z), unit norm
    pub quaternion: [f64; 4],
    pub roll: f64,
    pub pitch: f64,
    /// Always in [0, 360)
    pub yaw: f64,
    /// Trace of the filter covariance
    pub uncertainty: Option<f64>,
    pub mag_fused: bool,
}

/// One row of the session file.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub sample: u32,
    pub raw: [i16; 9],
    pub sync: i64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub uncertainty: Option<f64>,
    pub battery_mv: Option<u16>,
}

impl TelemetryRow {
    pub fn new(
        record: &RawImuRecord,
        estimate: &OrientationEstimate,
        battery_mv: Option<u16>,
    ) -> Self {
        Self {
            sample: record.sample,
            raw: record.axes(),
            sync: 0,
            roll: estimate.roll,
            pitch: estimate.pitch,
            yaw: estimate.yaw,
            uncertainty: estimate.uncertainty,
            battery_mv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub signal_strength: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImuUpdate {
    pub sample: u32,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Events published to passive subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Imu(ImuUpdate),
    Status(String),
    Connection(ConnectionStatus),
    DeviceLog(String),
}

impl BridgeEvent {
    /// Topic-prefixed JSON line, e.g. `IMU {"type":"imu_update",...}`.
    pub fn to_wire(&self, timestamp: f64) -> String {
        match self {
            Self::Imu(update) => {
                let body = serde_json::json!({
                    "type": "imu_update",
                    "timestamp": timestamp,
                    "sample": update.sample,
                    "roll": update.roll,
                    "pitch": update.pitch,
                    "yaw": update.yaw,
                });
                format!("IMU {}", body)
            }
            Self::Status(message) => Self::gui_wire("gui_status", timestamp, message),
            Self::Connection(status) => {
                let body = serde_json::json!({
                    "type": "connection_status",
                    "timestamp": timestamp,
                    "status": status,
                });
                format!("GUI {}", body)
            }
            Self::DeviceLog(message) => Self::gui_wire("device_log", timestamp, message),
        }
    }

    fn gui_wire(kind: &str, timestamp: f64, message: &str) -> String {
        let body = serde_json::json!({
            "type": kind,
            "timestamp": timestamp,
            "message": message,
        });
        format!("GUI {}", body)
    }
}

/// Registration point for event subscribers.
///
/// Publishing never blocks and never fails when nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(BridgeEvent::Status(message.into()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imu_wire_format() {
        let event = BridgeEvent::Imu(ImuUpdate {
            sample: 7,
            roll: 1.5,
            pitch: -2.0,
            yaw: 359.0,
        });
        let wire = event.to_wire(12.5);
        assert!(wire.starts_with("IMU {"));

        let body: serde_json::Value = serde_json::from_str(&wire[4..]).unwrap();
        assert_eq!(body["type"], "imu_update");
        assert_eq!(body["yaw"], 359.0);
        assert_eq!(body["timestamp"], 12.5);
    }

    #[test]
    fn test_status_wire_format() {
        let wire = BridgeEvent::Status("Device disconnected".into()).to_wire(1.0);
        assert!(wire.starts_with("GUI {"));
        let body: serde_json::Value = serde_json::from_str(&wire[4..]).unwrap();
        assert_eq!(body["type"], "gui_status");
        assert_eq!(body["message"], "Device disconnected");
    }

    #[test]
    fn test_event_bus_without_subscribers() {
        let bus = EventBus::new(4);
        bus.status("nobody listening");

        let mut rx = bus.subscribe();
        bus.status("hello");
        assert_eq!(rx.try_recv().unwrap(), BridgeEvent::Status("hello".into()));
    }

    #[test]
    fn test_raw_record_axes_order() {
        let record = RawImuRecord {
            sample: 1,
            accel: [1, 2, 3],
            gyro: [4, 5, 6],
            mag: [7, 8, 9],
        };
        assert_eq!(record.axes(), [1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }
}
