//! In-memory OptoGrid peripheral.
//!
//! Stands in for the BLE stack: characteristic values live in a map, writes are
//! recorded, and a [`SimulatedHandle`] lets the owner push notifications or drop
//! the link from outside the device loop.

use crate::domain::error::TransportError;
use crate::domain::models::{RawImuRecord, ScannedDevice};
use crate::infrastructure::bluetooth::protocol::{self, imu_record_bytes, IMU_DATA_UUID};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub name: String,
    pub address: String,
    pub rssi: i16,
    values: HashMap<String, Vec<u8>>,
}

impl SimulatedPeripheral {
    /// Peripheral with firmware-like defaults for every known characteristic.
    pub fn optogrid(name: &str, address: &str) -> Self {
        let defaults: &[(&str, &str)] = &[
            (protocol::DEVICE_ID_UUID, name),
            (protocol::FIRMWARE_VERSION_UUID, "1.4.0"),
            (protocol::HARDWARE_VERSION_UUID, "C"),
            (protocol::ULED_COLOR_UUID, "blue"),
            (protocol::ULED_CHECK_UUID, "0"),
            (protocol::BATTERY_LEVEL_UUID, "87"),
            (protocol::BATTERY_VOLTAGE_UUID, "3712"),
            (protocol::STATUS_LED_UUID, "False"),
            (protocol::SHAM_LED_UUID, "False"),
            (protocol::DEVICE_LOG_UUID, ""),
            (protocol::LAST_STIM_TIME_UUID, "0"),
            (protocol::SEQUENCE_LENGTH_UUID, "1"),
            (protocol::LED_SELECTION_UUID, "1"),
            (protocol::DURATION_UUID, "100"),
            (protocol::PERIOD_UUID, "1000"),
            (protocol::PULSE_WIDTH_UUID, "10"),
            (protocol::AMPLITUDE_UUID, "50"),
            (protocol::PWM_FREQUENCY_UUID, "20000"),
            (protocol::RAMP_UP_UUID, "0"),
            (protocol::RAMP_DOWN_UUID, "0"),
            (protocol::TRIGGER_UUID, "False"),
            (protocol::IMU_ENABLE_UUID, "False"),
            (protocol::IMU_SAMPLE_RATE_UUID, "100"),
            (protocol::IMU_RESOLUTION_UUID, "16"),
        ];

        let values = defaults
            .iter()
            .filter_map(|(uuid, text)| {
                protocol::encode(uuid, text)
                    .ok()
                    .map(|bytes| (uuid.to_string(), bytes))
            })
            .collect();

        Self {
            name: name.to_string(),
            address: address.to_string(),
            rssi: -60,
            values,
        }
    }

    pub fn set_value(&mut self, uuid: &str, data: Vec<u8>) {
        self.values.insert(uuid.to_ascii_lowercase(), data);
    }
}

#[derive(Debug, Default)]
struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    connected: Option<usize>,
    link: u64,
    subscriptions: HashSet<String>,
    writes: Vec<(String, Vec<u8>)>,
    response_delay: Duration,
    fail_writes: bool,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SimulatedDevice {
    /// Create a transport over the given peripherals, plus its event stream.
    pub fn new(
        peripherals: Vec<SimulatedPeripheral>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = SimState {
            peripherals,
            ..SimState::default()
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
                events,
            },
            rx,
        )
    }

    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle {
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        }
    }

    async fn delay(&self) {
        let delay = lock(&self.state).response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Transport for SimulatedDevice {
    async fn scan(
        &mut self,
        _timeout: Duration,
        name_filter: &str,
    ) -> Result<Vec<ScannedDevice>, TransportError> {
        self.delay().await;
        let state = lock(&self.state);
        Ok(state
            .peripherals
            .iter()
            .filter(|p| p.name.contains(name_filter))
            .map(|p| ScannedDevice {
                name: p.name.clone(),
                address: p.address.clone(),
                signal_strength: p.rssi,
            })
            .collect())
    }

    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.delay().await;
        let mut state = lock(&self.state);
        let index = state
            .peripherals
            .iter()
            .position(|p| p.address.eq_ignore_ascii_case(address))
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;
        state.connected = Some(index);
        state.link += 1;
        state.subscriptions.clear();
        info!("Simulated link {} up: {}", state.link, address);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.connected = None;
        state.subscriptions.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected.is_some()
    }

    fn link(&self) -> u64 {
        lock(&self.state).link
    }

    async fn read(&mut self, uuid: &str) -> Result<Vec<u8>, TransportError> {
        self.delay().await;
        let state = lock(&self.state);
        let index = state.connected.ok_or(TransportError::NotConnected)?;
        state.peripherals[index]
            .values
            .get(&uuid.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::Io(format!("Characteristic {} not readable", uuid)))
    }

    async fn write(&mut self, uuid: &str, data: &[u8]) -> Result<(), TransportError> {
        self.delay().await;
        let mut state = lock(&self.state);
        let index = state.connected.ok_or(TransportError::NotConnected)?;
        if state.fail_writes {
            return Err(TransportError::Io(format!("GATT write to {} rejected", uuid)));
        }
        let uuid = uuid.to_ascii_lowercase();
        debug!("Simulated write {} <- {:02x?}", uuid, data);
        state.writes.push((uuid.clone(), data.to_vec()));
        state.peripherals[index].values.insert(uuid, data.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self, uuid: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.connected.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.insert(uuid.to_ascii_lowercase());
        Ok(())
    }
}

/// Outside control of a [`SimulatedDevice`].
#[derive(Clone)]
pub struct SimulatedHandle {
    state: Arc<Mutex<SimState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SimulatedHandle {
    /// Push a notification if the characteristic is subscribed.
    pub fn notify(&self, uuid: &str, data: Vec<u8>) -> bool {
        let uuid = uuid.to_ascii_lowercase();
        let link = {
            let state = lock(&self.state);
            (state.connected.is_some() && state.subscriptions.contains(&uuid))
                .then_some(state.link)
        };
        match link {
            Some(link) => {
                let _ = self
                    .events
                    .send(TransportEvent::Notification { link, uuid, data });
                true
            }
            None => false,
        }
    }

    pub fn send_imu(&self, record: &RawImuRecord) -> bool {
        self.notify(IMU_DATA_UUID, imu_record_bytes(record))
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self, reason: &str) {
        let link = {
            let mut state = lock(&self.state);
            state.connected = None;
            state.subscriptions.clear();
            state.link
        };
        let _ = self.events.send(TransportEvent::Disconnected {
            link,
            reason: reason.to_string(),
        });
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    pub fn writes_to(&self, uuid: &str) -> Vec<Vec<u8>> {
        let uuid = uuid.to_ascii_lowercase();
        lock(&self.state)
            .writes
            .iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn set_value(&self, uuid: &str, data: Vec<u8>) {
        let mut state = lock(&self.state);
        if let Some(index) = state.connected {
            state.peripherals[index].set_value(uuid, data);
        } else {
            for p in state.peripherals.iter_mut() {
                p.set_value(uuid, data.clone());
            }
        }
    }

    pub fn set_response_delay(&self, delay: Duration) {
        lock(&self.state).response_delay = delay;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected.is_some()
    }
}
