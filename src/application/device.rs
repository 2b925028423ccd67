//! Device loop controller
//!
//! Owns everything that touches the connected device: the transport, the
//! orientation estimator, the session logger and the battery cache. Only the
//! device loop calls into it, one job or one transport event at a time.

use crate::domain::calibration;
use crate::domain::command::{Command, ProgramSettings};
use crate::domain::error::{BridgeError, BridgeResult, TransportError};
use crate::domain::imu::{OrientationEstimator, SampleGapDetector};
use crate::domain::models::{
    BridgeEvent, ConnectionStatus, EventBus, ImuUpdate, ScannedDevice, TelemetryRow,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{
    self, BATTERY_VOLTAGE_UUID, CHARACTERISTICS, DECODE_ERROR, DEVICE_ID_UUID, DEVICE_LOG_UUID,
    IMU_DATA_UUID, IMU_ENABLE_UUID, IMU_SAMPLE_RATE_UUID, LAST_STIM_TIME_UUID, SHAM_LED_UUID,
    STATUS_LED_UUID, TRIGGER_UUID, ULED_CHECK_UUID,
};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use crate::infrastructure::session_log::SessionLogger;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Work accepted by the device loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    Command(Command),
    Program(ProgramSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectedPeer {
    name: String,
    address: String,
    /// Transport link generation this peer was connected on
    link: u64,
}

/// Run a transport operation under a deadline.
///
/// On expiry the pending operation is dropped and the loop moves on.
async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> BridgeResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!("{} timed out after {} ms", operation, limit.as_millis());
            Err(TransportError::Timeout {
                operation: operation.to_string(),
                after_ms: limit.as_millis() as u64,
            }
            .into())
        }
    }
}

/// Heuristic from the connect command: UUID, MAC, or a long hex-ish token.
pub fn looks_like_address(identifier: &str) -> bool {
    let id = identifier.trim();
    let hexish = id
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-');
    (id.len() == 36 && id.matches('-').count() == 4)
        || (id.len() == 17 && id.matches(':').count() == 5)
        || (id.len() > 10 && hexish)
}

/// `OptoGrid-<last four address characters>`
pub fn fallback_device_name(address: &str) -> String {
    let chars: Vec<char> = address.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("OptoGrid-{}", tail.to_uppercase())
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn bool_text(on: bool) -> &'static str {
    if on {
        "True"
    } else {
        "False"
    }
}

pub struct DeviceController<T: Transport> {
    transport: T,
    settings: Settings,
    estimator: OrientationEstimator,
    gaps: SampleGapDetector,
    logger: SessionLogger,
    events: EventBus,
    peer: Option<ConnectedPeer>,
    battery_mv: Option<u16>,
    op_timeout: Duration,
}

impl<T: Transport> DeviceController<T> {
    pub fn new(transport: T, settings: Settings, events: EventBus) -> Self {
        let estimator = OrientationEstimator::new(
            settings.default_sample_rate_hz,
            settings.filter,
            settings.smoothing_alpha,
        );
        let logger = SessionLogger::new(&settings.session_dir, settings.flush_threshold);
        let op_timeout = Duration::from_millis(settings.operation_timeout_ms);
        Self {
            transport,
            settings,
            estimator,
            gaps: SampleGapDetector::new(),
            logger,
            events,
            peer: None,
            battery_mv: None,
            op_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some() && self.transport.is_connected()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.peer.as_ref().map(|p| p.name.as_str())
    }

    pub fn is_logging(&self) -> bool {
        self.logger.is_active()
    }

    pub fn session_path(&self) -> Option<PathBuf> {
        self.logger.path().map(|p| p.to_path_buf())
    }

    pub fn estimator(&self) -> &OrientationEstimator {
        &self.estimator
    }

    pub fn sample_gaps(&self) -> u64 {
        self.gaps.gap_count()
    }

    /// Execute one request and produce its reply text.
    pub async fn execute(&mut self, request: DeviceRequest) -> BridgeResult<String> {
        match request {
            DeviceRequest::Command(command) => self.execute_command(command).await,
            DeviceRequest::Program(program) => self.program(&program).await,
        }
    }

    async fn execute_command(&mut self, command: Command) -> BridgeResult<String> {
        match command {
            Command::Connect { device } => self.connect(&device).await,
            Command::Trigger => self.trigger().await,
            Command::Scan => self.scan().await,
            Command::Status => Ok(self.status()),
            Command::GattRead { uuid: Some(uuid) } => self.gatt_read_one(&uuid).await,
            Command::GattRead { uuid: None } => self.gatt_read_all().await,
            Command::GattWrite { uuid, value } => self.gatt_write(&uuid, &value).await,
            Command::StartLogging {
                subject_id,
                session_id,
            } => {
                self.start_logging(subject_id.as_deref(), session_id.as_deref())
                    .await
            }
            Command::StopLogging => self.stop_logging().await,
            Command::ReadBattery => self.read_battery().await,
            Command::ReadUledCheck => {
                self.require_connected()?;
                let value = self.read_text(ULED_CHECK_UUID).await?;
                info!("uLED Check: {}", value);
                Ok(format!("uLED Check = {}", value))
            }
            Command::ReadLastStim => {
                self.require_connected()?;
                let value = self.read_text(LAST_STIM_TIME_UUID).await?;
                info!("Last Stim Time: {} ms", value);
                Ok(format!("Last Stim Time = {} ms", value))
            }
            Command::Sync { value } => {
                self.logger.mark_sync(value)?;
                Ok("Sync Written".to_string())
            }
            Command::ToggleStatusLed { on } => {
                self.require_connected()?;
                self.write_text(STATUS_LED_UUID, bool_text(on)).await?;
                Ok(format!("Status LED turned {}", on_off(on)))
            }
            Command::ToggleShamLed { on } => {
                self.require_connected()?;
                self.write_text(SHAM_LED_UUID, bool_text(on)).await?;
                Ok(format!("Sham LED turned {}", on_off(on)))
            }
            Command::Program => Err(BridgeError::state(
                "program payload must follow the program command",
            )),
            Command::Unknown(text) => Ok(format!("Unknown command: {}", text)),
        }
    }

    fn require_connected(&self) -> BridgeResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected.into())
        }
    }

    async fn read_text(&mut self, uuid: &str) -> BridgeResult<String> {
        let bytes = with_timeout(self.op_timeout, "read", self.transport.read(uuid)).await?;
        Ok(protocol::decode(uuid, &bytes))
    }

    async fn write_text(&mut self, uuid: &str, value: &str) -> BridgeResult<()> {
        let bytes = protocol::encode(uuid, value)?;
        with_timeout(self.op_timeout, "write", self.transport.write(uuid, &bytes)).await
    }

    async fn scan(&mut self) -> BridgeResult<String> {
        let devices = self.scan_devices().await?;
        if devices.is_empty() {
            return Ok("No BLE devices found".to_string());
        }
        Ok(devices
            .iter()
            .map(|d| format!("{} ({})", d.name, d.address))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn scan_devices(&mut self) -> BridgeResult<Vec<ScannedDevice>> {
        let scan_timeout = Duration::from_millis(self.settings.scan_timeout_ms);
        info!("Scanning for BLE devices ({} ms)", scan_timeout.as_millis());
        let devices = with_timeout(
            scan_timeout + self.op_timeout,
            "scan",
            self.transport
                .scan(scan_timeout, &self.settings.scan_name_filter),
        )
        .await?;
        info!("Found {} device(s)", devices.len());
        for d in &devices {
            debug!("  {} ({}) RSSI {} dBm", d.name, d.address, d.signal_strength);
        }
        Ok(devices)
    }

    async fn connect(&mut self, identifier: &str) -> BridgeResult<String> {
        if self.peer.is_some() || self.transport.is_connected() {
            info!("Already connected, disconnecting first");
            self.release_connection("reconnect").await;
        }

        self.events
            .publish(BridgeEvent::Connection(ConnectionStatus::Connecting));

        let (address, advertised_name) = match self.resolve_target(identifier).await {
            Ok(target) => target,
            Err(e) => {
                error!("Connection failed: {}", e);
                self.events
                    .publish(BridgeEvent::Connection(ConnectionStatus::Error));
                return Err(e);
            }
        };

        info!("Connecting to {}", address);
        if let Err(e) = self.open_link(&address).await {
            error!("Connection failed: {}", e);
            let _ = self.transport.disconnect().await;
            self.events
                .publish(BridgeEvent::Connection(ConnectionStatus::Error));
            return Err(e);
        }

        let name = match advertised_name {
            Some(name) => name,
            None => match self.read_text(DEVICE_ID_UUID).await {
                Ok(id) if !id.is_empty() && id != DECODE_ERROR => id,
                _ => fallback_device_name(&address),
            },
        };

        self.estimator.reset();
        self.estimator.set_calibration(calibration::load_or_identity(
            std::path::Path::new(&self.settings.calibration_dir),
            &name,
        ));
        if self.estimator.calibration().is_identity() {
            self.events
                .status(format!("{}: no magnetometer calibration, using identity", name));
        }
        self.gaps.reset();
        self.battery_mv = None;
        self.peer = Some(ConnectedPeer {
            name: name.clone(),
            address,
            link: self.transport.link(),
        });

        info!("{} Connected", name);
        self.events
            .publish(BridgeEvent::Connection(ConnectionStatus::Connected));
        self.events.status(format!("Connected to {}", name));
        Ok(format!("{} Connected", name))
    }

    /// Address to connect to, plus the advertised name when found by scanning.
    async fn resolve_target(
        &mut self,
        identifier: &str,
    ) -> BridgeResult<(String, Option<String>)> {
        if looks_like_address(identifier) {
            return Ok((identifier.trim().to_string(), None));
        }
        let devices = self.scan_devices().await?;
        let found = devices
            .into_iter()
            .find(|d| d.name.contains(identifier))
            .ok_or_else(|| TransportError::DeviceNotFound(identifier.to_string()))?;
        Ok((found.address, Some(found.name)))
    }

    async fn open_link(&mut self, address: &str) -> BridgeResult<()> {
        with_timeout(self.op_timeout, "connect", self.transport.connect(address)).await?;
        for uuid in [DEVICE_LOG_UUID, IMU_DATA_UUID] {
            with_timeout(self.op_timeout, "subscribe", self.transport.subscribe(uuid)).await?;
        }
        self.sync_sample_rate().await;
        Ok(())
    }

    /// Match the filter to the IMU Sample Rate characteristic.
    async fn sync_sample_rate(&mut self) {
        match self.read_text(IMU_SAMPLE_RATE_UUID).await {
            Ok(text) => match text.parse::<u32>() {
                Ok(rate) if rate > 0 => self.estimator.set_sample_rate(rate),
                _ => warn!(
                    "Unusable IMU sample rate '{}', keeping {} Hz",
                    text,
                    self.estimator.sample_rate_hz()
                ),
            },
            Err(e) => warn!("Could not read IMU sample rate: {}", e),
        }
    }

    fn status(&self) -> String {
        match &self.peer {
            Some(peer) if self.transport.is_connected() => {
                info!(
                    "Status: connected to {}, {} records, {} sample gaps ({} missing), logging={}",
                    peer.name,
                    self.estimator.records_processed(),
                    self.gaps.gap_count(),
                    self.gaps.missing_total(),
                    self.logger.is_active()
                );
                format!("Connected to {} ({})", peer.name, peer.address)
            }
            _ => "Disconnected".to_string(),
        }
    }

    async fn trigger(&mut self) -> BridgeResult<String> {
        self.require_connected()?;
        self.write_text(TRIGGER_UUID, "True").await?;
        info!("Sent opto trigger");
        if let Err(e) = self.logger.mark_sync(self.settings.trigger_sync_value) {
            warn!("Trigger sync not recorded: {}", e);
        }
        Ok("Opto Triggered".to_string())
    }

    async fn gatt_read_one(&mut self, uuid: &str) -> BridgeResult<String> {
        self.require_connected()?;
        let value = self.read_text(uuid).await?;
        Ok(format!("{}: {}", protocol::characteristic_name(uuid), value))
    }

    async fn gatt_read_all(&mut self) -> BridgeResult<String> {
        self.require_connected()?;
        let mut lines = vec!["Service,Characteristic,UUID,Value,Unit".to_string()];
        for c in CHARACTERISTICS {
            let value = match self.read_text(c.uuid).await {
                Ok(value) => value,
                Err(e) => {
                    debug!("{} not readable: {}", c.name, e);
                    format!("<read failed: {}>", e)
                }
            };
            lines.push(
                [
                    protocol::service_name(c.uuid),
                    c.name,
                    c.uuid,
                    value.as_str(),
                    c.unit,
                ]
                .iter()
                .map(|f| csv_field(f))
                .collect::<Vec<_>>()
                .join(","),
            );
        }
        Ok(lines.join("\n"))
    }

    async fn gatt_write(&mut self, uuid: &str, value: &str) -> BridgeResult<String> {
        self.require_connected()?;
        self.write_text(uuid, value).await?;
        let name = protocol::characteristic_name(uuid);
        info!("Written {}: {}", name, value);
        if uuid.eq_ignore_ascii_case(IMU_SAMPLE_RATE_UUID) {
            self.sync_sample_rate().await;
        }
        Ok(format!("{} written", name))
    }

    async fn start_logging(
        &mut self,
        subject_id: Option<&str>,
        session_id: Option<&str>,
    ) -> BridgeResult<String> {
        self.require_connected()?;
        self.write_text(IMU_ENABLE_UUID, "True").await?;

        if !self.logger.is_active() {
            let device_id = match self.read_text(DEVICE_ID_UUID).await {
                Ok(id) if id != DECODE_ERROR => Some(id),
                _ => None,
            };
            let path = self
                .logger
                .start(subject_id, session_id, device_id.as_deref())?;
            self.events
                .status(format!("IMU logging to {}", path.display()));
        }
        Ok("IMU enabled, and logging started".to_string())
    }

    async fn stop_logging(&mut self) -> BridgeResult<String> {
        self.require_connected()?;
        self.write_text(IMU_ENABLE_UUID, "False").await?;
        if let Some(summary) = self.logger.stop()? {
            self.events.status(format!(
                "IMU log closed: {} ({} rows)",
                summary.path.display(),
                summary.rows
            ));
        }
        Ok("IMU disabled, and logging stopped".to_string())
    }

    async fn read_battery(&mut self) -> BridgeResult<String> {
        self.require_connected()?;
        let device = self.read_text(DEVICE_ID_UUID).await?;
        let text = self.read_text(BATTERY_VOLTAGE_UUID).await?;
        let mv: u16 = text
            .parse()
            .map_err(|_| BridgeError::protocol(format!("Invalid battery voltage '{}'", text)))?;
        self.battery_mv = Some(mv);
        Ok(format!("{} Battery Voltage = {} mV", device, mv))
    }

    async fn program(&mut self, program: &ProgramSettings) -> BridgeResult<String> {
        self.require_connected()?;
        let (writes, unknown) = program.writes();
        for key in unknown {
            warn!("Ignoring unknown program setting '{}'", key);
        }
        for (uuid, key, value) in writes {
            self.write_text(uuid, value).await?;
            info!("Written {}: {}", key, value);
        }
        Ok("Opto Programmed".to_string())
    }

    /// React to a notification or link loss.
    ///
    /// Events raised on any link other than the current peer's are stale and
    /// dropped.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        let current = self.peer.as_ref().map(|p| p.link);
        if current != Some(event.link()) {
            debug!(
                "Ignoring event from link {} (current {:?})",
                event.link(),
                current
            );
            return;
        }

        match event {
            TransportEvent::Notification { uuid, data, .. } => {
                if uuid.eq_ignore_ascii_case(IMU_DATA_UUID) {
                    self.on_imu_data(&data);
                } else if uuid.eq_ignore_ascii_case(DEVICE_LOG_UUID) {
                    let message = protocol::decode(&uuid, &data);
                    info!("ble_log: {}", message);
                    self.events.publish(BridgeEvent::DeviceLog(message));
                } else {
                    debug!(
                        "Notification from {}: {}",
                        protocol::characteristic_name(&uuid),
                        protocol::decode(&uuid, &data)
                    );
                }
            }
            TransportEvent::Disconnected { reason, .. } => self.on_link_lost(&reason),
        }
    }

    fn on_imu_data(&mut self, data: &[u8]) {
        let record = match protocol::parse_imu_record(data) {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping IMU notification: {}", e);
                return;
            }
        };

        self.gaps.observe(record.sample);
        let estimate = self.estimator.process(&record);

        if self.logger.is_active() {
            let row = TelemetryRow::new(&record, &estimate, self.battery_mv.take());
            if let Err(e) = self.logger.append(row) {
                error!("Failed to write IMU row: {}", e);
            }
        }

        self.events.publish(BridgeEvent::Imu(ImuUpdate {
            sample: record.sample,
            roll: estimate.roll,
            pitch: estimate.pitch,
            yaw: estimate.yaw,
        }));
    }

    fn close_session(&mut self) {
        match self.logger.stop() {
            Ok(Some(summary)) => info!(
                "Session closed: {} ({} rows)",
                summary.path.display(),
                summary.rows
            ),
            Ok(None) => {}
            Err(e) => error!("Failed to close IMU session: {}", e),
        }
    }

    fn on_link_lost(&mut self, reason: &str) {
        warn!("Device disconnected: {}", reason);
        self.close_session();
        self.peer = None;
        self.battery_mv = None;
        self.events
            .publish(BridgeEvent::Connection(ConnectionStatus::Disconnected));
        self.events.status("Device disconnected");
    }

    async fn release_connection(&mut self, why: &str) {
        self.close_session();
        let disconnect = self.transport.disconnect();
        if let Err(e) = with_timeout(self.op_timeout, "disconnect", disconnect).await {
            warn!("Disconnect ({}) failed: {}", why, e);
        }
        if self.peer.take().is_some() {
            self.events
                .publish(BridgeEvent::Connection(ConnectionStatus::Disconnected));
        }
    }

    /// Close the session and the link before the loop exits.
    pub async fn shutdown(&mut self) {
        info!("Device loop shutting down");
        self.release_connection("shutdown").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RawImuRecord;
    use crate::infrastructure::bluetooth::protocol::{AMPLITUDE_UUID, PERIOD_UUID};
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedDevice, SimulatedHandle, SimulatedPeripheral,
    };
    use crate::infrastructure::session_log::read_session_file;
    use tokio::sync::mpsc;

    const ADDRESS: &str = "C0:FF:EE:00:12:AB";

    fn settings(tag: &str) -> Settings {
        let root = std::env::temp_dir().join(format!(
            "optogrid_device_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        Settings {
            session_dir: root.join("sessions").display().to_string(),
            calibration_dir: root.join("calibration").display().to_string(),
            operation_timeout_ms: 200,
            scan_timeout_ms: 10,
            ..Settings::default()
        }
    }

    fn controller(
        tag: &str,
    ) -> (
        DeviceController<SimulatedDevice>,
        SimulatedHandle,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (device, events) =
            SimulatedDevice::new(vec![SimulatedPeripheral::optogrid("OptoGrid 7", ADDRESS)]);
        let handle = device.handle();
        (
            DeviceController::new(device, settings(tag), EventBus::default()),
            handle,
            events,
        )
    }

    async fn run(c: &mut DeviceController<SimulatedDevice>, text: &str) -> BridgeResult<String> {
        c.execute(DeviceRequest::Command(Command::parse(text)?)).await
    }

    async fn pump(
        c: &mut DeviceController<SimulatedDevice>,
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Ok(event) = rx.try_recv() {
            c.handle_event(event).await;
        }
    }

    fn imu(sample: u32) -> RawImuRecord {
        RawImuRecord {
            sample,
            accel: [0, 0, -2048],
            gyro: [0, 0, 0],
            mag: [0, 600, -600],
        }
    }

    #[test]
    fn test_address_heuristic() {
        assert!(looks_like_address("C0:FF:EE:00:12:AB"));
        assert!(looks_like_address("3F2504E0-4F89-11D3-9A0C-0305E82C3301"));
        assert!(!looks_like_address("OptoGrid 7"));
        assert!(!looks_like_address("OptoGrid"));
        assert_eq!(fallback_device_name(ADDRESS), "OptoGrid-12AB");
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let (mut c, _h, _rx) = controller("noconn");
        let err = run(&mut c, "optogrid.trigger").await.unwrap_err();
        assert_eq!(err.reply_text(), "ERROR: Not connected to device");
        assert_eq!(run(&mut c, "optogrid.status").await.unwrap(), "Disconnected");
    }

    #[tokio::test]
    async fn test_connect_by_name_and_address() {
        let (mut c, _h, _rx) = controller("connect");
        assert_eq!(
            run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap(),
            "OptoGrid 7 Connected"
        );
        assert_eq!(
            run(&mut c, "optogrid.status").await.unwrap(),
            format!("Connected to OptoGrid 7 ({})", ADDRESS)
        );

        // Direct address: name comes from the Device ID characteristic.
        assert_eq!(
            run(&mut c, &format!("optogrid.connect = {}", ADDRESS)).await.unwrap(),
            "OptoGrid 7 Connected"
        );

        let err = run(&mut c, "optogrid.connect = Nope").await.unwrap_err();
        assert_eq!(err.reply_text(), "ERROR: Device Nope not found");
    }

    #[tokio::test]
    async fn test_timeout_releases_loop() {
        let (mut c, h, _rx) = controller("timeout");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        h.set_response_delay(Duration::from_millis(1_000));
        let err = run(&mut c, "optogrid.readbattery").await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::Timeout { .. })
        ));

        h.set_response_delay(Duration::ZERO);
        assert_eq!(
            run(&mut c, "optogrid.readbattery").await.unwrap(),
            "OptoGrid 7 Battery Voltage = 3712 mV"
        );
    }

    #[tokio::test]
    async fn test_trigger_and_leds() {
        let (mut c, h, _rx) = controller("trigger");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        assert_eq!(run(&mut c, "optogrid.trigger").await.unwrap(), "Opto Triggered");
        assert_eq!(h.writes_to(TRIGGER_UUID), vec![vec![1]]);

        assert_eq!(
            run(&mut c, "optogrid.toggleStatusLED = 1").await.unwrap(),
            "Status LED turned on"
        );
        assert_eq!(
            run(&mut c, "optogrid.toggleShamLED = 0").await.unwrap(),
            "Sham LED turned off"
        );
        assert_eq!(h.writes_to(SHAM_LED_UUID), vec![vec![0]]);
    }

    #[tokio::test]
    async fn test_program_writes_in_order() {
        let (mut c, h, _rx) = controller("program");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        let program =
            ProgramSettings::parse(r#"{"amplitude": 80, "junk": 1, "period": 250}"#).unwrap();
        assert_eq!(
            c.execute(DeviceRequest::Program(program)).await.unwrap(),
            "Opto Programmed"
        );
        let writes: Vec<String> = h.writes().into_iter().map(|(u, _)| u).collect();
        assert_eq!(writes, vec![AMPLITUDE_UUID.to_string(), PERIOD_UUID.to_string()]);
        assert_eq!(h.writes_to(PERIOD_UUID), vec![vec![250, 0]]);

        let bad = ProgramSettings::parse(r#"{"amplitude": 300}"#).unwrap();
        let err = c.execute(DeviceRequest::Program(bad)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Codec(_)));
    }

    #[tokio::test]
    async fn test_gatt_read_and_write() {
        let (mut c, _h, _rx) = controller("gatt");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        assert_eq!(
            run(&mut c, &format!("optogrid.gattread = {}", BATTERY_VOLTAGE_UUID))
                .await
                .unwrap(),
            "Battery Voltage: 3712"
        );
        assert_eq!(
            run(&mut c, &format!("optogrid.gattwrite = {}, 42", AMPLITUDE_UUID))
                .await
                .unwrap(),
            "Amplitude written"
        );

        let table = run(&mut c, "optogrid.gattread").await.unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "Service,Characteristic,UUID,Value,Unit");
        assert_eq!(lines.len(), CHARACTERISTICS.len() + 1);
        let amplitude = "Opto Control,Amplitude,56781605-5678-1234-1234-5678abcdeff0,42,percent";
        assert!(lines.contains(&amplitude));
    }

    #[tokio::test]
    async fn test_end_to_end_session() {
        let (mut c, h, mut rx) = controller("e2e");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        assert_eq!(
            run(&mut c, "optogrid.startIMULog = M1, 4").await.unwrap(),
            "IMU enabled, and logging started"
        );
        let path = c.session_path().unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("M1_4_OptoGrid-7_"));

        for i in 0..150 {
            assert!(h.send_imu(&imu(i + 1)));
        }
        pump(&mut c, &mut rx).await;

        assert_eq!(
            run(&mut c, "optogrid.disableIMU").await.unwrap(),
            "IMU disabled, and logging stopped"
        );
        assert_eq!(h.writes_to(IMU_ENABLE_UUID), vec![vec![1], vec![0]]);

        let rows = read_session_file(&path).unwrap();
        assert_eq!(rows.len(), 150);
        let samples: Vec<u32> = rows.iter().map(|r| r.sample).collect();
        assert!(samples.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(rows[0].raw[2], -2048);
        assert!(rows.iter().all(|r| r.uncertainty.is_some()));
    }

    #[tokio::test]
    async fn test_disconnect_flushes_session() {
        let (mut c, h, mut rx) = controller("drop");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        run(&mut c, "optogrid.enableIMU").await.unwrap();
        run(&mut c, "optogrid.readbattery").await.unwrap();
        let path = c.session_path().unwrap();

        for i in 0..30 {
            h.send_imu(&imu(i));
        }
        pump(&mut c, &mut rx).await;
        assert_eq!(run(&mut c, "optogrid.sync = 7").await.unwrap(), "Sync Written");

        h.drop_link("out of range");
        pump(&mut c, &mut rx).await;

        assert!(!c.is_logging());
        assert!(!c.is_connected());
        assert_eq!(run(&mut c, "optogrid.status").await.unwrap(), "Disconnected");

        let rows = read_session_file(&path).unwrap();
        assert_eq!(rows.len(), 30);
        // Battery cache lands on the first row only.
        assert_eq!(rows[0].battery_mv, Some(3712));
        assert_eq!(rows[1].battery_mv, None);
        assert_eq!(rows[29].sync, 7);
    }

    #[tokio::test]
    async fn test_stale_link_events_after_reconnect() {
        let (mut c, h, mut rx) = controller("stale");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        h.send_imu(&imu(1));
        // Link loss and a notification stay queued while the reconnect runs.
        h.drop_link("out of range");

        assert_eq!(
            run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap(),
            "OptoGrid 7 Connected"
        );
        run(&mut c, "optogrid.enableIMU").await.unwrap();
        h.send_imu(&imu(500));
        pump(&mut c, &mut rx).await;

        assert!(c.is_connected());
        assert!(c.is_logging());
        assert_eq!(c.estimator().records_processed(), 1);
        assert_eq!(
            run(&mut c, "optogrid.status").await.unwrap(),
            format!("Connected to OptoGrid 7 ({})", ADDRESS)
        );

        let path = c.session_path().unwrap();
        run(&mut c, "optogrid.disableIMU").await.unwrap();
        let rows = read_session_file(&path).unwrap();
        assert_eq!(rows.iter().map(|r| r.sample).collect::<Vec<_>>(), vec![500]);
    }

    #[tokio::test]
    async fn test_trigger_marks_newest_row() {
        let (mut c, h, mut rx) = controller("trigger_sync");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();

        // No rows yet: the trigger still fires.
        assert_eq!(run(&mut c, "optogrid.trigger").await.unwrap(), "Opto Triggered");

        run(&mut c, "optogrid.enableIMU").await.unwrap();
        let path = c.session_path().unwrap();
        for i in 1..=5 {
            h.send_imu(&imu(i));
        }
        pump(&mut c, &mut rx).await;
        assert_eq!(run(&mut c, "optogrid.trigger").await.unwrap(), "Opto Triggered");
        run(&mut c, "optogrid.disableIMU").await.unwrap();

        let syncs: Vec<i64> = read_session_file(&path)
            .unwrap()
            .iter()
            .map(|r| r.sync)
            .collect();
        assert_eq!(syncs, vec![0, 0, 0, 0, 65_536]);
    }

    #[tokio::test]
    async fn test_rejected_write_reports_error() {
        let (mut c, h, _rx) = controller("fail_writes");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        h.set_fail_writes(true);

        let err = run(&mut c, "optogrid.trigger").await.unwrap_err();
        assert_eq!(
            err.reply_text(),
            format!("ERROR: GATT write to {} rejected", TRIGGER_UUID)
        );
        let program = ProgramSettings::parse(r#"{"amplitude": 80, "period": 250}"#).unwrap();
        assert!(c.execute(DeviceRequest::Program(program)).await.is_err());
        assert!(h.writes().is_empty());

        h.set_fail_writes(false);
        assert_eq!(run(&mut c, "optogrid.trigger").await.unwrap(), "Opto Triggered");
    }

    #[tokio::test]
    async fn test_failed_connect_publishes_error() {
        let (device, _events) =
            SimulatedDevice::new(vec![SimulatedPeripheral::optogrid("OptoGrid 7", ADDRESS)]);
        let bus = EventBus::default();
        let mut updates = bus.subscribe();
        let mut c = DeviceController::new(device, settings("connect_error"), bus);

        assert!(run(&mut c, "optogrid.connect = Nope").await.is_err());
        let mut statuses = Vec::new();
        while let Ok(event) = updates.try_recv() {
            if let BridgeEvent::Connection(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_calibration_loaded_at_connect() {
        let (device, _events) =
            SimulatedDevice::new(vec![SimulatedPeripheral::optogrid("OptoGrid 7", ADDRESS)]);
        let bus = EventBus::default();
        let mut updates = bus.subscribe();
        let settings = settings("calibration");
        let dir = std::path::PathBuf::from(&settings.calibration_dir);
        let mut c = DeviceController::new(device, settings, bus);

        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        assert!(c.estimator().calibration().is_identity());
        let mut messages = Vec::new();
        while let Ok(event) = updates.try_recv() {
            if let BridgeEvent::Status(text) = event {
                messages.push(text);
            }
        }
        let expected = "OptoGrid 7: no magnetometer calibration, using identity";
        assert!(messages.iter().any(|m| m == expected));

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            calibration::calibration_path(&dir, "OptoGrid 7"),
            "mag_x,mag_y,mag_z\n-100,-50,0\n100,150,40\n",
        )
        .unwrap();
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        let model = c.estimator().calibration();
        assert!(!model.is_identity());
        assert_eq!(model.offset, [0.0, 50.0, 20.0]);
    }

    #[tokio::test]
    async fn test_malformed_imu_is_skipped() {
        let (mut c, h, mut rx) = controller("malformed");
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        h.notify(IMU_DATA_UUID, vec![0u8; 21]);
        h.send_imu(&imu(1));
        h.send_imu(&imu(2));
        pump(&mut c, &mut rx).await;
        assert_eq!(c.estimator().records_processed(), 2);
        assert_eq!(c.sample_gaps(), 0);
    }

    #[tokio::test]
    async fn test_sample_rate_follows_device() {
        let (device, _events) =
            SimulatedDevice::new(vec![SimulatedPeripheral::optogrid("OptoGrid 7", ADDRESS)]);
        device.handle().set_value(IMU_SAMPLE_RATE_UUID, vec![50]);
        let mut c = DeviceController::new(device, settings("rate"), EventBus::default());
        run(&mut c, "optogrid.connect = OptoGrid 7").await.unwrap();
        assert_eq!(c.estimator().sample_rate_hz(), 50);
    }
}
