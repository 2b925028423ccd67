use anyhow::{bail, Context, Result};
use optogrid_bridge::application::{
    spawn_device_loop, CommandDispatcher, DeviceController, TriggerBridge,
};
use optogrid_bridge::domain::calibration::{parse_calibration_csv, trim_samples};
use optogrid_bridge::domain::models::{EventBus, RawImuRecord};
use optogrid_bridge::domain::settings::{Settings, SettingsService};
use optogrid_bridge::infrastructure::bluetooth::{
    SimulatedDevice, SimulatedHandle, SimulatedPeripheral,
};
use optogrid_bridge::infrastructure::ipc::{self, BridgeClient};
use optogrid_bridge::infrastructure::logging::init_logger;
use optogrid_bridge::infrastructure::session_log::read_session_file;
use std::io::BufRead;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tracing::{info, warn};

const USAGE: &str = "usage: optogrid_bridge [send <command> | program <json> | subscribe \
                     | trim-calibration <csv> <samples> | inspect-session <parquet>]";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let service = SettingsService::new().context("Failed to locate the settings file")?;
    let settings = service.get().clone();

    match args.first().map(String::as_str) {
        None => run_bridge(settings, service.path()),
        Some("send") => {
            let command = args[1..].join(" ");
            if command.is_empty() {
                bail!(USAGE);
            }
            let mut client = BridgeClient::connect(&settings.request_socket)?;
            println!("{}", client.request(&command)?);
            Ok(())
        }
        Some("program") => {
            let payload = args.get(1).context(USAGE)?;
            let payload: serde_json::Value =
                serde_json::from_str(payload).context("Program payload is not valid JSON")?;
            let mut client = BridgeClient::connect(&settings.request_socket)?;
            println!("{}", client.program(&payload)?);
            Ok(())
        }
        Some("subscribe") => {
            for line in ipc::client::subscribe(&settings.publish_socket)? {
                println!("{}", line?);
            }
            Ok(())
        }
        Some("trim-calibration") => {
            let (Some(path), Some(target)) = (args.get(1), args.get(2)) else {
                bail!(USAGE);
            };
            let target: usize = target.parse().context("Sample count must be a number")?;
            trim_calibration(path, target)
        }
        Some("inspect-session") => {
            let path = args.get(1).context(USAGE)?;
            inspect_session(Path::new(path))
        }
        Some(_) => bail!(USAGE),
    }
}

fn run_bridge(settings: Settings, settings_path: &Path) -> Result<()> {
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting OptoGrid bridge (settings: {})", settings_path.display());

    let bus = EventBus::default();
    ipc::spawn_publisher(&settings.publish_socket, &bus)?;

    let (sim_tx, sim_rx) = std_mpsc::channel();
    let loop_settings = settings.clone();
    let loop_bus = bus.clone();
    let (device, _device_thread) = spawn_device_loop(move || {
        let (transport, events) = SimulatedDevice::new(vec![SimulatedPeripheral::optogrid(
            "OptoGrid 1",
            "C0:FF:EE:00:00:01",
        )]);
        let _ = sim_tx.send(transport.handle());
        (DeviceController::new(transport, loop_settings, loop_bus), events)
    })?;
    let sim = sim_rx
        .recv()
        .context("Device loop exited before the transport was ready")?;

    spawn_imu_stream(sim, settings.default_sample_rate_hz)?;

    let trigger = TriggerBridge::new(
        device.clone(),
        Duration::from_millis(settings.trigger_debounce_ms),
    );
    std::thread::Builder::new()
        .name("trigger-input".to_string())
        .spawn(move || {
            // Each line on stdin is one trigger edge.
            for line in std::io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                trigger.on_edge();
            }
        })?;

    let mut dispatcher = CommandDispatcher::new(device);
    ipc::serve_requests(&settings.request_socket, &mut dispatcher)
}

/// Stream a slowly turning, level IMU while the simulated device is connected.
fn spawn_imu_stream(sim: SimulatedHandle, rate_hz: u32) -> Result<()> {
    let period = Duration::from_micros(1_000_000 / u64::from(rate_hz.max(1)));
    std::thread::Builder::new()
        .name("imu-stream".to_string())
        .spawn(move || {
            let mut sample: u32 = 0;
            loop {
                if !sim.is_connected() {
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                sample = sample.wrapping_add(1);
                let record = RawImuRecord {
                    sample,
                    accel: [0, 0, -2048],
                    gyro: [0, 0, -160],
                    mag: [0, 600, -600],
                };
                sim.send_imu(&record);
                std::thread::sleep(period);
            }
        })?;
    Ok(())
}

fn trim_calibration(path: &str, target: usize) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let samples = parse_calibration_csv(&contents)?;
    let trimmed = trim_samples(&samples, target);
    if trimmed.len() == samples.len() {
        warn!("{} has {} samples, nothing to trim", path, samples.len());
    }

    println!("mag_x,mag_y,mag_z");
    for s in &trimmed {
        println!("{},{},{}", s[0], s[1], s[2]);
    }
    eprintln!("{} -> {} samples", samples.len(), trimmed.len());
    Ok(())
}

fn inspect_session(path: &Path) -> Result<()> {
    let rows = read_session_file(path)?;
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        println!("{}: no rows", path.display());
        return Ok(());
    };
    let syncs: Vec<String> = rows
        .iter()
        .filter(|r| r.sync != 0)
        .map(|r| format!("{}={}", r.sample, r.sync))
        .collect();
    println!(
        "{}: {} rows, samples {}..={}, final yaw {:.1}",
        path.display(),
        rows.len(),
        first.sample,
        last.sample,
        last.yaw
    );
    if !syncs.is_empty() {
        println!("sync marks: {}", syncs.join(", "));
    }
    Ok(())
}
