use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "optogrid_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Noise parameters of the orientation filter (variances).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default = "default_var_acc")]
    pub var_acc: f64,
    #[serde(default = "default_var_gyro")]
    pub var_gyro: f64,
    #[serde(default = "default_var_mag")]
    pub var_mag: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            var_acc: default_var_acc(),
            var_gyro: default_var_gyro(),
            var_mag: default_var_mag(),
        }
    }
}

fn default_var_acc() -> f64 {
    0.0001
}
fn default_var_gyro() -> f64 {
    10.0
}
fn default_var_mag() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // External channels
    #[serde(default = "default_request_socket")]
    pub request_socket: String,
    #[serde(default = "default_publish_socket")]
    pub publish_socket: String,

    // Data locations
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
    #[serde(default = "default_calibration_dir")]
    pub calibration_dir: String,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    // Device operations
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_scan_name_filter")]
    pub scan_name_filter: String,

    // Trigger input
    #[serde(default = "default_trigger_debounce_ms")]
    pub trigger_debounce_ms: u64,
    #[serde(default = "default_trigger_sync_value")]
    pub trigger_sync_value: i64,

    // Orientation
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,
    #[serde(default = "default_sample_rate_hz")]
    pub default_sample_rate_hz: u32,
    #[serde(default)]
    pub filter: FilterSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_socket: default_request_socket(),
            publish_socket: default_publish_socket(),
            session_dir: default_session_dir(),
            calibration_dir: default_calibration_dir(),
            flush_threshold: default_flush_threshold(),
            operation_timeout_ms: default_operation_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
            scan_name_filter: default_scan_name_filter(),
            trigger_debounce_ms: default_trigger_debounce_ms(),
            trigger_sync_value: default_trigger_sync_value(),
            smoothing_alpha: default_smoothing_alpha(),
            default_sample_rate_hz: default_sample_rate_hz(),
            filter: FilterSettings::default(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_request_socket() -> String {
    "optogrid_bridge.req".to_string()
}
fn default_publish_socket() -> String {
    "optogrid_bridge.pub".to_string()
}
fn default_session_dir() -> String {
    "data/imu_session".to_string()
}
fn default_calibration_dir() -> String {
    "data".to_string()
}
fn default_flush_threshold() -> usize {
    100
}
fn default_operation_timeout_ms() -> u64 {
    10_000
}
fn default_scan_timeout_ms() -> u64 {
    4_000
}
fn default_scan_name_filter() -> String {
    "O".to_string()
}
fn default_trigger_debounce_ms() -> u64 {
    200
}
fn default_trigger_sync_value() -> i64 {
    65_536
}
fn default_smoothing_alpha() -> f64 {
    1.0
}
fn default_sample_rate_hz() -> u32 {
    100
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("OptoGridBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
