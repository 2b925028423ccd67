//! OptoGrid GATT Protocol
//!
//! This module contains the characteristic table shared with the device
//! firmware and the byte-level codec for every characteristic type.
//! The table is the wire contract: byte layouts here must not drift.

use crate::domain::error::{BridgeError, CodecError};
use crate::domain::models::RawImuRecord;
use tracing::trace;

/// Device Info service
pub const DEVICE_INFO_SERVICE_UUID: &str = "56781400-5678-1234-1234-5678abcdeff0";
/// Opto Control service
pub const OPTO_CONTROL_SERVICE_UUID: &str = "56781401-5678-1234-1234-5678abcdeff0";
/// Data Streaming service
pub const DATA_STREAMING_SERVICE_UUID: &str = "56781402-5678-1234-1234-5678abcdeff0";
/// Nordic Secure DFU service
pub const SECURE_DFU_SERVICE_UUID: &str = "0000fe59-0000-1000-8000-00805f9b34fb";

pub const DEVICE_ID_UUID: &str = "56781500-5678-1234-1234-5678abcdeff0";
pub const FIRMWARE_VERSION_UUID: &str = "56781501-5678-1234-1234-5678abcdeff0";
pub const HARDWARE_VERSION_UUID: &str = "56781502-5678-1234-1234-5678abcdeff0";
pub const ULED_COLOR_UUID: &str = "56781503-5678-1234-1234-5678abcdeff0";
pub const ULED_CHECK_UUID: &str = "56781504-5678-1234-1234-5678abcdeff0";
pub const BATTERY_LEVEL_UUID: &str = "56781505-5678-1234-1234-5678abcdeff0";
pub const BATTERY_VOLTAGE_UUID: &str = "56781506-5678-1234-1234-5678abcdeff0";
pub const STATUS_LED_UUID: &str = "56781507-5678-1234-1234-5678abcdeff0";
pub const SHAM_LED_UUID: &str = "56781508-5678-1234-1234-5678abcdeff0";
pub const DEVICE_LOG_UUID: &str = "56781509-5678-1234-1234-5678abcdeff0";
pub const LAST_STIM_TIME_UUID: &str = "5678150a-5678-1234-1234-5678abcdeff0";

pub const SEQUENCE_LENGTH_UUID: &str = "56781600-5678-1234-1234-5678abcdeff0";
pub const LED_SELECTION_UUID: &str = "56781601-5678-1234-1234-5678abcdeff0";
pub const DURATION_UUID: &str = "56781602-5678-1234-1234-5678abcdeff0";
pub const PERIOD_UUID: &str = "56781603-5678-1234-1234-5678abcdeff0";
pub const PULSE_WIDTH_UUID: &str = "56781604-5678-1234-1234-5678abcdeff0";
pub const AMPLITUDE_UUID: &str = "56781605-5678-1234-1234-5678abcdeff0";
pub const PWM_FREQUENCY_UUID: &str = "56781606-5678-1234-1234-5678abcdeff0";
pub const RAMP_UP_UUID: &str = "56781607-5678-1234-1234-5678abcdeff0";
pub const RAMP_DOWN_UUID: &str = "56781608-5678-1234-1234-5678abcdeff0";
pub const TRIGGER_UUID: &str = "56781609-5678-1234-1234-5678abcdeff0";

pub const IMU_ENABLE_UUID: &str = "56781700-5678-1234-1234-5678abcdeff0";
pub const IMU_SAMPLE_RATE_UUID: &str = "56781701-5678-1234-1234-5678abcdeff0";
pub const IMU_RESOLUTION_UUID: &str = "56781702-5678-1234-1234-5678abcdeff0";
pub const IMU_DATA_UUID: &str = "56781703-5678-1234-1234-5678abcdeff0";

pub const BUTTONLESS_DFU_UUID: &str = "8ec90003-f315-4f60-9fb8-838830daea50";

/// IMU Data notification length: u32 counter + 9 x i16
pub const IMU_RECORD_LEN: usize = 22;

/// Display value returned when bytes cannot be decoded.
pub const DECODE_ERROR: &str = "<decode error>";

/// Semantic type tag of a characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    U8,
    U16,
    U32,
    U64,
    /// uint32 counter followed by nine int16 axis values
    ImuRecord,
    /// Fallback for identifiers missing from the table
    Hex,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::ImuRecord => "uint32+int16[9]",
            Self::Hex => "hex",
        }
    }

    fn width(&self) -> Option<usize> {
        match self {
            Self::U8 | Self::Bool => Some(1),
            Self::U16 => Some(2),
            Self::U32 => Some(4),
            Self::U64 => Some(8),
            Self::ImuRecord => Some(IMU_RECORD_LEN),
            Self::String | Self::Hex => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: &'static str,
    pub name: &'static str,
    pub kind: ValueKind,
    pub unit: &'static str,
}

const fn characteristic(
    uuid: &'static str,
    name: &'static str,
    kind: ValueKind,
    unit: &'static str,
) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        uuid,
        name,
        kind,
        unit,
    }
}

/// Every characteristic exposed by the firmware.
pub static CHARACTERISTICS: &[CharacteristicDescriptor] = &[
    // Device Info
    characteristic(DEVICE_ID_UUID, "Device ID", ValueKind::String, ""),
    characteristic(FIRMWARE_VERSION_UUID, "Firmware Version", ValueKind::String, ""),
    characteristic(HARDWARE_VERSION_UUID, "Hardware Version", ValueKind::String, ""),
    characteristic(ULED_COLOR_UUID, "uLED Color", ValueKind::String, ""),
    characteristic(ULED_CHECK_UUID, "uLED Check", ValueKind::U64, ""),
    characteristic(BATTERY_LEVEL_UUID, "Battery Level", ValueKind::U16, "percent"),
    characteristic(BATTERY_VOLTAGE_UUID, "Battery Voltage", ValueKind::U16, "mV"),
    characteristic(STATUS_LED_UUID, "Status LED state", ValueKind::Bool, ""),
    characteristic(SHAM_LED_UUID, "Sham LED state", ValueKind::Bool, ""),
    characteristic(DEVICE_LOG_UUID, "Device Log", ValueKind::String, ""),
    characteristic(LAST_STIM_TIME_UUID, "Last Stim Time", ValueKind::U32, "ms"),
    // Opto Control
    characteristic(SEQUENCE_LENGTH_UUID, "Sequence Length", ValueKind::U8, "units"),
    characteristic(LED_SELECTION_UUID, "LED Selection", ValueKind::U64, "bitmap"),
    characteristic(DURATION_UUID, "Duration", ValueKind::U16, "ms"),
    characteristic(PERIOD_UUID, "Period", ValueKind::U16, "ms"),
    characteristic(PULSE_WIDTH_UUID, "Pulse Width", ValueKind::U16, "ms"),
    characteristic(AMPLITUDE_UUID, "Amplitude", ValueKind::U8, "percent"),
    characteristic(PWM_FREQUENCY_UUID, "PWM Frequency", ValueKind::U32, "Hz"),
    characteristic(RAMP_UP_UUID, "Ramp Up Time", ValueKind::U16, "ms"),
    characteristic(RAMP_DOWN_UUID, "Ramp Down Time", ValueKind::U16, "ms"),
    characteristic(TRIGGER_UUID, "Trigger", ValueKind::Bool, ""),
    // IMU
    characteristic(IMU_ENABLE_UUID, "IMU Enable", ValueKind::Bool, ""),
    characteristic(IMU_SAMPLE_RATE_UUID, "IMU Sample Rate", ValueKind::U8, "Hz"),
    characteristic(IMU_RESOLUTION_UUID, "IMU Resolution", ValueKind::U8, "g"),
    characteristic(IMU_DATA_UUID, "IMU Data", ValueKind::ImuRecord, ""),
    // Secure DFU
    characteristic(
        BUTTONLESS_DFU_UUID,
        "Buttonless DFU Without Bonds",
        ValueKind::Bool,
        "",
    ),
];

/// Look up a characteristic by UUID (case-insensitive).
pub fn descriptor(uuid: &str) -> Option<&'static CharacteristicDescriptor> {
    let uuid = uuid.trim();
    CHARACTERISTICS
        .iter()
        .find(|c| c.uuid.eq_ignore_ascii_case(uuid))
}

/// Human-readable name, or "Unknown Characteristic".
pub fn characteristic_name(uuid: &str) -> &'static str {
    descriptor(uuid).map_or("Unknown Characteristic", |c| c.name)
}

/// Name of the GATT service a characteristic belongs to.
pub fn service_name(uuid: &str) -> &'static str {
    let uuid = uuid.trim().to_ascii_lowercase();
    if uuid.starts_with("567815") {
        "Device Info"
    } else if uuid.starts_with("567816") {
        "Opto Control"
    } else if uuid.starts_with("567817") {
        "Data Streaming"
    } else if uuid == BUTTONLESS_DFU_UUID {
        "Secure DFU"
    } else {
        "Unknown Service"
    }
}

pub fn kind_of(uuid: &str) -> ValueKind {
    descriptor(uuid).map_or(ValueKind::Hex, |c| c.kind)
}

/// Decode characteristic bytes into their display text.
///
/// Never fails: malformed input for a known type yields [`DECODE_ERROR`].
pub fn decode(uuid: &str, data: &[u8]) -> String {
    match decode_as(kind_of(uuid), data) {
        Ok(text) => text,
        Err(e) => {
            trace!("decode failed for {}: {}", uuid, e);
            DECODE_ERROR.to_string()
        }
    }
}

/// Decode bytes against an explicit type tag.
pub fn decode_as(kind: ValueKind, data: &[u8]) -> Result<String, CodecError> {
    if let Some(width) = kind.width() {
        if data.len() < width {
            return Err(CodecError::Decode {
                len: data.len(),
                target_type: kind.as_str().to_string(),
            });
        }
    }

    let text = match kind {
        ValueKind::String => std::str::from_utf8(data)
            .map_err(|_| CodecError::Decode {
                len: data.len(),
                target_type: kind.as_str().to_string(),
            })?
            .trim_end_matches('\0')
            .to_string(),
        ValueKind::Bool => (if data[0] == 1 { "True" } else { "False" }).to_string(),
        ValueKind::U8 => data[0].to_string(),
        ValueKind::U16 => u16::from_le_bytes([data[0], data[1]]).to_string(),
        ValueKind::U32 => read_u32(data).to_string(),
        ValueKind::U64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[..8]);
            u64::from_le_bytes(buf).to_string()
        }
        ValueKind::ImuRecord => {
            let record = read_imu_record(data);
            let axes: Vec<String> = record.axes().iter().map(|v| v.to_string()).collect();
            format!("{}, {}", record.sample, axes.join(", "))
        }
        ValueKind::Hex => to_hex(data),
    };

    Ok(text)
}

/// Encode display text into characteristic bytes.
pub fn encode(uuid: &str, value: &str) -> Result<Vec<u8>, CodecError> {
    encode_as(kind_of(uuid), value)
}

pub fn encode_as(kind: ValueKind, value: &str) -> Result<Vec<u8>, CodecError> {
    let err = || CodecError::Encode {
        value: value.to_string(),
        target_type: kind.as_str().to_string(),
    };
    let text = value.trim();

    let bytes = match kind {
        ValueKind::String => value.as_bytes().to_vec(),
        ValueKind::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => vec![1],
            "false" | "0" | "no" | "off" => vec![0],
            _ => return Err(err()),
        },
        ValueKind::U8 => vec![text.parse::<u8>().map_err(|_| err())?],
        ValueKind::U16 => text.parse::<u16>().map_err(|_| err())?.to_le_bytes().to_vec(),
        ValueKind::U32 => text.parse::<u32>().map_err(|_| err())?.to_le_bytes().to_vec(),
        ValueKind::U64 => text.parse::<u64>().map_err(|_| err())?.to_le_bytes().to_vec(),
        ValueKind::ImuRecord => {
            let fields: Vec<&str> = text.split(',').map(str::trim).collect();
            if fields.len() != 10 {
                return Err(err());
            }
            let mut bytes = Vec::with_capacity(IMU_RECORD_LEN);
            bytes.extend_from_slice(&fields[0].parse::<u32>().map_err(|_| err())?.to_le_bytes());
            for field in &fields[1..] {
                bytes.extend_from_slice(&field.parse::<i16>().map_err(|_| err())?.to_le_bytes());
            }
            bytes
        }
        ValueKind::Hex => from_hex(text).ok_or_else(err)?,
    };

    Ok(bytes)
}

/// Parse an IMU Data notification.
///
/// # Data Packet Structure (22 bytes)
///
/// ```text
/// [0-3]   : Sample counter (u32 little-endian)
/// [4-9]   : Accel X, Y, Z (i16 little-endian)
/// [10-15] : Gyro X, Y, Z
/// [16-21] : Mag X, Y, Z
/// ```
pub fn parse_imu_record(bytes: &[u8]) -> Result<RawImuRecord, BridgeError> {
    if bytes.len() != IMU_RECORD_LEN {
        return Err(BridgeError::protocol(format!(
            "Invalid IMU packet size: {} (expected {})",
            bytes.len(),
            IMU_RECORD_LEN
        )));
    }
    Ok(read_imu_record(bytes))
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

fn read_imu_record(bytes: &[u8]) -> RawImuRecord {
    let axis = |i: usize| i16::from_le_bytes([bytes[4 + 2 * i], bytes[5 + 2 * i]]);
    RawImuRecord {
        sample: read_u32(bytes),
        accel: [axis(0), axis(1), axis(2)],
        gyro: [axis(3), axis(4), axis(5)],
        mag: [axis(6), axis(7), axis(8)],
    }
}

/// Serialize a record back into its 22-byte notification form.
pub fn imu_record_bytes(record: &RawImuRecord) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(IMU_RECORD_LEN);
    bytes.extend_from_slice(&record.sample.to_le_bytes());
    for v in record.axes() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
