//! Command grammar of the external request/reply channel.
//!
//! A request is `[optogrid.]<opcode>[ = <payload>]`. The opcode is matched
//! exactly (ASCII case-insensitive) against [`OPCODES`], whose order is the
//! documented precedence; the payload is parsed per opcode into a typed
//! [`Command`].

use crate::domain::error::{BridgeError, BridgeResult};
use crate::infrastructure::bluetooth::protocol::{
    AMPLITUDE_UUID, DURATION_UUID, LED_SELECTION_UUID, PERIOD_UUID, PULSE_WIDTH_UUID,
    PWM_FREQUENCY_UUID, RAMP_DOWN_UUID, RAMP_UP_UUID, SEQUENCE_LENGTH_UUID,
};
use serde_json::{Map, Value};

pub const COMMAND_PREFIX: &str = "optogrid.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Connect,
    Trigger,
    Scan,
    Status,
    GattRead,
    GattWrite,
    EnableImu,
    StartImuLog,
    DisableImu,
    StopImuLog,
    ReadBattery,
    ReadUledCheck,
    ReadLastStim,
    Sync,
    ToggleStatusLed,
    ToggleShamLed,
    Program,
}

/// Opcode keywords in precedence order.
pub const OPCODES: &[(&str, Opcode)] = &[
    ("connect", Opcode::Connect),
    ("trigger", Opcode::Trigger),
    ("scan", Opcode::Scan),
    ("status", Opcode::Status),
    ("gattread", Opcode::GattRead),
    ("gattwrite", Opcode::GattWrite),
    ("enableIMU", Opcode::EnableImu),
    ("startIMULog", Opcode::StartImuLog),
    ("disableIMU", Opcode::DisableImu),
    ("stopIMULog", Opcode::StopImuLog),
    ("readbattery", Opcode::ReadBattery),
    ("readULEDCheck", Opcode::ReadUledCheck),
    ("readlastStim", Opcode::ReadLastStim),
    ("sync", Opcode::Sync),
    ("toggleStatusLED", Opcode::ToggleStatusLed),
    ("toggleShamLED", Opcode::ToggleShamLed),
    ("program", Opcode::Program),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { device: String },
    Trigger,
    Scan,
    Status,
    /// `None` reads the whole table
    GattRead { uuid: Option<String> },
    GattWrite { uuid: String, value: String },
    /// Enable streaming and open a session. Ids are absent for plain `enableIMU`.
    StartLogging {
        subject_id: Option<String>,
        session_id: Option<String>,
    },
    StopLogging,
    ReadBattery,
    ReadUledCheck,
    ReadLastStim,
    Sync { value: i64 },
    ToggleStatusLed { on: bool },
    ToggleShamLed { on: bool },
    /// First phase of the program handshake
    Program,
    Unknown(String),
}

/// Split a request into its opcode and optional payload.
///
/// Returns `None` when the opcode is not in [`OPCODES`].
pub fn tokenize(text: &str) -> Option<(Opcode, Option<&str>)> {
    let text = text.trim();
    let body = strip_prefix_ignore_case(text, COMMAND_PREFIX).unwrap_or(text);
    let (word, payload) = match body.split_once('=') {
        Some((word, payload)) => (word.trim(), Some(payload.trim())),
        None => (body.trim(), None),
    };

    OPCODES
        .iter()
        .find(|(keyword, _)| keyword.eq_ignore_ascii_case(word))
        .map(|(_, opcode)| (*opcode, payload))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

impl Command {
    /// Parse one request line.
    ///
    /// Unknown opcodes become [`Command::Unknown`]; a known opcode with a
    /// malformed payload is a protocol error.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let Some((opcode, payload)) = tokenize(text) else {
            return Ok(Self::Unknown(text.trim().to_string()));
        };
        let payload = payload.filter(|p| !p.is_empty());

        let command = match opcode {
            Opcode::Connect => Self::Connect {
                device: payload
                    .ok_or_else(|| {
                        BridgeError::protocol("connect requires a device name or address")
                    })?
                    .to_string(),
            },
            Opcode::Trigger => Self::Trigger,
            Opcode::Scan => Self::Scan,
            Opcode::Status => Self::Status,
            Opcode::GattRead => Self::GattRead {
                uuid: payload.map(str::to_string),
            },
            Opcode::GattWrite => {
                let (uuid, value) = payload
                    .and_then(|p| p.split_once(','))
                    .ok_or_else(|| BridgeError::protocol("gattwrite expects '<uuid>, <value>'"))?;
                Self::GattWrite {
                    uuid: uuid.trim().to_string(),
                    value: value.trim().to_string(),
                }
            }
            Opcode::EnableImu => Self::StartLogging {
                subject_id: None,
                session_id: None,
            },
            Opcode::StartImuLog => {
                let params: Vec<&str> = payload
                    .map(|p| p.split(',').map(str::trim).collect())
                    .unwrap_or_default();
                let [subject, session] = params.as_slice() else {
                    return Err(BridgeError::protocol(format!(
                        "Invalid startIMULog parameters: expected 'subject, session', got {} value(s)",
                        params.len()
                    )));
                };
                Self::StartLogging {
                    subject_id: Some(subject.to_string()),
                    session_id: Some(session.to_string()),
                }
            }
            Opcode::DisableImu | Opcode::StopImuLog => Self::StopLogging,
            Opcode::ReadBattery => Self::ReadBattery,
            Opcode::ReadUledCheck => Self::ReadUledCheck,
            Opcode::ReadLastStim => Self::ReadLastStim,
            Opcode::Sync => {
                let raw = payload
                    .ok_or_else(|| BridgeError::protocol("sync requires an integer value"))?;
                let value = raw.parse::<i64>().map_err(|e| {
                    BridgeError::protocol(format!("Invalid sync value '{}': {}", raw, e))
                })?;
                Self::Sync { value }
            }
            Opcode::ToggleStatusLed => Self::ToggleStatusLed {
                on: parse_switch("toggleStatusLED", payload)?,
            },
            Opcode::ToggleShamLed => Self::ToggleShamLed {
                on: parse_switch("toggleShamLED", payload)?,
            },
            Opcode::Program => Self::Program,
        };
        Ok(command)
    }
}

fn parse_switch(name: &str, payload: Option<&str>) -> BridgeResult<bool> {
    match payload.map(|p| p.parse::<i64>()) {
        Some(Ok(0)) => Ok(false),
        Some(Ok(1)) => Ok(true),
        Some(Ok(other)) => Err(BridgeError::protocol(format!(
            "Invalid value for {}: {} (expected 0 or 1)",
            name, other
        ))),
        Some(Err(e)) => Err(BridgeError::protocol(format!("Invalid value for {}: {}", name, e))),
        None => Err(BridgeError::protocol(format!("{} requires a value of 0 or 1", name))),
    }
}

/// Program payload keys and the characteristic each one writes.
pub const PROGRAM_KEYS: &[(&str, &str)] = &[
    ("sequence_length", SEQUENCE_LENGTH_UUID),
    ("led_selection", LED_SELECTION_UUID),
    ("duration", DURATION_UUID),
    ("period", PERIOD_UUID),
    ("pulse_width", PULSE_WIDTH_UUID),
    ("amplitude", AMPLITUDE_UUID),
    ("pwm_frequency", PWM_FREQUENCY_UUID),
    ("ramp_up", RAMP_UP_UUID),
    ("ramp_down", RAMP_DOWN_UUID),
];

pub fn program_key_uuid(key: &str) -> Option<&'static str> {
    PROGRAM_KEYS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, uuid)| *uuid)
}

/// Second phase of the program handshake: stimulation parameters in payload order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramSettings {
    pub entries: Vec<(String, String)>,
}

impl ProgramSettings {
    /// Parse a JSON object, or a Python-style dict literal as a fallback.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let text = text.trim();
        let object: Map<String, Value> = match serde_json::from_str(text) {
            Ok(object) => object,
            Err(first) => serde_json::from_str(&python_literal_to_json(text)).map_err(|_| {
                BridgeError::protocol(format!("Invalid program data: {}", first))
            })?,
        };

        let entries = object
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    Value::Bool(true) => "True".to_string(),
                    Value::Bool(false) => "False".to_string(),
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();
        Ok(Self { entries })
    }

    /// Split into characteristic writes, in order, and the unrecognized keys.
    pub fn writes(&self) -> (Vec<(&'static str, &str, &str)>, Vec<&str>) {
        let mut writes = Vec::new();
        let mut unknown = Vec::new();
        for (key, value) in &self.entries {
            match program_key_uuid(key) {
                Some(uuid) => writes.push((uuid, key.as_str(), value.as_str())),
                None => unknown.push(key.as_str()),
            }
        }
        (writes, unknown)
    }
}

/// Rewrite single-quoted strings and True/False/None into JSON.
fn python_literal_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();
    let mut word = String::new();

    let flush_word = |word: &mut String, out: &mut String| {
        match word.as_str() {
            "True" => out.push_str("true"),
            "False" => out.push_str("false"),
            "None" => out.push_str("null"),
            other => out.push_str(other),
        }
        word.clear();
    };

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => match c {
                '\\' => {
                    out.push(c);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                _ if c == q => {
                    out.push('"');
                    quote = None;
                }
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            },
            None => {
                if c.is_ascii_alphanumeric() || c == '_' {
                    word.push(c);
                    continue;
                }
                flush_word(&mut word, &mut out);
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push('"');
                } else {
                    out.push(c);
                }
            }
        }
    }
    flush_word(&mut word, &mut out);
    out
}
