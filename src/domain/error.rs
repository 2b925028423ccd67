//! Error taxonomy shared by the codec, the device loop and the dispatcher.
//!
//! Every variant is caught at the dispatcher boundary and rendered as a single
//! `ERROR: ...` reply; nothing here is allowed to take down a loop.

use thiserror::Error;

/// Failures local to the characteristic codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("cannot decode {len} bytes as {target_type}")]
    Decode { len: usize, target_type: String },

    #[error("failed to encode value '{value}' as {target_type}")]
    Encode { value: String, target_type: String },
}

/// Failures of a device operation on the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to device")]
    NotConnected,

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("device loop is not running")]
    LoopClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    State(String),

    #[error("No calibration for {0}")]
    CalibrationMissing(String),

    #[error("{0}")]
    Io(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BridgeError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub fn state(detail: impl Into<String>) -> Self {
        Self::State(detail.into())
    }

    /// Render the error as the single reply line sent to the external client.
    pub fn reply_text(&self) -> String {
        format!("ERROR: {}", self)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
