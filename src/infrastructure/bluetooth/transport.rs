//! BLE transport boundary.
//!
//! The device loop talks to the radio only through [`Transport`]. Notifications
//! and link loss arrive out of band as [`TransportEvent`]s on the channel handed
//! out when the transport is created.

use crate::domain::error::TransportError;
use crate::domain::models::ScannedDevice;
use std::time::Duration;

/// Every event carries the generation of the link it was raised on (see
/// [`Transport::link`]), so events queued before a reconnect can be told apart
/// from the current link's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Value pushed by a subscribed characteristic
    Notification {
        link: u64,
        uuid: String,
        data: Vec<u8>,
    },
    /// The link dropped without a local disconnect request
    Disconnected { link: u64, reason: String },
}

impl TransportEvent {
    pub fn link(&self) -> u64 {
        match self {
            Self::Notification { link, .. } | Self::Disconnected { link, .. } => *link,
        }
    }
}

/// Connection to one peripheral at a time.
///
/// Implementations are driven from a single task and never see overlapping
/// calls.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Discover advertising peripherals whose name contains `name_filter`.
    async fn scan(
        &mut self,
        timeout: Duration,
        name_filter: &str,
    ) -> Result<Vec<ScannedDevice>, TransportError>;

    async fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Generation of the current link. Bumped by every successful connect.
    fn link(&self) -> u64;

    async fn read(&mut self, uuid: &str) -> Result<Vec<u8>, TransportError>;

    async fn write(&mut self, uuid: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Enable notifications for a characteristic.
    async fn subscribe(&mut self, uuid: &str) -> Result<(), TransportError>;
}
