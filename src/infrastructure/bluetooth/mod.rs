//! Bluetooth Module
//!
//! BLE-facing pieces of the bridge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    DeviceController                      │
//! │        (device loop, application::device)                │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │ Transport │  │ Simulated  │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - scan    │  │ - in-memory│  │ - UUIDs   │
//! │ - GATT    │  │   device   │  │ - codec   │
//! │ - events  │  │            │  │ - records │
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Characteristic table and byte codec
//! - [`transport`] - Transport trait and out-of-band events
//! - [`simulated`] - In-memory peripheral implementing the transport

pub mod protocol;
pub mod simulated;
pub mod transport;

pub use simulated::{SimulatedDevice, SimulatedHandle, SimulatedPeripheral};
pub use transport::{Transport, TransportEvent};
