//! Application layer: the device loop and the contexts that feed it.
//!
//! - [`device`] - controller owning the connection and all device-side state
//! - [`runtime`] - device loop thread and the job channel into it
//! - [`dispatcher`] - request/reply command dispatcher
//! - [`trigger`] - debounced hardware trigger input

pub mod device;
pub mod dispatcher;
pub mod runtime;
pub mod trigger;

pub use device::{DeviceController, DeviceRequest};
pub use dispatcher::{CommandDispatcher, DispatcherState, RequestChannel};
pub use runtime::{spawn_device_loop, DeviceHandle, DeviceJob};
pub use trigger::TriggerBridge;
