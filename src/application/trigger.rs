//! Hardware trigger input.
//!
//! Edge callbacks run on whatever thread the input driver uses. They only
//! debounce and enqueue; the trigger itself runs on the device loop.

use crate::application::device::DeviceRequest;
use crate::application::runtime::DeviceHandle;
use crate::domain::command::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub struct TriggerBridge {
    device: DeviceHandle,
    debounce: Duration,
    last_edge: Mutex<Option<Instant>>,
}

impl TriggerBridge {
    pub fn new(device: DeviceHandle, debounce: Duration) -> Self {
        Self {
            device,
            debounce,
            last_edge: Mutex::new(None),
        }
    }

    /// Handle an edge observed now.
    pub fn on_edge(&self) -> bool {
        self.on_edge_at(Instant::now())
    }

    /// Handle an edge observed at `at`. Returns whether a trigger was queued.
    ///
    /// Edges closer than the debounce interval to the last accepted edge are
    /// ignored. Never blocks on the device.
    pub fn on_edge_at(&self, at: Instant) -> bool {
        {
            let mut last = self
                .last_edge
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = *last {
                if at.saturating_duration_since(previous) < self.debounce {
                    debug!("Trigger edge ignored (debounce)");
                    return false;
                }
            }
            *last = Some(at);
        }

        match self.device.submit(DeviceRequest::Command(Command::Trigger)) {
            Ok(()) => {
                info!("Trigger edge queued");
                true
            }
            Err(e) => {
                error!("Trigger edge dropped: {}", e);
                false
            }
        }
    }
}
