//! Device loop runtime
//!
//! The device loop runs on its own thread with a current-thread tokio runtime.
//! Every other context reaches it through a [`DeviceHandle`], which turns a
//! request into a [`DeviceJob`] on a single-consumer channel.

use crate::application::device::{DeviceController, DeviceRequest};
use crate::domain::error::{BridgeResult, TransportError};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

pub struct DeviceJob {
    pub request: DeviceRequest,
    /// `None` for fire-and-forget work; the outcome is only logged.
    pub reply: Option<oneshot::Sender<BridgeResult<String>>>,
}

#[derive(Clone)]
pub struct DeviceHandle {
    jobs: mpsc::UnboundedSender<DeviceJob>,
}

impl DeviceHandle {
    pub fn new(jobs: mpsc::UnboundedSender<DeviceJob>) -> Self {
        Self { jobs }
    }

    fn enqueue(
        &self,
        request: DeviceRequest,
    ) -> BridgeResult<oneshot::Receiver<BridgeResult<String>>> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(DeviceJob {
                request,
                reply: Some(tx),
            })
            .map_err(|_| TransportError::LoopClosed)?;
        Ok(rx)
    }

    /// Run a request on the device loop and wait for its reply.
    ///
    /// Must not be called from inside an async context.
    pub fn execute_blocking(&self, request: DeviceRequest) -> BridgeResult<String> {
        let rx = self.enqueue(request)?;
        rx.blocking_recv()
            .map_err(|_| TransportError::LoopClosed)?
    }

    pub async fn execute(&self, request: DeviceRequest) -> BridgeResult<String> {
        let rx = self.enqueue(request)?;
        rx.await.map_err(|_| TransportError::LoopClosed)?
    }

    /// Queue a request without waiting for it.
    pub fn submit(&self, request: DeviceRequest) -> BridgeResult<()> {
        self.jobs
            .send(DeviceJob {
                request,
                reply: None,
            })
            .map_err(|_| TransportError::LoopClosed.into())
    }
}

/// Serve jobs and transport events until every [`DeviceHandle`] is dropped.
pub async fn run_device_loop<T: Transport>(
    mut controller: DeviceController<T>,
    mut jobs: mpsc::UnboundedReceiver<DeviceJob>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    info!("Device loop started");
    let mut events_open = true;

    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let label = format!("{:?}", job.request);
                let result = controller.execute(job.request).await;
                match job.reply {
                    Some(reply) => {
                        if reply.send(result).is_err() {
                            warn!("Requester went away before reply to {}", label);
                        }
                    }
                    None => match result {
                        Ok(text) => info!("{} -> {}", label, text),
                        Err(e) => error!("{} failed: {}", label, e),
                    },
                }
            }
            event = events.recv(), if events_open => {
                match event {
                    Some(event) => controller.handle_event(event).await,
                    None => {
                        warn!("Transport event stream closed");
                        events_open = false;
                    }
                }
            }
        }
    }

    controller.shutdown().await;
    info!("Device loop stopped");
}

/// Start the device loop on a dedicated thread.
///
/// `build` runs on that thread, so the transport never has to be `Send`.
pub fn spawn_device_loop<T, F>(build: F) -> anyhow::Result<(DeviceHandle, JoinHandle<()>)>
where
    T: Transport + 'static,
    F: FnOnce() -> (DeviceController<T>, mpsc::UnboundedReceiver<TransportEvent>)
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let thread = std::thread::Builder::new()
        .name("device-loop".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime for the device loop: {}", e);
                    return;
                }
            };
            rt.block_on(async move {
                let (controller, events) = build();
                run_device_loop(controller, rx, events).await;
            });
        })?;
    Ok((DeviceHandle::new(tx), thread))
}
