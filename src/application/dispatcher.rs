//! Command dispatcher
//!
//! Strict request/reply: one message in, one reply out, in order. The only
//! state is whether the next message is the payload of a `program` command.

use crate::application::device::DeviceRequest;
use crate::application::runtime::DeviceHandle;
use crate::domain::command::{Command, ProgramSettings};
use crate::domain::error::BridgeError;
use tracing::{debug, info, warn};

pub const READY_FOR_PROGRAM: &str = "Ready for program data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    AwaitingProgramPayload,
}

/// One side of a request/reply channel.
pub trait RequestChannel {
    /// Next request, or `None` when the peer is gone.
    fn recv(&mut self) -> anyhow::Result<Option<String>>;

    fn reply(&mut self, text: &str) -> anyhow::Result<()>;
}

pub struct CommandDispatcher {
    device: DeviceHandle,
    state: DispatcherState,
}

impl CommandDispatcher {
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            state: DispatcherState::Idle,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Handle one message and return exactly one reply.
    ///
    /// Blocks until the device loop has finished the work.
    pub fn on_message(&mut self, text: &str) -> String {
        match self.state {
            DispatcherState::Idle => self.on_request(text),
            DispatcherState::AwaitingProgramPayload => {
                self.state = DispatcherState::Idle;
                self.on_program_payload(text)
            }
        }
    }

    fn on_request(&mut self, text: &str) -> String {
        debug!("Request: {}", text);
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected request '{}': {}", text, e);
                return e.reply_text();
            }
        };

        match command {
            Command::Unknown(original) => format!("Unknown command: {}", original),
            Command::Program => {
                self.state = DispatcherState::AwaitingProgramPayload;
                READY_FOR_PROGRAM.to_string()
            }
            command => self.run(DeviceRequest::Command(command)),
        }
    }

    fn on_program_payload(&mut self, text: &str) -> String {
        match ProgramSettings::parse(text) {
            Ok(program) => {
                info!("Programming {} setting(s)", program.entries.len());
                self.run(DeviceRequest::Program(program))
            }
            Err(e) => {
                let e = match e {
                    BridgeError::Protocol(detail) => BridgeError::state(format!(
                        "expected program data after program command: {}",
                        detail
                    )),
                    other => other,
                };
                warn!("{}", e);
                e.reply_text()
            }
        }
    }

    fn run(&self, request: DeviceRequest) -> String {
        match self.device.execute_blocking(request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Command failed: {}", e);
                e.reply_text()
            }
        }
    }

    /// Receive, dispatch, reply until the channel closes.
    pub fn serve<C: RequestChannel>(&mut self, channel: &mut C) -> anyhow::Result<()> {
        while let Some(text) = channel.recv()? {
            let reply = self.on_message(&text);
            channel.reply(&reply)?;
        }
        if self.state == DispatcherState::AwaitingProgramPayload {
            warn!("Client left during program handshake");
            self.state = DispatcherState::Idle;
        }
        Ok(())
    }
}
