//! Local-socket channels to external control software.
//!
//! - [`server`] - request/reply endpoint driving the command dispatcher
//! - [`publisher`] - one-way broadcast of IMU and GUI events
//! - [`client`] - blocking client for both endpoints
//!
//! Framing: requests are single text lines. Replies are single lines holding a
//! JSON string literal, so multi-line replies survive line framing.

use anyhow::Context;
use interprocess::local_socket::{GenericNamespaced, Name, ToNsName};

pub mod client;
pub mod publisher;
pub mod server;

pub use client::BridgeClient;
pub use publisher::spawn_publisher;
pub use server::{serve_requests, LineChannel};

pub(crate) fn socket_name(socket: &str) -> anyhow::Result<Name<'_>> {
    socket
        .to_ns_name::<GenericNamespaced>()
        .with_context(|| format!("Invalid local socket name '{}'", socket))
}

/// Reply text as one framed line (without the newline).
pub fn encode_reply(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

pub fn decode_reply(line: &str) -> anyhow::Result<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    serde_json::from_str::<String>(line).with_context(|| format!("Malformed reply line: {}", line))
}
