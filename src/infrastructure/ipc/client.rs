use crate::infrastructure::ipc::{decode_reply, socket_name};
use anyhow::{bail, Context, Result};
use interprocess::local_socket::{traits::Stream, Stream as LocalStream};
use interprocess::TryClone;
use std::io::{BufRead, BufReader, Write};
use std::time::{Duration, Instant};
use tracing::info;

const READY_FOR_PROGRAM: &str = "Ready for program data";

/// Send one line and read one framed reply.
pub fn exchange<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    line: &str,
) -> Result<String> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut buffer = String::new();
    if reader.read_line(&mut buffer)? == 0 {
        bail!("Bridge closed the connection");
    }
    decode_reply(&buffer)
}

/// Blocking client for the request/reply socket.
pub struct BridgeClient {
    reader: BufReader<LocalStream>,
    writer: LocalStream,
}

impl BridgeClient {
    pub fn connect(socket: &str) -> Result<Self> {
        let stream = LocalStream::connect(socket_name(socket)?)
            .with_context(|| format!("Bridge is not listening on '{}'", socket))?;
        let reader = BufReader::new(stream.try_clone()?);
        info!("Connected to bridge on '{}'", socket);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// Poll until the bridge accepts a connection.
    pub fn wait_for_bridge(socket: &str, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match Self::connect(socket) {
                Ok(client) => return Ok(client),
                Err(e) if start.elapsed() >= timeout => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(200)),
            }
        }
    }

    pub fn request(&mut self, command: &str) -> Result<String> {
        exchange(&mut self.reader, &mut self.writer, command)
    }

    /// Run the two-phase program handshake.
    pub fn program(&mut self, payload: &serde_json::Value) -> Result<String> {
        program_over(&mut self.reader, &mut self.writer, payload)
    }
}

fn program_over<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    payload: &serde_json::Value,
) -> Result<String> {
    if !payload.is_object() {
        bail!("Program payload must be a JSON object");
    }
    let ready = exchange(reader, writer, "optogrid.program")?;
    if ready != READY_FOR_PROGRAM {
        bail!("Unexpected reply to program: {}", ready);
    }
    exchange(reader, writer, &payload.to_string())
}

/// Subscribe to the broadcast socket; yields raw `IMU {...}` / `GUI {...}` lines.
pub fn subscribe(socket: &str) -> Result<impl Iterator<Item = std::io::Result<String>>> {
    let stream = LocalStream::connect(socket_name(socket)?)
        .with_context(|| format!("Nothing is publishing on '{}'", socket))?;
    Ok(BufReader::new(stream).lines())
}
