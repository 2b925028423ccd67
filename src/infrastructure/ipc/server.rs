use crate::application::dispatcher::{CommandDispatcher, RequestChannel};
use crate::infrastructure::ipc::{encode_reply, socket_name};
use anyhow::{Context, Result};
use interprocess::local_socket::{traits::ListenerExt, ListenerOptions, Stream as LocalStream};
use interprocess::TryClone;
use std::io::{BufRead, BufReader, Write};
use tracing::{error, info, warn};

/// Line-framed request/reply channel over any reader/writer pair.
pub struct LineChannel<R, W> {
    reader: R,
    writer: W,
    buffer: String,
}

impl<R: BufRead, W: Write> LineChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            buffer: String::new(),
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl<R: BufRead, W: Write> RequestChannel for LineChannel<R, W> {
    fn recv(&mut self) -> Result<Option<String>> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            let line = self.buffer.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }

    fn reply(&mut self, text: &str) -> Result<()> {
        let line = encode_reply(text) + "\n";
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Accept clients one at a time and serve their requests.
///
/// Only one client is served at a time, which keeps a single request in
/// flight system-wide.
pub fn serve_requests(socket: &str, dispatcher: &mut CommandDispatcher) -> Result<()> {
    let listener = ListenerOptions::new()
        .name(socket_name(socket)?)
        .create_sync()
        .with_context(|| format!("Failed to bind request socket '{}'", socket))?;
    info!("Listening for commands on '{}'", socket);

    for conn in listener.incoming() {
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Incoming connection failed: {}", e);
                continue;
            }
        };
        info!("Client connected");
        if let Err(e) = handle_connection(conn, dispatcher) {
            error!("Connection error: {}", e);
        }
        info!("Client disconnected");
    }

    Ok(())
}

fn handle_connection(stream: LocalStream, dispatcher: &mut CommandDispatcher) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let mut channel = LineChannel::new(reader, stream);
    dispatcher.serve(&mut channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ipc::decode_reply;
    use std::io::Cursor;

    #[test]
    fn test_line_channel_skips_blank_lines() {
        let input = Cursor::new("optogrid.status\r\n\n   \noptogrid.scan\n");
        let mut channel = LineChannel::new(input, Vec::new());
        assert_eq!(channel.recv().unwrap().as_deref(), Some("optogrid.status"));
        assert_eq!(channel.recv().unwrap().as_deref(), Some("optogrid.scan"));
        assert_eq!(channel.recv().unwrap(), None);
    }

    #[test]
    fn test_line_channel_frames_replies() {
        let mut channel = LineChannel::new(Cursor::new(""), Vec::new());
        channel.reply("a\nb").unwrap();
        channel.reply("Sync Written").unwrap();

        let written = String::from_utf8(channel.into_writer()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(decode_reply(lines[0]).unwrap(), "a\nb");
        assert_eq!(decode_reply(lines[1]).unwrap(), "Sync Written");
    }
}
