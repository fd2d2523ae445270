//! Line codec for peer commands.
//!
//! Every message is one UTF-8 line: `COMMAND\n` or `COMMAND:payload\n`.
//! Decoding never fails loudly; unknown or malformed lines are logged and
//! skipped so that newer peers can add commands without breaking older ones.

use peerswitch_types::message::{DeviceCommand, DeviceMessage};
use tracing::{debug, warn};

/// Longest line accepted from a peer (64 KiB).
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Protocol version advertised in discovery metadata.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Encode a command and optional payload as one line.
///
/// Line breaks inside the payload would split the frame, so they are
/// replaced by spaces.
pub fn encode(command: DeviceCommand, payload: Option<&str>) -> Vec<u8> {
    let mut line = String::from(command.as_str());
    if let Some(p) = payload {
        line.push(':');
        line.extend(p.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
    }
    line.push('\n');
    line.into_bytes()
}

/// Encode a [`DeviceMessage`].
pub fn encode_message(msg: &DeviceMessage) -> Vec<u8> {
    encode(msg.command, msg.payload.as_deref())
}

/// Encode a command carrying a comma-joined address list.
pub fn encode_addresses<S: AsRef<str>>(command: DeviceCommand, addresses: &[S]) -> Vec<u8> {
    encode_message(&DeviceMessage::with_addresses(command, addresses))
}

/// Decode one line (with or without its trailing newline).
///
/// Only the line terminator is stripped, so the payload keeps its own
/// whitespace. Returns `None` for blank lines and for tags outside the
/// vocabulary.
pub fn decode_line(line: &str) -> Option<DeviceMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let (tag, payload) = match line.split_once(':') {
        Some((tag, payload)) => (tag, Some(payload.to_string())),
        None => (line, None),
    };
    match tag.trim().parse::<DeviceCommand>() {
        Ok(command) => Some(DeviceMessage { command, payload }),
        Err(e) => {
            debug!("ignoring line: {e}");
            None
        }
    }
}

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Set after an oversized partial line was dropped; the rest of that line
    /// is skipped up to the next newline.
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if raw.len() > MAX_LINE_LEN {
                warn!(len = raw.len(), "dropping oversized line");
                continue;
            }
            match String::from_utf8(raw) {
                Ok(line) => lines.push(line),
                Err(_) => warn!("dropping line that is not valid UTF-8"),
            }
        }

        if self.buf.len() > MAX_LINE_LEN {
            warn!(len = self.buf.len(), "line exceeds {MAX_LINE_LEN} bytes, discarding");
            self.buf.clear();
            self.discarding = true;
        }

        lines
    }

    /// Bytes buffered for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
