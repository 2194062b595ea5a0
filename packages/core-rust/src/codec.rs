//! Wire framing for the manager protocol.
//!
//! A frame is one or more `Key: Value` lines terminated by a blank line.
//! Lines are written with `\r\n`; both `\r\n` and bare `\n` are accepted on
//! input.
//!
//! Lines that do not contain the `": "` separator (raw command output, the
//! server banner) are kept under synthesized keys `"0"`, `"1"`, ... numbered
//! per frame.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::message::{Fields, Message};

/// Separator between key and value on a field line.
pub const FIELD_SEPARATOR: &str = ": ";
/// Line terminator used on output.
pub const LINE_END: &str = "\r\n";

/// Serializes fields into one wire frame.
#[must_use]
pub fn serialize(fields: &Fields) -> Vec<u8> {
    let capacity = fields
        .iter()
        .map(|(k, v)| k.len() + v.len() + FIELD_SEPARATOR.len() + LINE_END.len())
        .sum::<usize>()
        + LINE_END.len();
    let mut out = Vec::with_capacity(capacity);
    for (key, value) in fields {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(FIELD_SEPARATOR.as_bytes());
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(LINE_END.as_bytes());
    }
    out.extend_from_slice(LINE_END.as_bytes());
    out
}

/// Parses the lines of one frame into a message. Blank lines are ignored.
#[must_use]
pub fn parse(bytes: &[u8]) -> Message {
    let text = String::from_utf8_lossy(bytes);
    let mut fields = Fields::new();
    let mut unnamed: u32 = 0;

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(FIELD_SEPARATOR) {
            fields.insert(key.to_string(), value.to_string());
        } else {
            fields.insert(unnamed.to_string(), line.to_string());
            unnamed += 1;
        }
    }

    Message::from_fields(fields)
}

/// `tokio_util` codec turning a byte stream into [`Message`]s and back.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec {
    /// Bytes already scanned for the frame terminator, so a frame arriving
    /// in many small reads is not rescanned from the start each time.
    scanned: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        loop {
            let mut line_start = self.scanned.min(src.len());
            let mut frame_end = None;

            while let Some(offset) = src[line_start..].iter().position(|b| *b == b'\n') {
                let newline = line_start + offset;
                let line = &src[line_start..newline];
                if line.is_empty() || line == b"\r" {
                    frame_end = Some(newline + 1);
                    break;
                }
                line_start = newline + 1;
            }

            let Some(end) = frame_end else {
                self.scanned = line_start;
                return Ok(None);
            };

            self.scanned = 0;
            let frame = src.split_to(end);
            let msg = parse(&frame);
            if msg.is_empty() {
                trace!("skipping empty frame");
                continue;
            }
            return Ok(Some(msg));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        if !src.is_empty() {
            trace!(bytes = src.len(), "discarding unterminated frame at end of stream");
            src.clear();
        }
        self.scanned = 0;
        Ok(None)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.to_bytes();
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
