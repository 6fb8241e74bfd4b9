// Newline-delimited JSON framing
//
// One self-contained JSON object per line. The framer accumulates raw bytes,
// cuts complete lines at `\n`, and decodes each independently: a malformed
// line is dropped and counted, and decoding carries on with the next one.
// Bytes after the last delimiter stay buffered until the rest arrives.
//
// The same type drives sockets through `tokio_util::codec`, so the server and
// client use `FramedRead`/`FramedWrite` and never touch partial reads
// themselves.

use crate::streaming::source::Sample;
use crate::streaming::types::{StreamError, StreamResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

pub const DELIMITER: u8 = b'\n';

/// Longest undelimited run kept before the framer gives up on it
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Wire envelope
///
/// Variants are told apart by their keys: a `triggerID` string makes a
/// trigger, `timestamp` + `eeg` make a data message, and any other JSON
/// object is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Trigger {
        #[serde(rename = "triggerID")]
        trigger_id: String,
    },
    Samples {
        timestamp: f64,
        eeg: Vec<f64>,
        /// Collaborator-defined, opaque here
        #[serde(default, skip_serializing_if = "Option::is_none")]
        navigation: Option<serde_json::Value>,
    },
    Other(serde_json::Map<String, serde_json::Value>),
}

impl Message {
    pub fn trigger(id: impl Into<String>) -> Self {
        Message::Trigger {
            trigger_id: id.into(),
        }
    }

    pub fn from_sample(sample: &Sample) -> Self {
        Message::Samples {
            timestamp: sample.timestamp,
            eeg: sample.values.clone(),
            navigation: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Trigger { .. } => "trigger",
            Message::Samples { .. } => "samples",
            Message::Other(_) => "other",
        }
    }
}

#[derive(Debug)]
pub struct MessageFramer {
    buffer: BytesMut,
    /// Where the next delimiter search resumes
    scan_from: usize,
    max_line_length: usize,
    /// Dropping an over-long line until its delimiter shows up
    discarding: bool,
    malformed: Arc<AtomicU64>,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scan_from: 0,
            max_line_length,
            discarding: false,
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share a malformed-line counter with an owner that outlives this framer
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.malformed = counter;
        self
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Bytes received but not yet terminated by a delimiter
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Consume a fragment of the stream and return every message it completed
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(message) = self.next_message(&mut buffer) {
            messages.push(message);
        }

        self.buffer = buffer;
        messages
    }

    /// Serialise a message followed by the delimiter
    pub fn encode(message: &Message) -> StreamResult<Bytes> {
        let mut out = serde_json::to_vec(message)?;
        out.push(DELIMITER);
        Ok(Bytes::from(out))
    }

    fn next_message(&mut self, src: &mut BytesMut) -> Option<Message> {
        loop {
            let start = self.scan_from.min(src.len());
            let found = src[start..]
                .iter()
                .position(|&b| b == DELIMITER)
                .map(|offset| start + offset);

            let Some(pos) = found else {
                if src.len() > self.max_line_length {
                    if !self.discarding {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Discarding undelimited line longer than {} bytes",
                            self.max_line_length
                        );
                    }
                    self.discarding = true;
                    src.clear();
                    self.scan_from = 0;
                } else {
                    self.scan_from = src.len();
                }
                return None;
            };

            let line = src.split_to(pos + 1);
            self.scan_from = 0;

            if self.discarding {
                // Tail of the over-long line, already counted
                self.discarding = false;
                continue;
            }

            if let Some(message) = self.decode_line(&line[..pos]) {
                return Some(message);
            }
        }
    }

    fn decode_line(&self, line: &[u8]) -> Option<Message> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(first) = line.iter().find(|b| !b.is_ascii_whitespace()) else {
            return None;
        };

        // Only objects are messages; serde would otherwise accept `["id"]` as a struct
        if *first != b'{' {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping non-object line");
            return None;
        }

        match serde_json::from_slice::<Message>(line) {
            Ok(message) => Some(message),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping malformed line: {}", e);
                None
            }
        }
    }
}

impl Decoder for MessageFramer {
    type Item = Message;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, StreamError> {
        Ok(self.next_message(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, StreamError> {
        if let Some(message) = self.next_message(src) {
            return Ok(Some(message));
        }

        // Peer closed mid-line: the fragment can never complete
        if !self.discarding && src.iter().any(|b| !b.is_ascii_whitespace()) {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping {} bytes of unterminated input at EOF", src.len());
        }
        src.clear();
        self.scan_from = 0;
        self.discarding = false;
        Ok(None)
    }
}

impl Encoder<Message> for MessageFramer {
    type Error = StreamError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), StreamError> {
        let json = serde_json::to_vec(&message)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
