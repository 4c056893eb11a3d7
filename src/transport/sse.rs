//! Incremental `text/event-stream` decoding

use super::safe_fetch::SafeFetchResult;
use crate::{Error, Result};

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (`event:` field), if any
    pub event: Option<String>,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id (`id:` field), if any
    pub id: Option<String>,
}

/// Events larger than this are rejected unless a decoder says otherwise.
const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Line-oriented decoder fed with arbitrary byte chunks.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    id: Option<String>,
    max_event_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder that rejects events over `max_event_bytes`.
    #[must_use]
    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            event: None,
            data: Vec::new(),
            data_len: 0,
            id: None,
            max_event_bytes,
        }
    }

    /// Feed a chunk; returns every event completed by it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamProtocol`] once a pending line or event grows
    /// past the size limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.scanned = 0;
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
            self.check_size(0)?;
        }
        self.scanned = self.buffer.len();
        self.check_size(self.buffer.len())?;

        Ok(events)
    }

    /// `partial` is the length of the unterminated line still buffered.
    fn check_size(&self, partial: usize) -> Result<()> {
        if partial.saturating_add(self.data_len) > self.max_event_bytes {
            return Err(Error::UpstreamProtocol(format!(
                "server-sent event exceeds {} bytes",
                self.max_event_bytes
            )));
        }
        Ok(())
    }

    /// Flush a trailing event not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&raw).into_owned();
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.line(line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                self.data.push(value.to_string());
            }
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        self.data_len = 0;
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id: self.id.clone(),
        })
    }
}

/// Event stream over a fetched response body.
///
/// Body reads keep honouring the originating request's deadline and
/// cancellation.
#[derive(Debug)]
pub struct SseEvents {
    body: SafeFetchResult,
    decoder: SseDecoder,
    pending: std::collections::VecDeque<SseEvent>,
    done: bool,
}

impl SseEvents {
    pub(crate) fn new(body: SafeFetchResult, max_event_bytes: usize) -> Self {
        Self {
            body,
            decoder: SseDecoder::with_limit(max_event_bytes),
            pending: std::collections::VecDeque::new(),
            done: false,
        }
    }

    /// Next event, or `None` when the stream has ended.
    pub async fn next(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            match self.body.chunk().await? {
                Some(chunk) => self.pending.extend(self.decoder.push(&chunk)?),
                None => {
                    self.done = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }
}
