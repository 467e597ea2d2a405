use serde::de::DeserializeOwned;
use thiserror::Error;

pub const DEFAULT_MAX_EVENT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("event exceeds max size: {size} > {max}")]
    OversizedEvent { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("event payload is not utf-8")]
    InvalidUtf8,
    #[error("event decode failed: {0}")]
    Decode(String),
}

/// One dispatched text/event-stream event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

pub fn decode_json<T: DeserializeOwned>(data: &str) -> Result<T, FrameError> {
    serde_json::from_str(data).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Default)]
struct PendingEvent {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
    bytes: usize,
}

impl PendingEvent {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty() && self.id.is_none() && self.retry_ms.is_none()
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Chunks may split lines or events anywhere; complete events are returned
/// as soon as their terminating blank line arrives. A bad line never aborts
/// the stream, it is reported and the decoder resynchronises on the next
/// event boundary.
pub struct EventStreamDecoder {
    max_event_bytes: usize,
    buffer: Vec<u8>,
    current: PendingEvent,
    discarding: bool,
}

impl EventStreamDecoder {
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            max_event_bytes,
            buffer: Vec::new(),
            current: PendingEvent::default(),
            discarding: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<ServerEvent> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.buffer.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.buffer.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }

        if self.buffer.len() > self.max_event_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.buffer.len(),
                max: self.max_event_bytes,
            });
            self.buffer.clear();
            self.current = PendingEvent::default();
            self.discarding = true;
        }

        report
    }

    /// Ends the stream. An event without its terminating blank line is
    /// incomplete and is discarded along with any partial trailing line.
    pub fn finish(&mut self) -> DecodeReport<ServerEvent> {
        self.buffer.clear();
        self.current = PendingEvent::default();
        self.discarding = false;
        DecodeReport::default()
    }

    fn process_line(&mut self, line: &[u8], report: &mut DecodeReport<ServerEvent>) {
        if line.is_empty() {
            self.dispatch(report);
            self.discarding = false;
            return;
        }
        if self.discarding {
            return;
        }
        if line.starts_with(b":") {
            return;
        }

        let Ok(text) = std::str::from_utf8(line) else {
            report.push_error(FrameError::InvalidUtf8);
            self.current = PendingEvent::default();
            self.discarding = true;
            return;
        };

        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text, ""),
        };

        self.current.bytes += value.len();
        if self.current.bytes > self.max_event_bytes {
            report.push_error(FrameError::OversizedEvent {
                size: self.current.bytes,
                max: self.max_event_bytes,
            });
            self.current = PendingEvent::default();
            self.discarding = true;
            return;
        }

        match field {
            "data" => self.current.data.push(value.to_string()),
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            "retry" => {
                if let Ok(retry) = value.trim().parse::<u64>() {
                    self.current.retry_ms = Some(retry);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport<ServerEvent>) {
        let pending = std::mem::take(&mut self.current);
        if pending.is_empty() {
            return;
        }
        report.push_frame(ServerEvent {
            event: pending.event,
            data: pending.data.join("\n"),
            id: pending.id,
            retry_ms: pending.retry_ms,
        });
    }
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_BYTES)
    }
}
