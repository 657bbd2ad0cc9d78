use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

const SESSIONS_CHANNEL: &str = "sessions";
const SESSION_CHANNEL_PREFIX: &str = "session:";

/// Logical event-stream topic: the global dashboard feed or one session's feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Sessions,
    Session(String),
}

impl Channel {
    pub fn session(session_id: impl Into<String>) -> Self {
        Channel::Session(session_id.into())
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Channel::Sessions => None,
            Channel::Session(id) => Some(id.as_str()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Sessions => f.write_str(SESSIONS_CHANNEL),
            Channel::Session(id) => write!(f, "{SESSION_CHANNEL_PREFIX}{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed == SESSIONS_CHANNEL {
            return Ok(Channel::Sessions);
        }
        match trimmed.strip_prefix(SESSION_CHANNEL_PREFIX) {
            Some(id) if !id.trim().is_empty() => Ok(Channel::Session(id.trim().to_string())),
            _ => Err(format!("Unknown channel: {trimmed}")),
        }
    }
}

/// One server-push event as it came off the wire, before routing.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub id: Option<String>,
    pub event_type: String,
    pub data: Value,
}

impl WireEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame has no event type")]
    MissingEventType,
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub frames: Vec<WireEvent>,
    pub errors: Vec<FrameError>,
}

impl Default for DecodeReport {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl DecodeReport {
    fn push_frame(&mut self, frame: WireEvent) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Renders an event in the `id:` / `event:` / `data:` framing understood by
/// [`SseFrameDecoder`].
pub fn encode_event(event: &WireEvent) -> String {
    let mut out = String::new();
    if let Some(id) = &event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    out.push_str("event: ");
    out.push_str(&event.event_type);
    out.push('\n');
    let data = event.data.to_string();
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[derive(Debug, Default)]
struct PendingFrame {
    id: Option<String>,
    event_type: Option<String>,
    data: Vec<String>,
    size: usize,
    discard: bool,
}

impl PendingFrame {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.event_type.is_none() && self.data.is_empty() && !self.discard
    }
}

/// Incremental decoder for a server-sent-events byte stream.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence or a line
/// terminator. A malformed or oversized frame is reported and skipped; the
/// frames after it still decode.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending_bytes: Vec<u8>,
    frame: PendingFrame,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending_bytes: Vec::new(),
            frame: PendingFrame::default(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending_bytes.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending_bytes.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending_bytes.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }

        if self.pending_bytes.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedFrame {
                size: self.pending_bytes.len(),
                max: self.max_frame_bytes,
            });
            self.pending_bytes.clear();
            self.frame.discard = true;
        }

        report
    }

    /// Flushes whatever is buffered once the stream has ended.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !self.pending_bytes.is_empty() {
            let mut line = std::mem::take(&mut self.pending_bytes);
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }
        self.dispatch(&mut report);
        report
    }

    fn process_line(&mut self, line: &[u8], report: &mut DecodeReport) {
        if line.is_empty() {
            self.dispatch(report);
            return;
        }
        if self.frame.discard {
            return;
        }
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(err) => {
                report.push_error(FrameError::Decode(err.to_string()));
                self.frame.discard = true;
                return;
            }
        };
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        self.frame.size += value.len();
        if self.frame.size > self.max_frame_bytes {
            report.push_error(FrameError::OversizedFrame {
                size: self.frame.size,
                max: self.max_frame_bytes,
            });
            self.frame.discard = true;
            return;
        }

        match field {
            "id" => self.frame.id = Some(value.to_string()),
            "event" => self.frame.event_type = Some(value.to_string()),
            "data" => self.frame.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport) {
        let frame = std::mem::take(&mut self.frame);
        if frame.is_empty() || frame.discard {
            return;
        }
        if frame.data.is_empty() {
            // id-only or event-only blocks carry nothing to route
            return;
        }

        let raw = frame.data.join("\n");
        let data: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                report.push_error(FrameError::Decode(err.to_string()));
                return;
            }
        };

        let event_type = frame
            .event_type
            .filter(|value| !value.trim().is_empty() && value != "message")
            .or_else(|| {
                data.get("type")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            });
        let Some(event_type) = event_type else {
            report.push_error(FrameError::MissingEventType);
            return;
        };

        report.push_frame(WireEvent {
            id: frame.id,
            event_type,
            data,
        });
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_event(id: &str, text: &str) -> WireEvent {
        WireEvent::new(
            "llm.stream.chunk",
            serde_json::json!({
                "session_id": "sess-1",
                "stage_execution_id": "exec-1",
                "stream_type": "thought",
                "chunk": text,
                "is_complete": false,
            }),
        )
        .with_id(id)
    }

    #[test]
    fn channel_names_round_trip() {
        assert_eq!("sessions".parse::<Channel>(), Ok(Channel::Sessions));
        assert_eq!(
            "session:abc-123".parse::<Channel>(),
            Ok(Channel::session("abc-123"))
        );
        assert_eq!(Channel::session("abc-123").to_string(), "session:abc-123");
        assert!("session:".parse::<Channel>().is_err());
        assert!("alerts".parse::<Channel>().is_err());
    }

    #[test]
    fn decodes_frames_split_across_chunks() {
        let encoded = encode_event(&chunk_event("7", "Investigating pod"));
        let bytes = encoded.as_bytes();
        let (first, second) = bytes.split_at(bytes.len() / 2);

        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(first);
        assert!(report.frames.is_empty());
        assert!(report.errors.is_empty());

        let report = decoder.push_chunk(second);
        assert_eq!(report.frames, vec![chunk_event("7", "Investigating pod")]);
    }

    #[test]
    fn event_type_falls_back_to_payload_type() {
        let raw = "id: 3\r\ndata: {\"type\":\"session.started\",\"session_id\":\"s1\"}\r\n\r\n";
        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(raw.as_bytes());
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].event_type, "session.started");
        assert_eq!(report.frames[0].id.as_deref(), Some("3"));
    }

    #[test]
    fn comments_and_keepalives_are_ignored() {
        let raw = ": keepalive\n\nretry: 5000\n\n";
        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(raw.as_bytes());
        assert!(report.frames.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn decoder_recovers_after_malformed_json() {
        let mut chunk = String::from("event: session.started\ndata: {not json\n\n");
        chunk.push_str(&encode_event(&chunk_event("8", "next")));

        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(chunk.as_bytes());
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn decoder_rejects_oversized_frame_and_continues() {
        let oversized = format!("event: big\ndata: \"{}\"\n\n", "x".repeat(2_000));
        let mut chunk = oversized;
        chunk.push_str(&encode_event(&chunk_event("9", "small")));

        let mut decoder = SseFrameDecoder::new(1_024);
        let report = decoder.push_chunk(chunk.as_bytes());
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].id.as_deref(), Some("9"));
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0],
            FrameError::OversizedFrame { .. }
        ));
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let raw = "event: stage.started\ndata: {\"session_id\":\"s1\"}";
        let mut decoder = SseFrameDecoder::default();
        assert!(decoder.push_chunk(raw.as_bytes()).frames.is_empty());
        let report = decoder.finish();
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].event_type, "stage.started");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let raw = "event: llm.interaction\ndata: {\"session_id\":\ndata: \"s1\"}\n\n";
        let mut decoder = SseFrameDecoder::default();
        let report = decoder.push_chunk(raw.as_bytes());
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].data["session_id"], "s1");
    }
}
