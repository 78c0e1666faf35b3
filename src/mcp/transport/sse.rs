//! Incremental `text/event-stream` decoding.
//!
//! Feeds arbitrary byte chunks and yields complete events. Data lines
//! accumulate until the blank-line terminator; events named anything
//! other than `message`, `endpoint`, or unnamed are ignored by the
//! callers that consume protocol traffic.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        SseDecoder::default()
    }

    /// Consumes a chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line_end = newline;
            if line_end > 0 && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let line = String::from_utf8_lossy(&self.buffer[..line_end]).into_owned();
            self.buffer.drain(..=newline);

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
                continue;
            }
            self.field(&line);
        }

        events
    }

    /// Emits any partially accumulated event when the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            self.field(line.trim_end_matches('\r'));
        }
        self.flush()
    }

    fn field(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("event:") {
            self.event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.id = Some(value.trim().to_string());
        }
        // Comment lines (leading ':') and unknown fields are skipped.
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_empty() && self.id.is_none() {
            return None;
        }
        let event = SseEvent {
            event: std::mem::take(&mut self.event),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }
}

/// Whether a content type denotes an SSE body.
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|ct| ct.eq_ignore_ascii_case("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
        assert_eq!(events[0].event, "");
    }

    #[test]
    fn decodes_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: endpoint\nda").is_empty());
        let events = decoder.push(b"ta: /messages?id=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?id=1");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"id: 42\r\ndata: x\r\n\r\n");
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_dangling_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        let event = decoder.finish().expect("dangling event");
        assert_eq!(event.data, "tail");
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream("text/event-stream"));
        assert!(is_event_stream("text/event-stream; charset=utf-8"));
        assert!(!is_event_stream("application/json"));
    }
}
