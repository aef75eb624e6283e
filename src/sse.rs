//! Incremental parser for Server-Sent-Events streams.
//!
//! The realtime channel reads its SSE body as raw byte chunks
//! (`reqwest::Response::bytes_stream`), so the parser must tolerate events
//! split across arbitrary chunk boundaries. Field grammar per the SSE
//! specification: `event:`, `data:` (multi-line, joined with `\n`), `id:`,
//! comment lines starting with `:`; a blank line dispatches the buffered
//! event. Lines may end with `\n`, `\r`, or `\r\n`.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// Last seen event id, if any.
    pub id: Option<String>,
    /// Event name; `"message"` when the stream did not name one.
    pub event: String,
    /// Event data with multi-line payloads joined by `\n`.
    pub data: String,
}

/// Chunk-boundary-safe SSE parser.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
    event_type: String,
    data_lines: Vec<String>,
    last_id: Option<String>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            let Some((line_end, next_start)) = find_line_break(&self.buf) else {
                break;
            };
            let line = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
            self.buf.drain(..next_start);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None; // comment / keep-alive
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => self.data_lines.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            _ => {} // unknown fields (incl. "retry") are ignored
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event_type.clear();
            return None;
        }
        let event = SseEvent {
            id: self.last_id.clone(),
            event: if self.event_type.is_empty() {
                "message".to_string()
            } else {
                std::mem::take(&mut self.event_type)
            },
            data: self.data_lines.join("\n"),
        };
        self.event_type.clear();
        self.data_lines.clear();
        Some(event)
    }
}

/// Find the next complete line: returns (end of line content, start of the
/// following line). A trailing lone `\r` is left buffered until we can tell
/// whether a `\n` follows it.
fn find_line_break(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'\n' => return Some((i, i + 1)),
            b'\r' => {
                if i + 1 < buf.len() {
                    let skip = if buf[i + 1] == b'\n' { 2 } else { 1 };
                    return Some((i, i + skip));
                }
                return None;
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: connect\ndata: {\"clientId\":\"abc\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "connect");
        assert_eq!(events[0].data, r#"{"clientId":"abc"}"#);
    }

    #[test]
    fn test_default_event_name_is_message() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: hello\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: orders/*\nda").is_empty());
        assert!(parser.push(b"ta: {\"action\":\"cre").is_empty());
        let events = parser.push(b"ate\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "orders/*");
        assert_eq!(events[0].data, r#"{"action":"create"}"#);
    }

    #[test]
    fn test_multi_line_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_comments_and_blank_events_are_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": keep-alive\n\n").is_empty());
        assert!(parser.push(b"event: named-but-empty\n\n").is_empty());
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.push(b"id: 7\r\nevent: t\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].event, "t");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_lone_cr_at_chunk_boundary_is_buffered() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: x\r").is_empty());
        let events = parser.push(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_two_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: a\ndata: 1\n\nevent: b\ndata: 2\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "a");
        assert_eq!(events[1].event, "b");
    }
}
