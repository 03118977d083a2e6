use bytes::Bytes;
use serde::Serialize;

/// Terminal frame closing every stream.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Encode one value as a `data: <json>\n\n` frame.
pub fn json_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    Some(raw_frame(&payload))
}

/// Encode an already-serialized JSON payload as a `data:` frame.
pub fn raw_frame(payload: &[u8]) -> Bytes {
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(payload);
    data.extend_from_slice(b"\n\n");
    Bytes::from(data)
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

/// Incremental `text/event-stream` reader yielding each event's data
/// payload. Event names, comments and every other field are skipped; the
/// upstreams this gateway reads carry nothing but `data:` lines.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    pending: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        out
    }

    /// Flush at end of stream, where the final event may lack its blank
    /// line or even its newline.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.handle_line(tail.trim_end_matches('\r'), &mut out);
        }
        self.flush(&mut out);
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<String>) {
        if line.is_empty() {
            self.flush(out);
            return;
        }
        let Some(rest) = line.strip_prefix("data:") else {
            return;
        };
        self.pending
            .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        out.push(self.pending.join("\n"));
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_end_with_blank_line() {
        let frame = json_frame(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(&frame[..], b"data: {\"a\":1}\n\n");
    }

    #[test]
    fn parser_splits_events_on_blank_lines() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str("data: one\n\ndata: two\n\n");
        assert_eq!(payloads, vec!["one", "two"]);
    }

    #[test]
    fn parser_joins_multiline_data() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(payloads, vec!["a\nb"]);
    }

    #[test]
    fn parser_skips_comments_and_other_fields() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str(": ping\nevent: delta\nretry: 100\ndata: x\n\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn parser_handles_crlf_lines() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str("data: x\r\n\r\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn parser_flushes_trailing_event_on_finish() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        assert_eq!(parser.finish(), vec!["tail"]);

        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail\n").is_empty());
        assert_eq!(parser.finish(), vec!["tail"]);
    }
}
