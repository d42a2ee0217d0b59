//! Incremental `text/event-stream` framing.
//!
//! Bytes are fed in whatever chunks the transport hands over; frames come out
//! once their terminating blank line has been seen.

use bytes::Bytes;
use std::time::Duration;

/// Longer lines are dropped whole instead of buffered.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Defaults to `message` when the frame carries no `event:` field.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    skip_lf: bool,
    discarding: bool,
    past_first_line: bool,
    event: Option<String>,
    data: Vec<String>,
    has_data: bool,
    last_id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Reconnection delay most recently requested by the server via `retry:`.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Drops any half-received frame and expects a fresh stream. The last
    /// event id survives.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.skip_lf = false;
        self.discarding = false;
        self.past_first_line = false;
        self.event = None;
        self.data.clear();
        self.has_data = false;
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &b in chunk.iter() {
            if self.skip_lf {
                self.skip_lf = false;
                if b == b'\n' {
                    continue;
                }
            }
            match b {
                b'\n' | b'\r' => {
                    self.skip_lf = b == b'\r';
                    if std::mem::take(&mut self.discarding) {
                        continue;
                    }
                    let line = std::mem::take(&mut self.buf);
                    let mut line = String::from_utf8_lossy(&line).into_owned();
                    if !std::mem::replace(&mut self.past_first_line, true) && line.starts_with('\u{FEFF}') {
                        line.remove(0);
                    }
                    if let Some(frame) = self.process_line(&line) {
                        frames.push(frame);
                    }
                }
                _ if self.discarding => {}
                _ if self.buf.len() >= MAX_LINE_BYTES => {
                    tracing::warn!(limit = MAX_LINE_BYTES, "event-stream line too long, dropped");
                    self.buf = Vec::new();
                    self.discarding = true;
                }
                _ => self.buf.push(b),
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push(value.to_string());
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.filter(|e| !e.is_empty()).unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(p: &mut SseParser, parts: &[&[u8]]) -> Vec<SseFrame> {
        parts
            .iter()
            .flat_map(|part| p.feed(&Bytes::copy_from_slice(part)))
            .collect()
    }

    #[test]
    fn parses_named_events() {
        let mut p = SseParser::new();
        let frames = feed_all(
            &mut p,
            &[b"event: status\ndata: {\"status\":\"running\"}\n\nevent: done\ndata: {}\n\n"],
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "status");
        assert_eq!(frames[0].data, "{\"status\":\"running\"}");
        assert_eq!(frames[1].event, "done");
    }

    #[test]
    fn handles_split_lines_and_utf8() {
        let mut p = SseParser::new();
        let text = "event: error\ndata: {\"message\":\"caf\u{e9}\"}\n\n".as_bytes();
        let cut = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let frames = feed_all(&mut p, &[&text[..5], &text[5..cut], &text[cut..]]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"message\":\"caf\u{e9}\"}");
    }

    #[test]
    fn joins_multiline_data_and_accepts_crlf() {
        let mut p = SseParser::new();
        let frames = feed_all(&mut p, &[b"data: a\r\ndata: b\r", b"\n\r\n"]);
        assert_eq!(frames, vec![SseFrame { event: "message".into(), data: "a\nb".into(), id: None }]);
    }

    #[test]
    fn tracks_id_retry_and_ignores_comments() {
        let mut p = SseParser::new();
        let frames = feed_all(&mut p, &[b": keepalive\n\nretry: 1500\nid: 7\nevent: status\ndata: {}\n\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(p.last_event_id(), Some("7"));
        assert_eq!(p.retry(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn strips_leading_bom_once() {
        let mut p = SseParser::new();
        let frames = feed_all(&mut p, &[b"\xEF\xBB", b"\xBFevent: status\ndata: {}\n\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "status");

        p.reset();
        let frames = feed_all(&mut p, &[b"\xEF\xBB\xBFevent: done\ndata: {}\n\n"]);
        assert_eq!(frames[0].event, "done");
    }

    #[test]
    fn oversized_line_is_dropped_and_parsing_resumes() {
        let mut p = SseParser::new();
        let mut huge = b"data: ".to_vec();
        huge.extend(std::iter::repeat(b'a').take(MAX_LINE_BYTES + 10));
        assert!(feed_all(&mut p, &[huge.as_slice(), b"\n\n".as_slice()]).is_empty());
        assert!(p.buf.is_empty());

        let frames = feed_all(&mut p, &[b"event: status\ndata: ok\n\n"]);
        assert_eq!(frames, vec![SseFrame { event: "status".into(), data: "ok".into(), id: None }]);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut p = SseParser::new();
        assert!(feed_all(&mut p, &[b"id: 3\n\nevent: status\ndata: {\"x\""]).is_empty());
        p.reset();
        let frames = feed_all(&mut p, &[b"data: fresh\n\n"]);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "fresh");
        assert_eq!(p.last_event_id(), Some("3"));
    }
}
