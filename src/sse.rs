//! Server-sent event frame decoding
//!
//! Frames are separated by a blank line. Within a frame, `:` lines are
//! comments, `event:` sets the label and each `data:` line contributes one
//! line of payload. Payloads that are not valid JSON degrade to
//! `{"text": <raw>}` instead of failing the stream.

use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};

/// Event label used when a frame carries no `event:` line
pub(crate) const DEFAULT_EVENT: &str = "message";

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseFrame {
    pub(crate) event: String,
    pub(crate) data: Value,
}

/// Incremental decoder that buffers bytes until a frame boundary is seen
///
/// Bytes are buffered rather than text so multi-byte UTF-8 sequences split
/// across reads decode correctly.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no frame boundary
    scanned: usize,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of bytes, returning every frame it completes
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buf, self.scanned) {
            let raw: Vec<u8> = self.buf.drain(..end + sep_len).take(end).collect();
            self.scanned = 0;
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                frames.push(frame);
            }
        }
        // A separator is at most three bytes, so only the last two can start one
        self.scanned = self.buf.len().saturating_sub(2);
        frames
    }

    /// Decode whatever is left at end of input as a final frame
    pub(crate) fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let text = String::from_utf8_lossy(&rest);
        if text.trim().is_empty() {
            return None;
        }
        parse_frame(&text)
    }
}

/// Locate the first blank line at or after `from`, returning (frame end, separator length)
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Parse one raw frame; frames with no fields (comments or heartbeats) yield `None`
pub(crate) fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') || line.is_empty() {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.trim_start()),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    let data = if data.is_empty() {
        json!({})
    } else {
        serde_json::from_str(&data).unwrap_or_else(|_| json!({ "text": data }))
    };

    Some(SseFrame {
        event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
        data,
    })
}

/// Lazily decode a byte stream into frames
///
/// Each call starts a fresh decoder; read errors are passed through and end
/// the frame stream.
pub(crate) fn decode_stream<S, E>(body: S) -> impl Stream<Item = Result<SseFrame, E>>
where
    S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
{
    struct State<S> {
        body: S,
        decoder: FrameDecoder,
        ready: std::collections::VecDeque<SseFrame>,
        done: bool,
    }

    let state = State {
        body,
        decoder: FrameDecoder::new(),
        ready: Default::default(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.ready.pop_front() {
                return Some((Ok(frame), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let frames = st.decoder.push(&bytes);
                    st.ready.extend(frames);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.done = true;
                    st.ready.extend(st.decoder.finish());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_token_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"event: token\ndata: {\"content\":\"hi\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "token".to_string(),
                data: json!({ "content": "hi" }),
            }]
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_malformed_json_degrades_to_text() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: {not json\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, json!({ "text": "{not json" }));
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: tok").is_empty());
        assert!(decoder.push(b"en\ndata: {\"content\":").is_empty());
        assert!(decoder.push(b"\"a\"}\n").is_empty());
        let frames = decoder.push(b"\nevent: done\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, json!({ "content": "a" }));
        assert_eq!(frames[1].event, "done");
    }

    #[test]
    fn test_boundary_split_between_reads() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"content\":\"a\"}\n").is_empty());
        let frames = decoder.push(b"\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, json!({ "content": "a" }));

        assert!(decoder.push(b"data: {}\n\r").is_empty());
        assert_eq!(decoder.push(b"\n").len(), 1);
    }

    #[test]
    fn test_large_frame_fed_byte_by_byte() {
        let text = "x".repeat(64 * 1024);
        let raw = format!("event: token\ndata: {{\"content\":\"{}\"}}\n\n", text);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in raw.as_bytes() {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
            // Earlier bytes are never rescanned
            assert!(decoder.scanned + 2 >= decoder.buf.len());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, json!({ "content": text }));
        assert!(decoder.buf.is_empty());
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let bytes = "data: {\"content\":\"h\u{e9}\"}\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let frames = decoder.push(&bytes[split..]);
        assert_eq!(frames[0].data, json!({ "content": "h\u{e9}" }));
    }

    #[test]
    fn test_multiple_data_lines_joined_with_newline() {
        let frame = parse_frame("event: note\ndata: first\ndata: second").unwrap();
        assert_eq!(frame.event, "note");
        assert_eq!(frame.data, json!({ "text": "first\nsecond" }));
    }

    #[test]
    fn test_comments_and_crlf() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b": keep-alive\r\n\r\n").is_empty());
        let frames = decoder.push(b"event: token\r\ndata: {\"text\":\"x\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "token");
        assert_eq!(frames[0].data, json!({ "text": "x" }));
    }

    #[test]
    fn test_data_value_keeps_inner_colons() {
        let frame = parse_frame("data: {\"url\":\"http://x\"}").unwrap();
        assert_eq!(frame.data, json!({ "url": "http://x" }));
    }

    #[test]
    fn test_trailing_partial_frame_decoded_at_end() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: token\ndata: {\"content\":\"tail\"}").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.data, json!({ "content": "tail" }));
    }

    #[tokio::test]
    async fn test_decode_stream_yields_frames_in_order() {
        let chunks: Vec<Result<Vec<u8>, ()>> = vec![
            Ok(b"data: {\"content\":\"a\"}\n\ndata: {\"con".to_vec()),
            Ok(b"tent\":\"b\"}\n\nevent: done\ndata: {}".to_vec()),
        ];
        let frames: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;
        let events: Vec<_> = frames
            .into_iter()
            .map(|f| f.unwrap())
            .map(|f| (f.event, f.data))
            .collect();
        assert_eq!(
            events,
            vec![
                ("message".to_string(), json!({ "content": "a" })),
                ("message".to_string(), json!({ "content": "b" })),
                ("done".to_string(), json!({})),
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_passes_read_error() {
        let chunks: Vec<Result<Vec<u8>, &str>> =
            vec![Ok(b"data: {}\n\n".to_vec()), Err("reset"), Ok(b"data: {}\n\n".to_vec())];
        let frames: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert_eq!(frames[1], Err("reset"));
    }
}
