//! Server-sent-event decoding.
//!
//! Turns the raw byte stream of a streaming chat completion into cumulative
//! [`ContentSnapshot`]s. Frames are only decoded once their blank-line
//! boundary has arrived, so a multi-byte character split across two network
//! chunks is never decoded half-way.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::error::EngineError;
use crate::protocol::StreamChunk;

/// Everything generated so far for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSnapshot {
    pub exchange_id: u64,
    pub text: String,
    pub is_final: bool,
}

impl ContentSnapshot {
    pub fn new(exchange_id: u64, text: impl Into<String>) -> Self {
        Self {
            exchange_id,
            text: text.into(),
            is_final: false,
        }
    }

    /// True when `self` can follow `previous` within the same exchange.
    pub fn extends(&self, previous: &ContentSnapshot) -> bool {
        self.exchange_id == previous.exchange_id && self.text.starts_with(&previous.text)
    }
}

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Delta(String),
    Done,
    /// Comments, keep-alives and frames without a content delta.
    Ignored,
}

/// Byte-level frame splitter for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
}

impl SseFrameDecoder {
    /// Feed arbitrary bytes and drain every frame whose boundary has arrived.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<SseFrame, EngineError>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some((end, boundary_len)) = find_frame_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + boundary_len).take(end).collect();
            frames.push(decode_frame(&frame));
        }

        frames
    }

    /// Decode whatever is left once the body ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<Result<SseFrame, EngineError>> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            self.buffer.clear();
            return None;
        }
        let frame = std::mem::take(&mut self.buffer);
        Some(decode_frame(&frame))
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(|b| b.is_ascii_whitespace())
    }
}

fn find_frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else {
            None
        }
    })
}

fn decode_frame(frame: &[u8]) -> Result<SseFrame, EngineError> {
    let text = String::from_utf8_lossy(frame);
    let data_lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data_lines.is_empty() {
        return Ok(SseFrame::Ignored);
    }

    let payload = data_lines.join("\n");
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseFrame::Ignored);
    }
    if payload == "[DONE]" {
        return Ok(SseFrame::Done);
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| EngineError::Parse(format!("malformed SSE frame: {e}")))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(EngineError::Parse(format!("server reported error: {message}")));
    }

    let chunk: StreamChunk = serde_json::from_value(value)
        .map_err(|e| EngineError::Parse(format!("unexpected SSE payload: {e}")))?;
    let delta: String = chunk
        .choices
        .iter()
        .filter_map(|choice| choice.delta.content.as_deref())
        .collect();

    if delta.is_empty() {
        Ok(SseFrame::Ignored)
    } else {
        Ok(SseFrame::Delta(delta))
    }
}

/// Final state of a drained stream. `error` is set when the transport failed
/// part-way; `snapshot` still holds everything received before that.
#[derive(Debug)]
pub struct StreamOutcome {
    pub snapshot: ContentSnapshot,
    pub error: Option<EngineError>,
}

/// Wraps a byte stream and yields cumulative snapshots.
pub struct StreamDecoder<S> {
    inner: S,
    frames: SseFrameDecoder,
    pending: VecDeque<Result<SseFrame, EngineError>>,
    accumulated: String,
    exchange_id: u64,
    finished: bool,
}

impl<S> StreamDecoder<S>
where
    S: Stream<Item = Result<Bytes, EngineError>> + Unpin,
{
    pub fn new(exchange_id: u64, inner: S) -> Self {
        Self {
            inner,
            frames: SseFrameDecoder::default(),
            pending: VecDeque::new(),
            accumulated: String::new(),
            exchange_id,
            finished: false,
        }
    }

    pub fn exchange_id(&self) -> u64 {
        self.exchange_id
    }

    /// Snapshot of the text accumulated so far.
    pub fn current(&self) -> ContentSnapshot {
        ContentSnapshot::new(self.exchange_id, self.accumulated.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next cumulative snapshot, `None` once the stream has ended.
    ///
    /// The last `Ok` snapshot has `is_final` set. An `Err` also ends the
    /// stream; `current()` still returns the partial text.
    pub async fn next_snapshot(&mut self) -> Option<Result<ContentSnapshot, EngineError>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(frame) = self.pending.pop_front() {
                match frame {
                    Ok(SseFrame::Delta(delta)) => {
                        self.accumulated.push_str(&delta);
                        return Some(Ok(self.current()));
                    }
                    Ok(SseFrame::Done) => return Some(Ok(self.finish_snapshot())),
                    Ok(SseFrame::Ignored) => continue,
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }

            match self.inner.next().await {
                Some(Ok(bytes)) => {
                    let frames = self.frames.feed(&bytes);
                    self.pending.extend(frames);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => match self.frames.finish() {
                    Some(frame) => self.pending.push_back(frame),
                    None => return Some(Ok(self.finish_snapshot())),
                },
            }
        }
    }

    fn finish_snapshot(&mut self) -> ContentSnapshot {
        self.finished = true;
        self.pending.clear();
        let mut snapshot = self.current();
        snapshot.is_final = true;
        snapshot
    }

    /// Drain the stream, handing every snapshot to `sink`.
    pub async fn drive<F>(mut self, mut sink: F) -> StreamOutcome
    where
        F: FnMut(&ContentSnapshot),
    {
        let mut error = None;
        let mut last = None;
        while let Some(next) = self.next_snapshot().await {
            match next {
                Ok(snapshot) => {
                    sink(&snapshot);
                    last = Some(snapshot);
                }
                Err(e) => {
                    tracing::warn!(exchange_id = self.exchange_id, error = %e, "stream ended with error");
                    error = Some(e);
                }
            }
        }
        let snapshot = match last {
            Some(snapshot) if error.is_none() => snapshot,
            _ => self.current(),
        };
        StreamOutcome { snapshot, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn delta_frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    fn byte_stream(
        chunks: Vec<Result<Vec<u8>, EngineError>>,
    ) -> impl Stream<Item = Result<Bytes, EngineError>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| c.map(Bytes::from)))
    }

    #[test]
    fn test_feed_buffers_partial_frames() {
        let mut decoder = SseFrameDecoder::default();
        let frame = delta_frame("Hello");
        let (a, b) = frame.split_at(10);

        assert!(decoder.feed(a.as_bytes()).is_empty());
        let frames = decoder.feed(b.as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &SseFrame::Delta("Hello".to_string()));
        assert!(decoder.is_empty_buffer());
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut decoder = SseFrameDecoder::default();
        let frame = delta_frame("héllo ✓");
        let bytes = frame.as_bytes();
        let check = frame.find('✓').unwrap();

        let mut frames = decoder.feed(&bytes[..check + 1]);
        frames.extend(decoder.feed(&bytes[check + 1..]));
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &SseFrame::Delta("héllo ✓".to_string())
        );
    }

    #[test]
    fn test_done_comment_and_crlf_frames() {
        let mut decoder = SseFrameDecoder::default();
        let frames = decoder.feed(b": keep-alive\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &SseFrame::Ignored);
        assert_eq!(frames[1].as_ref().unwrap(), &SseFrame::Done);
    }

    #[test]
    fn test_malformed_frame_is_parse_error() {
        let mut decoder = SseFrameDecoder::default();
        let frames = decoder.feed(b"data: {\"choices\": [\n\n");
        assert!(matches!(frames[0], Err(EngineError::Parse(_))));
    }

    #[tokio::test]
    async fn test_snapshots_are_monotonic() {
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            delta_frame("fn "),
            delta_frame("main() "),
            delta_frame("{}")
        );
        // Re-chunk at awkward offsets.
        let chunks: Vec<_> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let decoder = StreamDecoder::new(1, byte_stream(chunks));

        let mut seen: Vec<ContentSnapshot> = Vec::new();
        let outcome = decoder.drive(|s| seen.push(s.clone())).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.snapshot.text, "fn main() {}");
        assert!(outcome.snapshot.is_final);
        for pair in seen.windows(2) {
            assert!(pair[1].extends(&pair[0]));
        }
        assert_eq!(seen.first().unwrap().text, "fn ");
    }

    #[tokio::test]
    async fn test_transport_error_keeps_partial_snapshot() {
        let chunks = vec![
            Ok(delta_frame("partial ").into_bytes()),
            Ok(delta_frame("output").into_bytes()),
            Err(EngineError::transport("http://localhost", "connection reset")),
        ];
        let outcome = StreamDecoder::new(3, byte_stream(chunks)).drive(|_| {}).await;

        assert_eq!(outcome.snapshot.text, "partial output");
        assert_eq!(outcome.snapshot.exchange_id, 3);
        assert!(matches!(outcome.error, Some(EngineError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_body_without_done_still_finishes() {
        let chunks = vec![Ok(delta_frame("a").into_bytes()), Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}".to_vec())];
        let mut decoder = StreamDecoder::new(1, byte_stream(chunks));
        let mut last = None;
        while let Some(next) = decoder.next_snapshot().await {
            last = Some(next.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.text, "ab");
        assert!(last.is_final);
    }
}
