//! # Stage: Stream Decoder
//!
//! ## Responsibility
//! Turns the raw byte stream of a chat-completions response into an ordered
//! sequence of content deltas.
//!
//! ## Framing
//! - Bytes are decoded incrementally; a multi-byte character split across two
//!   chunks is held back until its remaining bytes arrive.
//! - Decoded text is split on `\n`. Complete lines are processed, the partial
//!   remainder waits for the next chunk.
//! - Only lines beginning with `data: ` are significant. The trimmed remainder
//!   is the payload; `[DONE]` ends event processing, anything else must parse
//!   as a chunk object. Malformed payloads are logged and skipped.
//!
//! ## Guarantees
//! - Output is identical however the input is fragmented.
//! - Cancellation is observed before each chunk read and before each delta is
//!   handed to the caller.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::providers::StreamChunk;

/// Chunked byte source of one HTTP response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Incremental UTF-8
// ---------------------------------------------------------------------------

/// Streaming UTF-8 decoder. Invalid sequences become U+FFFD, incomplete
/// trailing sequences are carried into the next call.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&self.pending[start..valid]) {
                        out.push_str(s);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }

    fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push(char::REPLACEMENT_CHARACTER);
            self.pending.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// What a single line of the event stream contributed.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Ignored,
    Delta(String),
    Done,
    Malformed(String),
}

/// Classify one complete line (without its terminating `\n`).
pub fn parse_line(line: &str) -> LineOutcome {
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Ignored;
    };
    let payload = rest.trim();
    if payload == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => match chunk.into_content() {
            Some(content) if !content.is_empty() => LineOutcome::Delta(content),
            _ => LineOutcome::Ignored,
        },
        Err(e) => LineOutcome::Malformed(e.to_string()),
    }
}

/// Push-based SSE decoder. Feed it byte chunks, collect deltas.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Carry,
    buffer: String,
    done: bool,
    malformed: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of payloads skipped because they failed to parse.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    /// Decode one chunk and return the deltas completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.utf8.decode(chunk, &mut self.buffer);
        self.drain_lines()
    }

    /// Signal end of transport. A trailing partial line is discarded.
    pub fn finish(&mut self) -> Vec<String> {
        self.utf8.finish(&mut self.buffer);
        let deltas = self.drain_lines();
        if !self.buffer.is_empty() {
            debug!(target: "streamchat::decoder", bytes = self.buffer.len(), "discarding unterminated trailing line");
            self.buffer.clear();
        }
        deltas
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            if self.done {
                self.buffer.clear();
                break;
            }
            let line: String = self.buffer.drain(..=pos).collect();
            match parse_line(&line[..line.len() - 1]) {
                LineOutcome::Delta(d) => deltas.push(d),
                LineOutcome::Done => self.done = true,
                LineOutcome::Malformed(reason) => {
                    self.malformed += 1;
                    warn!(target: "streamchat::decoder", %reason, line = %line.trim_end(), "skipping malformed stream payload");
                }
                LineOutcome::Ignored => {}
            }
        }
        deltas
    }
}

// ---------------------------------------------------------------------------
// Pull-based delta stream
// ---------------------------------------------------------------------------

/// Lazy, finite, non-restartable sequence of deltas over a [`ByteStream`].
pub struct DeltaStream {
    inner: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    cancel: CancellationToken,
    exhausted: bool,
}

impl DeltaStream {
    pub fn new(inner: ByteStream, cancel: CancellationToken) -> Self {
        DeltaStream {
            inner,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            cancel,
            exhausted: false,
        }
    }

    /// Next delta, `Ok(None)` at end of transport, `Err(Cancelled)` as soon as
    /// the token fires.
    pub async fn next_delta(&mut self) -> Result<Option<String>, ChatError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            if let Some(delta) = self.pending.pop_front() {
                return Ok(Some(delta));
            }
            if self.exhausted {
                return Ok(None);
            }

            let cancel = &self.cancel;
            let inner = &mut self.inner;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                chunk = inner.next() => chunk,
            };

            match next {
                Some(Ok(bytes)) => {
                    let deltas = self.decoder.feed(&bytes);
                    self.pending.extend(deltas);
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.exhausted = true;
                    let deltas = self.decoder.finish();
                    self.pending.extend(deltas);
                }
            }
        }
    }
}
