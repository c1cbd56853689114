//! NDJSON stream decoding for `/api/chat` and `/api/pull` responses.
//!
//! The transport hands us byte chunks that have nothing to do with line
//! boundaries. [`NdjsonDecoder`] keeps the unterminated tail of the previous
//! read and only ever decodes complete lines, so the same byte stream yields
//! the same frames no matter how it was split. [`decode_stream`] wraps the
//! decoder around a chunk stream and observes a [`CancellationToken`] before
//! every read.

use std::collections::VecDeque;
use std::fmt::Display;
use std::marker::PhantomData;

use futures_util::{Stream, StreamExt};
use memchr::memchr;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, ChatRequest, ChatResponseLine, ChatToolCall, PullProgressLine};
use crate::utils::url::construct_api_url;

/// Longest slice of a rejected line echoed into the log.
const MAX_LOGGED_LINE: usize = 160;

/// A frame type that can end an NDJSON response.
pub trait NdjsonFrame {
    fn is_terminal(&self) -> bool;
}

impl NdjsonFrame for ChatResponseLine {
    fn is_terminal(&self) -> bool {
        self.done
    }
}

impl NdjsonFrame for PullProgressLine {
    fn is_terminal(&self) -> bool {
        self.status == "success" || self.error.is_some()
    }
}

/// Protocol event consumed by the conversation reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEvent {
    pub delta_content: Option<String>,
    pub tool_calls: Option<Vec<ChatToolCall>>,
    pub done: bool,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration_nanos: Option<u64>,
    /// Error reported in-band by the server (`{"error": "..."}`).
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .is_some_and(|calls| !calls.is_empty())
    }
}

impl From<ChatResponseLine> for StreamEvent {
    fn from(line: ChatResponseLine) -> Self {
        let (delta_content, tool_calls) = match line.message {
            Some(message) => (
                message.content.filter(|content| !content.is_empty()),
                message.tool_calls.filter(|calls| !calls.is_empty()),
            ),
            None => (None, None),
        };
        Self {
            delta_content,
            tool_calls,
            done: line.done || line.error.is_some(),
            prompt_eval_count: line.prompt_eval_count,
            eval_count: line.eval_count,
            eval_duration_nanos: line.eval_duration,
            error: line.error,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream interrupted: {0}")]
    Transport(String),

    /// The body was non-empty but not a single line decoded.
    #[error("response contained no decodable frames")]
    NoFrames,
}

/// Incremental line splitter and JSON decoder.
pub struct NdjsonDecoder<T> {
    buffer: Vec<u8>,
    decoded: usize,
    dropped: usize,
    finished: bool,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for NdjsonDecoder<T>
where
    T: DeserializeOwned + NdjsonFrame,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NdjsonDecoder<T>
where
    T: DeserializeOwned + NdjsonFrame,
{
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            decoded: 0,
            dropped: 0,
            finished: false,
            _frame: PhantomData,
        }
    }

    /// Append a chunk and return every frame completed by it.
    ///
    /// Once a terminal frame is produced the decoder stops; the rest of the
    /// chunk and any later input are discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<T> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = memchr(b'\n', &self.buffer[consumed..]) {
            let end = consumed + offset;
            let frame = self.decode_line(consumed, end);
            consumed = end + 1;

            if let Some(frame) = frame {
                let terminal = frame.is_terminal();
                frames.push(frame);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    return frames;
                }
            }
        }
        self.buffer.drain(..consumed);
        frames
    }

    /// Decode whatever is left in the buffer once the transport is exhausted.
    pub fn finish(&mut self) -> Option<T> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let end = self.buffer.len();
        let frame = self.decode_line(0, end);
        self.buffer.clear();
        frame
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn decoded_count(&self) -> usize {
        self.decoded
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped
    }

    fn decode_line(&mut self, start: usize, end: usize) -> Option<T> {
        let text = match std::str::from_utf8(&self.buffer[start..end]) {
            Ok(text) => text.trim(),
            Err(err) => {
                self.dropped += 1;
                warn!(error = %err, "Dropping stream line with invalid UTF-8");
                return None;
            }
        };
        if text.is_empty() {
            return None;
        }

        match serde_json::from_str::<T>(text) {
            Ok(frame) => {
                self.decoded += 1;
                Some(frame)
            }
            Err(err) => {
                self.dropped += 1;
                warn!(
                    error = %err,
                    line = %truncate_for_log(text),
                    "Dropping malformed stream line"
                );
                None
            }
        }
    }
}

fn truncate_for_log(text: &str) -> &str {
    match text.char_indices().nth(MAX_LOGGED_LINE) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

struct DecodeState<S, T> {
    chunks: S,
    decoder: NdjsonDecoder<T>,
    pending: VecDeque<T>,
    cancel: CancellationToken,
    saw_bytes: bool,
    exhausted: bool,
}

/// Turn a chunk stream into a lazy stream of decoded frames.
///
/// The token is checked before every chunk read and races every pending
/// read, so after cancellation at most the read already in flight completes
/// and nothing further is yielded. The stream ends after the first terminal
/// frame even if the transport has more to give.
pub fn decode_stream<T, S, B, E>(
    chunks: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<T, StreamError>>
where
    T: DeserializeOwned + NdjsonFrame,
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = DecodeState {
        chunks,
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        saw_bytes: false,
        exhausted: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() {
                return None;
            }
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.exhausted {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return None,
                next = state.chunks.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    let bytes = bytes.as_ref();
                    state.saw_bytes |= !bytes.is_empty();
                    state.pending.extend(state.decoder.feed(bytes));
                    if state.decoder.is_finished() {
                        state.exhausted = true;
                    }
                }
                Some(Err(err)) => {
                    state.exhausted = true;
                    return Some((Err(StreamError::Transport(err.to_string())), state));
                }
                None => {
                    state.exhausted = true;
                    if let Some(frame) = state.decoder.finish() {
                        state.pending.push_back(frame);
                    }
                    if state.saw_bytes && state.decoder.decoded_count() == 0 {
                        return Some((Err(StreamError::NoFrames), state));
                    }
                }
            }
        }
    })
}

/// POST a JSON body and return the response once headers arrive.
///
/// The send races `cancel`; losing the race drops the request future, which
/// closes the connection instead of leaving it to finish in the background.
pub(crate) async fn post_streaming<R: Serialize + ?Sized>(
    client: &reqwest::Client,
    api_base: &str,
    endpoint: &str,
    body: &R,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, ApiError> {
    let url = construct_api_url(api_base, endpoint);
    let request = client.post(&url).json(body).send();

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ApiError::Cancelled),
        response = request => response.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?,
    };

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(ApiError::Status { status, body });
    }
    debug!(%url, %status, "Streaming response opened");
    Ok(response)
}

/// Issue a chat request and return its decoded event stream.
pub async fn open_chat_stream(
    client: &reqwest::Client,
    api_base: &str,
    request: &ChatRequest,
    cancel: CancellationToken,
) -> Result<impl Stream<Item = Result<StreamEvent, StreamError>>, ApiError> {
    let response = post_streaming(client, api_base, "api/chat", request, &cancel).await?;
    let frames = decode_stream::<ChatResponseLine, _, _, _>(
        Box::pin(response.bytes_stream()),
        cancel,
    );
    Ok(frames.map(|frame| frame.map(StreamEvent::from)))
}
