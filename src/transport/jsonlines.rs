//! JSON-lines response decoding
//!
//! Streaming responses carry one [`ResponseItem`] per line. Chunks may split a
//! line anywhere (including inside a UTF-8 sequence), so bytes are buffered
//! until a newline arrives. A malformed line is logged and skipped; it never
//! aborts the rest of the stream.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};
use tracing::warn;

use super::ResponseStream;
use crate::error::TransportError;
use crate::tree::ResponseItem;

/// Incremental line decoder.
#[derive(Debug, Default)]
pub struct JsonLinesDecoder {
    buffer: Vec<u8>,
}

impl JsonLinesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every item completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ResponseItem> {
        let start = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        // Earlier bytes hold no newline; only the new chunk needs a scan.
        let Some(offset) = self.buffer[start..].iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let last_newline = start + offset;
        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();
        complete
            .split(|&b| b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Decode whatever is left after the final chunk.
    pub fn finish(&mut self) -> Option<ResponseItem> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }

    /// Bytes of an incomplete trailing line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Option<ResponseItem> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => {
            warn!(error = %e, "skipping non UTF-8 response line");
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(item) => Some(item),
        Err(e) => {
            let preview: String = text.chars().take(120).collect();
            warn!(error = %e, line = %preview, "skipping malformed response line");
            None
        }
    }
}

struct DecodeState<S> {
    body: S,
    decoder: JsonLinesDecoder,
    ready: VecDeque<ResponseItem>,
    done: bool,
}

/// Turn a chunked byte stream into a stream of response items.
///
/// A body error is yielded once and ends the stream; items already decoded
/// before it are delivered first.
pub fn decode_json_lines<S, B, E>(body: S) -> ResponseStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: JsonLinesDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((Ok(item), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let items = st.decoder.push(chunk.as_ref());
                    st.ready.extend(items);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(TransportError::Body(e.to_string())), st));
                }
                None => {
                    st.done = true;
                    if let Some(item) = st.decoder.finish() {
                        st.ready.push_back(item);
                    }
                }
            }
        }
    })
    .boxed()
}
