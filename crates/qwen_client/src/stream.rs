//! Incremental decoder for line-delimited `data: ` event streams.
//!
//! Network reads may split a frame, or a multi-byte character, anywhere. The
//! decoder carries the undecoded byte tail and the unterminated line between
//! calls to [`StreamDecoder::feed`], so feeding a body in any partition yields
//! the same events.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::debug;
use serde_json::Value;

use crate::error::Result;
use crate::events::StreamEvent;
use crate::transport::ByteStream;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Maps one parsed JSON frame to zero or more events.
pub trait FrameClassifier: Send + Sync {
    fn classify(&self, frame: Value) -> Vec<StreamEvent>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Drop a second text delta that exactly repeats the first one.
    pub suppress_duplicate_first_delta: bool,
}

#[derive(Debug, Default)]
enum FirstDelta {
    #[default]
    Unseen,
    Cached(String),
    Settled,
}

pub struct StreamDecoder {
    classifier: Arc<dyn FrameClassifier>,
    options: DecoderOptions,
    pending_bytes: Vec<u8>,
    buffer: String,
    first_delta: FirstDelta,
    finished: bool,
}

impl StreamDecoder {
    pub fn new(classifier: Arc<dyn FrameClassifier>, options: DecoderOptions) -> Self {
        Self {
            classifier,
            options,
            pending_bytes: Vec::new(),
            buffer: String::new(),
            first_delta: FirstDelta::Unseen,
            finished: false,
        }
    }

    /// True once a terminal frame has been seen; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume the next slice of the body and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        decode_utf8_into(&mut self.pending_bytes, chunk, &mut self.buffer);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return events;
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        for line in complete.split('\n') {
            self.process_line(line, &mut events);
            if self.finished {
                self.buffer.clear();
                self.pending_bytes.clear();
                break;
            }
        }

        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }

        if payload == DONE_SENTINEL {
            events.push(StreamEvent::Terminal);
            self.finished = true;
            return;
        }

        let frame = match serde_json::from_str::<Value>(payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping malformed stream frame ({}): {}", e, payload);
                return;
            }
        };

        for event in self.classifier.classify(frame) {
            let Some(event) = self.dedup(event) else {
                continue;
            };
            let terminal = matches!(event, StreamEvent::Terminal);
            events.push(event);
            if terminal {
                self.finished = true;
                return;
            }
        }
    }

    fn dedup(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if !self.options.suppress_duplicate_first_delta {
            return Some(event);
        }

        match std::mem::take(&mut self.first_delta) {
            FirstDelta::Unseen => {
                self.first_delta = match &event {
                    StreamEvent::TextDelta { content } => FirstDelta::Cached(content.clone()),
                    _ => FirstDelta::Unseen,
                };
                Some(event)
            }
            FirstDelta::Cached(first) => {
                self.first_delta = match &event {
                    StreamEvent::ThreadCreated { .. } => FirstDelta::Cached(first.clone()),
                    _ => FirstDelta::Settled,
                };
                match &event {
                    StreamEvent::TextDelta { content } if *content == first => {
                        debug!("Dropping replayed first delta");
                        None
                    }
                    _ => Some(event),
                }
            }
            FirstDelta::Settled => {
                self.first_delta = FirstDelta::Settled;
                Some(event)
            }
        }
    }
}

impl std::fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("options", &self.options)
            .field("buffered", &self.buffer.len())
            .field("pending_bytes", &self.pending_bytes.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Append `chunk` to `pending`, move every complete character into `out`, and
/// leave an unfinished trailing sequence in `pending`. Invalid sequences
/// become U+FFFD.
fn decode_utf8_into(pending: &mut Vec<u8>, chunk: &[u8], out: &mut String) {
    pending.extend_from_slice(chunk);

    let mut consumed = 0;
    loop {
        let remaining = &pending[consumed..];
        match std::str::from_utf8(remaining) {
            Ok(text) => {
                out.push_str(text);
                consumed = pending.len();
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&remaining[..valid]).unwrap_or_default());
                match e.error_len() {
                    Some(invalid) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        consumed += valid + invalid;
                    }
                    None => {
                        consumed += valid;
                        break;
                    }
                }
            }
        }
    }

    pending.drain(..consumed);
}

/// Drive `decoder` over `body`, stopping after the first terminal event. The
/// body is dropped with the returned stream.
pub fn decode_stream(mut body: ByteStream, mut decoder: StreamDecoder) -> EventStream {
    Box::pin(async_stream::stream! {
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for event in decoder.feed(&chunk) {
                yield Ok(event);
            }
            if decoder.is_finished() {
                return;
            }
        }
        if !decoder.buffer.is_empty() {
            debug!("Discarding {} bytes of unterminated stream data", decoder.buffer.len());
        }
    })
}
