//! Incremental segmenter for streamed assistant replies.
//!
//! A reply is markdown, then a fenced block opened by `` ```json `` and closed by a bare
//! `` ``` ``, then more markdown. [`StreamSegmenter`] splits the bytes into an intro, a parsed
//! plant list and a summary while the body is still arriving:
//!
//! ```
//! use plantcare_chat::segmenter::{SegmentDelta, StreamSegmenter};
//!
//! let mut segmenter = StreamSegmenter::new();
//! let mut deltas = segmenter.feed(b"Try these:\n```json");
//! deltas.extend(segmenter.feed(br#"[{"common_name":"Fern","description":"Shade","url":"/f.png"}]"#));
//! deltas.extend(segmenter.feed(b"```\nEnjoy!"));
//! let last = segmenter.finish();
//!
//! assert_eq!(deltas[0], SegmentDelta::Intro("Try these:\n".into()));
//! assert_eq!(last.plants.as_ref().map(Vec::len), Some(1));
//! assert_eq!(last.summary, "\nEnjoy!");
//! ```

mod decoder;

pub use decoder::Utf8StreamDecoder;

use tracing::{debug, warn};

use crate::message::PlantSummary;

/// Marker that opens the embedded plant list.
pub const OPEN_FENCE: &str = "```json";
/// Marker that closes the embedded plant list.
pub const CLOSE_FENCE: &str = "```";

/// Incremental output of the segmenter, in source order.
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentDelta {
    /// Text appended to the introduction.
    Intro(String),
    /// The opening fence was consumed; the plant list is being received.
    JsonOpened,
    /// The complete plant list. Emitted at most once per stream, when the closing fence
    /// arrives. Empty when the fenced text was not a valid plant array.
    Plants(Vec<PlantSummary>),
    /// Text appended to the summary.
    Summary(String),
}

/// Which segment the segmenter is currently collecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserPhase {
    BeforeJson,
    InJson,
    AfterJson,
}

/// Parsing irregularity that was recovered from instead of failing the stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum Degradation {
    #[error("fenced JSON block did not parse: {message}")]
    MalformedJson { message: String },
    #[error("stream ended without a JSON block")]
    MissingJsonBlock,
    #[error("stream ended inside an unterminated JSON block ({} bytes unparsed)", .raw.len())]
    UnterminatedJsonBlock { raw: String },
}

/// Result of [`StreamSegmenter::finish`].
#[derive(Clone, Debug, PartialEq)]
pub struct FinalState {
    /// Deltas released by the end-of-stream flush.
    pub flushed: Vec<SegmentDelta>,
    pub intro: String,
    /// `None` when no fenced block was closed.
    pub plants: Option<Vec<PlantSummary>>,
    pub summary: String,
    pub phase: ParserPhase,
    pub degradation: Option<Degradation>,
}

impl FinalState {
    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

/// Finds the closing fence, skipping backticks inside JSON string literals.
///
/// State carries across calls so each byte is inspected once. JSON strings cannot hold a raw
/// newline, so one ends the string state. A string left open by a newline or by the end of the
/// stream was a stray quote, and the first fence it hid is taken as the close.
#[derive(Debug, Default)]
struct FenceScanner {
    pos: usize,
    in_string: bool,
    escaped: bool,
    hidden_fence: Option<usize>,
}

impl FenceScanner {
    fn scan(&mut self, buf: &str, at_end: bool) -> Option<usize> {
        let bytes = buf.as_bytes();
        let mut i = self.pos;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'`' && !self.escaped {
                let run = bytes[i..]
                    .iter()
                    .take(CLOSE_FENCE.len())
                    .take_while(|&&c| c == b'`')
                    .count();
                if run == CLOSE_FENCE.len() {
                    if !self.in_string {
                        self.pos = i;
                        return Some(i);
                    }
                    self.hidden_fence.get_or_insert(i);
                } else if i + run == bytes.len() && !at_end {
                    // could still become a fence
                    self.pos = i;
                    return None;
                }
                i += run;
                continue;
            }
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    self.hidden_fence = None;
                } else if b == b'\n' {
                    self.in_string = false;
                    if let Some(idx) = self.hidden_fence.take() {
                        self.pos = idx;
                        return Some(idx);
                    }
                }
            } else if b == b'"' {
                self.in_string = true;
            }
            i += 1;
        }
        self.pos = i;
        if at_end {
            return self.hidden_fence.take();
        }
        None
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `marker`.
fn partial_marker_suffix(buf: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&k| buf.ends_with(&marker[..k]))
        .unwrap_or(0)
}

/// Splits a streamed reply into intro, plant list and summary.
///
/// Create one per reply. [`finish`](Self::finish) consumes the segmenter, so a finished
/// instance cannot be fed again.
#[derive(Debug)]
pub struct StreamSegmenter {
    decoder: Utf8StreamDecoder,
    buffer: String,
    phase: ParserPhase,
    scanner: FenceScanner,
    json_parsed: bool,
    intro: String,
    plants: Option<Vec<PlantSummary>>,
    summary: String,
    degradation: Option<Degradation>,
    bytes_in: usize,
}

impl Default for StreamSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSegmenter {
    pub fn new() -> Self {
        Self {
            decoder: Utf8StreamDecoder::new(),
            buffer: String::new(),
            phase: ParserPhase::BeforeJson,
            scanner: FenceScanner::default(),
            json_parsed: false,
            intro: String::new(),
            plants: None,
            summary: String::new(),
            degradation: None,
            bytes_in: 0,
        }
    }

    pub fn phase(&self) -> ParserPhase {
        self.phase
    }

    /// True once a fenced block closed and parsed as a plant list.
    pub fn json_parsed(&self) -> bool {
        self.json_parsed
    }

    pub fn bytes_in(&self) -> usize {
        self.bytes_in
    }

    /// Accepts the next body chunk and returns the deltas it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SegmentDelta> {
        self.bytes_in += chunk.len();
        let text = self.decoder.decode(chunk);
        let mut out = Vec::new();
        if text.is_empty() {
            return out;
        }
        self.buffer.push_str(&text);
        self.dispatch(false, &mut out);
        out
    }

    /// Flushes the decoder and any held-back text of the active segment.
    pub fn finish(mut self) -> FinalState {
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let mut flushed = Vec::new();
        self.dispatch(true, &mut flushed);

        match self.phase {
            ParserPhase::BeforeJson => {
                debug!(
                    intro_bytes = self.intro.len(),
                    "reply ended without a JSON block; text kept as intro"
                );
                self.degradation = Some(Degradation::MissingJsonBlock);
            }
            ParserPhase::InJson => {
                let raw = std::mem::take(&mut self.buffer);
                warn!(
                    unparsed_bytes = raw.len(),
                    "reply ended inside an unterminated JSON block"
                );
                self.degradation = Some(Degradation::UnterminatedJsonBlock { raw });
            }
            ParserPhase::AfterJson => {}
        }

        FinalState {
            flushed,
            intro: self.intro,
            plants: self.plants,
            summary: self.summary,
            phase: self.phase,
            degradation: self.degradation,
        }
    }

    fn dispatch(&mut self, at_end: bool, out: &mut Vec<SegmentDelta>) {
        loop {
            match self.phase {
                ParserPhase::BeforeJson => {
                    if let Some(idx) = self.buffer.find(OPEN_FENCE) {
                        let mut rest = self.buffer.split_off(idx);
                        let intro = std::mem::take(&mut self.buffer);
                        self.push_intro(intro, out);
                        rest.drain(..OPEN_FENCE.len());
                        self.buffer = rest;
                        self.phase = ParserPhase::InJson;
                        self.scanner = FenceScanner::default();
                        debug!(bytes_in = self.bytes_in, "opening JSON fence found");
                        out.push(SegmentDelta::JsonOpened);
                        continue;
                    }
                    let hold = if at_end {
                        0
                    } else {
                        partial_marker_suffix(&self.buffer, OPEN_FENCE)
                    };
                    let held = self.buffer.split_off(self.buffer.len() - hold);
                    let intro = std::mem::replace(&mut self.buffer, held);
                    self.push_intro(intro, out);
                    return;
                }
                ParserPhase::InJson => {
                    let Some(idx) = self.scanner.scan(&self.buffer, at_end) else {
                        return;
                    };
                    let rest = self.buffer.split_off(idx + CLOSE_FENCE.len());
                    let mut raw = std::mem::replace(&mut self.buffer, rest);
                    raw.truncate(idx);
                    let plants = self.parse_block(&raw);
                    debug!(plants = plants.len(), "closing JSON fence found");
                    self.plants = Some(plants.clone());
                    self.phase = ParserPhase::AfterJson;
                    out.push(SegmentDelta::Plants(plants));
                    continue;
                }
                ParserPhase::AfterJson => {
                    if !self.buffer.is_empty() {
                        let text = std::mem::take(&mut self.buffer);
                        self.summary.push_str(&text);
                        out.push(SegmentDelta::Summary(text));
                    }
                    return;
                }
            }
        }
    }

    fn push_intro(&mut self, text: String, out: &mut Vec<SegmentDelta>) {
        if text.is_empty() {
            return;
        }
        self.intro.push_str(&text);
        out.push(SegmentDelta::Intro(text));
    }

    fn parse_block(&mut self, raw: &str) -> Vec<PlantSummary> {
        match serde_json::from_str::<Vec<PlantSummary>>(raw.trim()) {
            Ok(plants) => {
                self.json_parsed = true;
                plants
            }
            Err(err) => {
                warn!(error = %err, raw_bytes = raw.len(), "fenced JSON block did not parse; continuing without plants");
                self.degradation = Some(Degradation::MalformedJson {
                    message: err.to_string(),
                });
                Vec::new()
            }
        }
    }
}
