//! Frame Codec
//!
//! Encoding and decoding of the streaming service's wire framing.
//!
//! # Wire Format
//!
//! Every text message carries one or more frames:
//!
//! ```text
//! ~m~{len}~m~{payload}
//! ```
//!
//! `len` is the payload length in characters. The payload is either a JSON
//! object `{"m": method, "p": [params...]}`, the server hello (a JSON object
//! without `m`), or a heartbeat token `~h~{n}`. Heartbeats also arrive bare,
//! outside a frame; a bare token runs to the next delimiter or the end of the
//! input.
//!
//! # Error Recovery
//!
//! Decoding never stops at a bad frame. The frame is reported as a
//! [`CodecError`], dropped, and decoding resumes at the next `~m~` or `~h~`
//! delimiter. Input that ends mid-frame is returned as the remainder, to be
//! prepended to the next chunk.

use serde_json::{Map, Value};

/// Frame delimiter.
pub const FRAME_DELIMITER: &str = "~m~";

/// Heartbeat token prefix.
pub const HEARTBEAT_PREFIX: &str = "~h~";

/// Longest accepted length prefix, in digits.
const MAX_LENGTH_DIGITS: usize = 10;

/// Upper bound on buffered partial input before it is discarded.
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Protocol errors. Each one drops a single frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The length prefix is empty, not numeric, or too large.
    #[error("bad length prefix: {0:?}")]
    BadLength(String),

    /// The declared length does not end at a frame boundary.
    #[error("declared length {declared} does not match frame content")]
    LengthMismatch {
        /// Length from the prefix.
        declared: usize,
    },

    /// The payload is not valid JSON.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    /// Valid JSON of an unexpected shape (`m` not a string, `p` not a list).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Bytes outside any frame.
    #[error("unexpected data outside a frame: {0:?}")]
    UnexpectedData(String),

    /// Partial input grew past [`MAX_PENDING_BYTES`].
    #[error("pending input exceeded {0} bytes; buffer discarded")]
    BufferOverflow(usize),
}

impl CodecError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BadLength(_) => "bad_length",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::InvalidJson(_) => "invalid_json",
            Self::InvalidMessage(_) => "invalid_message",
            Self::UnexpectedData(_) => "unexpected_data",
            Self::BufferOverflow(_) => "buffer_overflow",
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// A method call `{"m": method, "p": params}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Method name.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<Value>,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Parameter at `index`.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }

    /// String parameter at `index`.
    #[must_use]
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(Value::as_str)
    }

    /// Encode as one wire frame.
    #[must_use]
    pub fn encode(&self) -> String {
        encode(&self.method, self.params.clone())
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Heartbeat token (`~h~42`), to be echoed back unchanged.
    Heartbeat(String),
    /// The server hello sent first on every connection.
    Hello(Value),
    /// A method call.
    Message(Message),
}

// =============================================================================
// Encoding
// =============================================================================

/// Wrap a raw payload in a frame.
#[must_use]
pub fn frame(payload: &str) -> String {
    format!("{FRAME_DELIMITER}{}{FRAME_DELIMITER}{payload}", payload.chars().count())
}

/// Encode one command frame.
#[must_use]
pub fn encode(method: &str, params: Vec<Value>) -> String {
    let mut object = Map::new();
    object.insert("m".to_string(), Value::String(method.to_string()));
    object.insert("p".to_string(), Value::Array(params));
    frame(&Value::Object(object).to_string())
}

/// Frame that echoes a heartbeat token.
#[must_use]
pub fn heartbeat(token: &str) -> String {
    frame(token)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode every complete frame in `input`.
///
/// Returns the decoded frames (or per-frame errors) in order and the
/// unconsumed remainder, which starts at an incomplete frame or is empty.
/// A bare `~h~N` heartbeat is only complete once a non-digit follows it.
#[must_use]
pub fn decode(input: &str) -> (Vec<Result<Frame, CodecError>>, &str) {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];

        if rest.starts_with(FRAME_DELIMITER) {
            match decode_frame(rest) {
                Step::Frame(frame, consumed) => {
                    frames.push(frame);
                    pos += consumed;
                }
                Step::Incomplete => return (frames, rest),
                Step::Skip(error, from) => {
                    frames.push(Err(error));
                    match resync(input, pos + from) {
                        Resync::At(next) => pos = next,
                        Resync::Exhausted(keep) => return (frames, &input[keep..]),
                    }
                }
            }
        } else if let Some(token) = rest.strip_prefix(HEARTBEAT_PREFIX) {
            let digits = token
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(token.len());
            // The digit run may continue in the next chunk.
            if digits == token.len() {
                return (frames, rest);
            }
            if digits == 0 {
                frames.push(Err(CodecError::UnexpectedData(snippet(rest))));
                match resync(input, pos + HEARTBEAT_PREFIX.len()) {
                    Resync::At(next) => pos = next,
                    Resync::Exhausted(keep) => return (frames, &input[keep..]),
                }
            } else {
                let end = HEARTBEAT_PREFIX.len() + digits;
                frames.push(Ok(Frame::Heartbeat(rest[..end].to_string())));
                pos += end;
            }
        } else {
            match resync(input, pos + 1) {
                Resync::At(next) => {
                    frames.push(Err(CodecError::UnexpectedData(snippet(&input[pos..next]))));
                    pos = next;
                }
                Resync::Exhausted(_) => {
                    let keep = input.len() - partial_delimiter_len(rest);
                    if keep > pos {
                        frames.push(Err(CodecError::UnexpectedData(snippet(&input[pos..keep]))));
                    }
                    return (frames, &input[keep..]);
                }
            }
        }
    }

    (frames, "")
}

enum Step {
    /// A frame (or payload error) and the bytes it spans.
    Frame(Result<Frame, CodecError>, usize),
    /// More input is needed.
    Incomplete,
    /// Drop the frame; resync from this offset.
    Skip(CodecError, usize),
}

/// Decode one `~m~len~m~payload` frame at the start of `rest`.
fn decode_frame(rest: &str) -> Step {
    let after_open = &rest[FRAME_DELIMITER.len()..];
    let digits_len = after_open
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after_open.len());
    let digits = &after_open[..digits_len];

    if digits_len > MAX_LENGTH_DIGITS {
        return Step::Skip(CodecError::BadLength(snippet(digits)), FRAME_DELIMITER.len());
    }
    if digits_len == after_open.len() {
        return Step::Incomplete;
    }

    let after_digits = &after_open[digits_len..];
    if !after_digits.starts_with(FRAME_DELIMITER) {
        if FRAME_DELIMITER.starts_with(after_digits) {
            return Step::Incomplete;
        }
        return Step::Skip(CodecError::BadLength(snippet(after_open)), FRAME_DELIMITER.len());
    }
    let Ok(declared) = digits.parse::<usize>() else {
        return Step::Skip(CodecError::BadLength(snippet(digits)), FRAME_DELIMITER.len());
    };

    let body_start = FRAME_DELIMITER.len() + digits_len + FRAME_DELIMITER.len();
    let body = &rest[body_start..];
    let Some(payload_len) = char_offset(body, declared) else {
        return Step::Incomplete;
    };

    let trailing = &body[payload_len..];
    let at_boundary = trailing.is_empty()
        || trailing.starts_with(FRAME_DELIMITER)
        || trailing.starts_with(HEARTBEAT_PREFIX);
    if !at_boundary {
        if trailing.len() < FRAME_DELIMITER.len()
            && (FRAME_DELIMITER.starts_with(trailing) || HEARTBEAT_PREFIX.starts_with(trailing))
        {
            return Step::Incomplete;
        }
        return Step::Skip(CodecError::LengthMismatch { declared }, body_start);
    }

    Step::Frame(parse_payload(&body[..payload_len]), body_start + payload_len)
}

/// Byte offset of the `chars`-th character, or `None` if `s` is shorter.
fn char_offset(s: &str, chars: usize) -> Option<usize> {
    if chars == 0 {
        return Some(0);
    }
    match s.char_indices().nth(chars) {
        Some((offset, _)) => Some(offset),
        None if s.chars().count() == chars => Some(s.len()),
        None => None,
    }
}

enum Resync {
    /// Next delimiter starts here.
    At(usize),
    /// No delimiter; keep input from here (a possible partial delimiter).
    Exhausted(usize),
}

/// Find the next delimiter in `input` at or after byte `from`.
fn resync(input: &str, from: usize) -> Resync {
    let from = ceil_char_boundary(input, from);
    let tail = &input[from..];
    let next = [FRAME_DELIMITER, HEARTBEAT_PREFIX]
        .iter()
        .filter_map(|delimiter| tail.find(*delimiter))
        .min();
    match next {
        Some(offset) => Resync::At(from + offset),
        None => Resync::Exhausted(input.len() - partial_delimiter_len(tail)),
    }
}

/// Length of the longest suffix of `s` that could start a delimiter.
fn partial_delimiter_len(s: &str) -> usize {
    (1..FRAME_DELIMITER.len())
        .rev()
        .find(|&n| {
            s.len() >= n && s.is_char_boundary(s.len() - n) && {
                let suffix = &s[s.len() - n..];
                FRAME_DELIMITER.starts_with(suffix) || HEARTBEAT_PREFIX.starts_with(suffix)
            }
        })
        .unwrap_or(0)
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index.min(s.len())
}

/// Interpret one payload.
fn parse_payload(payload: &str) -> Result<Frame, CodecError> {
    if payload.starts_with(HEARTBEAT_PREFIX) {
        return Ok(Frame::Heartbeat(payload.to_string()));
    }

    let value: Value =
        serde_json::from_str(payload).map_err(|e| CodecError::InvalidJson(e.to_string()))?;

    let Value::Object(mut object) = value else {
        return Err(CodecError::InvalidMessage(snippet(payload)));
    };

    let Some(method) = object.remove("m") else {
        return Ok(Frame::Hello(Value::Object(object)));
    };
    let Value::String(method) = method else {
        return Err(CodecError::InvalidMessage(format!("method is not a string: {method}")));
    };
    let params = match object.remove("p") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params,
        Some(other) => {
            return Err(CodecError::InvalidMessage(format!(
                "params of {method} are not a list: {}",
                snippet(&other.to_string())
            )));
        }
    };

    Ok(Frame::Message(Message { method, params }))
}

fn snippet(s: &str) -> String {
    s.chars().take(64).collect()
}

// =============================================================================
// Streaming Decoder
// =============================================================================

/// Stateful decoder for one connection: buffers partial frames across
/// chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: String,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<Result<Frame, CodecError>> {
        self.pending.push_str(chunk);
        let (frames, remainder) = decode(&self.pending);
        let consumed = self.pending.len() - remainder.len();
        self.pending.drain(..consumed);

        if self.pending.len() > MAX_PENDING_BYTES {
            self.pending.clear();
            let mut frames = frames;
            frames.push(Err(CodecError::BufferOverflow(MAX_PENDING_BYTES)));
            return frames;
        }
        frames
    }

    /// Bytes waiting for the rest of a frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop buffered input (new connection).
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
