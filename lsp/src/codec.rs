//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameDecoder`] is the incremental two-phase parser (header, then body)
//! that tolerates arbitrary chunk boundaries. [`FrameReader`] and
//! [`FrameWriter`] wrap it for async streams, and [`encode`]/[`decode`]
//! convert between [`Message`] and body bytes.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::LspError;

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Longest header block accepted before the stream is declared broken.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// JSON-RPC request id. Ids we issue are numbers; servers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub const METHOD_NOT_FOUND: i64 = -32601;

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }
}

impl From<ResponseError> for LspError {
    fn from(error: ResponseError) -> Self {
        LspError::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// One decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, ResponseError>,
    },
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ResponseError>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

/// Distinguishes `"result": null` (present) from a missing `result`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Serialize a message into a complete frame: header plus UTF-8 body.
pub fn encode(message: &Message) -> Result<Vec<u8>, LspError> {
    let envelope = match message {
        Message::Request { id, method, params } => OutgoingEnvelope {
            jsonrpc: "2.0",
            id: Some(id),
            method: Some(method),
            params: params.as_ref(),
            result: None,
            error: None,
        },
        Message::Notification { method, params } => OutgoingEnvelope {
            jsonrpc: "2.0",
            id: None,
            method: Some(method),
            params: params.as_ref(),
            result: None,
            error: None,
        },
        Message::Response { id, outcome } => OutgoingEnvelope {
            jsonrpc: "2.0",
            id: Some(id),
            method: None,
            params: None,
            result: outcome.as_ref().ok(),
            error: outcome.as_ref().err(),
        },
    };

    let body = serde_json::to_vec(&envelope).map_err(|e| LspError::Parse(e.to_string()))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse a frame body into a message.
///
/// A body with `id` and `method` is a server-to-client request; `id` with
/// `error` is a failed response; any other `id` is a successful response
/// (missing `result` reads as `null`). No `id` means notification.
pub fn decode(body: &[u8]) -> Result<Message, LspError> {
    let envelope: IncomingEnvelope =
        serde_json::from_slice(body).map_err(|e| LspError::Parse(e.to_string()))?;

    match (envelope.id, envelope.method) {
        (Some(id), Some(method)) => Ok(Message::Request {
            id,
            method,
            params: envelope.params,
        }),
        (Some(id), None) => {
            let outcome = match envelope.error {
                Some(error) => Err(error),
                None => Ok(envelope.result.unwrap_or(Value::Null)),
            };
            Ok(Message::Response { id, outcome })
        }
        (None, Some(method)) => Ok(Message::Notification {
            method,
            params: envelope.params,
        }),
        (None, None) => Err(LspError::Parse(
            "message has neither `id` nor `method`".to_string(),
        )),
    }
}

/// Output of the incremental decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// Exactly `Content-Length` body bytes.
    Body(Vec<u8>),
    /// A header block without a usable `Content-Length`; already discarded.
    Malformed { header: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body { len: usize },
}

/// Incremental `Content-Length` frame parser.
///
/// Bytes are pushed as they arrive; [`FrameDecoder::next_frame`] yields a
/// frame only once every body byte is buffered. Bytes past the end of a
/// frame are kept as the start of the next header.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    phase: Phase,
    /// Offset up to which `buf` is known not to contain the terminator.
    scanned: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            phase: Phase::Header,
            scanned: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet emitted.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors on an oversized
    /// `Content-Length` or a header block longer than [`MAX_HEADER_BYTES`],
    /// both of which leave the stream unrecoverable.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        while self.phase == Phase::Header {
            let Some(end) = self.find_terminator() else {
                if self.buf.len() > MAX_HEADER_BYTES {
                    bail!(
                        "{} bytes without a header terminator (limit {MAX_HEADER_BYTES})",
                        self.buf.len()
                    );
                }
                return Ok(None);
            };
            if end > MAX_HEADER_BYTES {
                bail!("header block of {end} bytes exceeds maximum {MAX_HEADER_BYTES}");
            }

            let header_bytes: Vec<u8> = self.buf.drain(..end + HEADER_TERMINATOR.len()).collect();
            self.scanned = 0;
            let header = String::from_utf8_lossy(&header_bytes[..end]).into_owned();

            match parse_content_length(&header) {
                Some(len) if len > MAX_FRAME_BYTES => {
                    bail!("Content-Length {len} exceeds maximum {MAX_FRAME_BYTES}");
                }
                Some(len) => self.phase = Phase::Body { len },
                None if header.trim().is_empty() => {}
                None => return Ok(Some(DecodedFrame::Malformed { header })),
            }
        }

        let Phase::Body { len } = self.phase else {
            return Ok(None);
        };
        if self.buf.len() < len {
            return Ok(None);
        }

        let body: Vec<u8> = self.buf.drain(..len).collect();
        self.phase = Phase::Header;
        Ok(Some(DecodedFrame::Body(body)))
    }

    fn find_terminator(&mut self) -> Option<usize> {
        let start = self.scanned;
        let found = self.buf[start..]
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
            .map(|pos| start + pos);
        if found.is_none() {
            // Keep the last few bytes: the terminator may straddle the next chunk.
            self.scanned = self.buf.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        }
        found
    }
}

/// Case-insensitive `Content-Length` lookup over a header block.
fn parse_content_length(header: &str) -> Option<usize> {
    header.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Reads frames from an async reader through a [`FrameDecoder`].
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns `Err` on I/O failure, EOF mid-frame, or an oversized frame.
    pub async fn read_frame(&mut self) -> Result<Option<DecodedFrame>> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let n = self
                .reader
                .read(&mut chunk)
                .await
                .context("reading from server stdout")?;
            if n == 0 {
                if self.decoder.buffered() == 0 && self.decoder.phase == Phase::Header {
                    return Ok(None);
                }
                bail!("unexpected EOF mid-frame");
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

/// Writes framed messages to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode and write one message, flushing afterwards.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let frame = encode(message).context("encoding JSON-RPC frame")?;
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}
