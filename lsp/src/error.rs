//! Error taxonomy surfaced by the client.
//!
//! Per-request failures (`Server`, `Timeout`) reach only the caller that
//! issued the request. Stream-level failures (`Disconnected`) tear down the
//! whole session.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The server process could not be created.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame or body that does not form a JSON-RPC message.
    #[error("malformed message: {0}")]
    Parse(String),

    /// A well-formed JSON-RPC error response.
    #[error("server error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("{method} timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },

    /// The write path failed or the output stream ended.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A request-family call was made before the handshake completed.
    #[error("session is not ready")]
    NotReady,

    #[error("cannot convert path to file URI: {}", .0.display())]
    InvalidPath(PathBuf),
}

impl LspError {
    /// Whether this failure means the transport can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}
