//! Language-server client for TUIDE.
//!
//! One [`LspClient`] supervises one server process and speaks JSON-RPC 2.0
//! over its standard streams. Server traffic and failures are delivered as
//! [`LspEvent`]s on a channel supplied by the caller.

pub mod codec;
pub mod types;

mod client;
mod correlator;
mod diagnostics;
mod error;
mod process;
mod protocol;
mod reader;
mod router;
mod writer;

pub use client::LspClient;
pub use diagnostics::DiagnosticsStore;
pub use error::LspError;
pub use lsp_types::{Hover, ServerCapabilities};
pub use protocol::hover_text;
pub use types::{
    ClientConfig, Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, LspEvent, SessionState,
    Timeouts,
};
