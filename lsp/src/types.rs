//! Public types consumed by the editor layer.
//!
//! The editor constructs a [`ClientConfig`], receives [`LspEvent`]s and
//! observes [`SessionState`]. Diagnostics from `publishDiagnostics` are
//! surfaced as [`Diagnostic`] values and aggregated into
//! [`DiagnosticsSnapshot`]s.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;

/// Launch and timing configuration for one language session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// LSP language identifier (e.g. "python").
    pub language_id: String,
    /// Server launch command; the first element is the executable.
    pub command: Vec<String>,
    /// Absolute project root. Used as the server's working directory and `rootUri`.
    pub root: PathBuf,
    pub timeouts: Timeouts,
}

impl ClientConfig {
    pub fn new(language_id: impl Into<String>, command: Vec<String>, root: &Path) -> Self {
        Self {
            language_id: language_id.into(),
            command,
            root: std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf()),
            timeouts: Timeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Bounds for every wait the client performs, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub request_ms: u64,
    pub initialize_ms: u64,
    pub shutdown_request_ms: u64,
    /// Wait for a natural exit after `exit`.
    pub exit_wait_ms: u64,
    /// Wait after SIGTERM before escalating to kill.
    pub terminate_wait_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_ms: 5_000,
            initialize_ms: 10_000,
            shutdown_request_ms: 2_000,
            exit_wait_ms: 1_000,
            terminate_wait_ms: 1_000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    #[must_use]
    pub fn shutdown_request(&self) -> Duration {
        Duration::from_millis(self.shutdown_request_ms)
    }

    #[must_use]
    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }

    #[must_use]
    pub fn terminate_wait(&self) -> Duration {
        Duration::from_millis(self.terminate_wait_ms)
    }
}

/// Lifecycle of one session.
///
/// `Idle → Starting → AwaitingInitialize → Ready → ShuttingDown → Stopped`.
/// `Failed` is entered when spawning, the handshake, or the transport
/// fails; a later `start()` begins a fresh run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    AwaitingInitialize,
    Ready,
    ShuttingDown,
    Stopped,
    Failed(String),
}

impl SessionState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::AwaitingInitialize => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
            Self::Failed(_) => "failed",
        }
    }
}

/// An event emitted by a session.
#[derive(Debug, Clone)]
pub enum LspEvent {
    /// A server notification, in wire order.
    Notification {
        language: String,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Diagnostics published for a file inside the project root.
    Diagnostics {
        language: String,
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
    /// One line of the server's stderr.
    Stderr { language: String, line: String },
    /// Human-readable failure text.
    Error { language: String, message: String },
    StateChanged {
        language: String,
        state: SessionState,
    },
}

/// Non-blocking event sender tagged with the session's language.
///
/// A dropped receiver is not an error: events are then discarded.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    language: String,
    tx: mpsc::UnboundedSender<LspEvent>,
}

impl EventSink {
    pub fn new(language: &str, tx: mpsc::UnboundedSender<LspEvent>) -> Self {
        Self {
            language: language.to_string(),
            tx,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn notification(&self, method: &str, params: Option<serde_json::Value>) {
        let _ = self.tx.send(LspEvent::Notification {
            language: self.language.clone(),
            method: method.to_string(),
            params,
        });
    }

    pub fn diagnostics(&self, path: PathBuf, items: Vec<Diagnostic>) {
        let _ = self.tx.send(LspEvent::Diagnostics {
            language: self.language.clone(),
            path,
            items,
        });
    }

    pub fn stderr(&self, line: String) {
        tracing::debug!(language = %self.language, "server stderr: {line}");
        let _ = self.tx.send(LspEvent::Stderr {
            language: self.language.clone(),
            line,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(language = %self.language, "{message}");
        let _ = self.tx.send(LspEvent::Error {
            language: self.language.clone(),
            message,
        });
    }

    pub fn state(&self, state: SessionState) {
        let _ = self.tx.send(LspEvent::StateChanged {
            language: self.language.clone(),
            state,
        });
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity; `None` outside 1..=4.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic from a language server. Line and column are 0-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub line: u32,
    pub col: u32,
    pub source: String,
}

impl Diagnostic {
    /// Format as `path:line:col: severity: [source] message`, 1-indexed.
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Immutable view of accumulated diagnostics, error-bearing files first.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity.is_error())
            .count()
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_lsp() {
        assert_eq!(DiagnosticSeverity::from_lsp(1), Some(DiagnosticSeverity::Error));
        assert_eq!(DiagnosticSeverity::from_lsp(4), Some(DiagnosticSeverity::Hint));
        assert_eq!(DiagnosticSeverity::from_lsp(0), None);
        assert_eq!(DiagnosticSeverity::from_lsp(9), None);
    }

    #[test]
    fn test_display_with_path_is_one_indexed() {
        let diag = Diagnostic {
            severity: DiagnosticSeverity::Error,
            message: "undefined name 'x'".to_string(),
            line: 3,
            col: 0,
            source: "pyflakes".to_string(),
        };
        assert_eq!(
            diag.display_with_path(Path::new("a.py")),
            "a.py:4:1: error: [pyflakes] undefined name 'x'"
        );
    }

    #[test]
    fn test_timeouts_partial_deserialize_keeps_defaults() {
        let timeouts: Timeouts = serde_json::from_value(serde_json::json!({
            "request_ms": 250
        }))
        .unwrap();
        assert_eq!(timeouts.request(), Duration::from_millis(250));
        assert_eq!(timeouts.initialize(), Duration::from_secs(10));
        assert_eq!(timeouts.terminate_wait(), Duration::from_secs(1));
    }

    #[test]
    fn test_client_config_root_is_absolute() {
        let config = ClientConfig::new("python", vec!["pylsp".into()], Path::new("proj"));
        assert!(config.root.is_absolute());
        assert!(config.root.ends_with("proj"));
    }

    #[test]
    fn test_event_sink_tolerates_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new("python", tx);
        sink.error("server went away");
        sink.state(SessionState::Stopped);
    }

    #[test]
    fn test_event_sink_tags_language() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("python", tx);
        sink.stderr("starting pylsp".to_string());
        match rx.try_recv().unwrap() {
            LspEvent::Stderr { language, line } => {
                assert_eq!(language, "python");
                assert_eq!(line, "starting pylsp");
            }
            other => panic!("expected Stderr, got {other:?}"),
        }
    }
}
