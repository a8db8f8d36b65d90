//! LSP method names, parameter builders and URI helpers.

use std::path::{Path, PathBuf};

use lsp_types::{Hover, HoverContents, MarkedString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::types::{Diagnostic, DiagnosticSeverity};

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";
pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CHANGE: &str = "textDocument/didChange";
pub(crate) const DID_SAVE: &str = "textDocument/didSave";
pub(crate) const DID_CLOSE: &str = "textDocument/didClose";
pub(crate) const HOVER: &str = "textDocument/hover";
pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

/// Symbol kinds 1 through 26, all of which we can display.
const SYMBOL_KINDS: std::ops::RangeInclusive<u32> = 1..=26;

/// `initialize` params declaring the client's capability set.
///
/// The server only offers behaviors covered here.
pub(crate) fn initialize_params(process_id: u32, root_uri: &str) -> Value {
    let symbol_kinds: Vec<u32> = SYMBOL_KINDS.collect();
    json!({
        "processId": process_id,
        "rootUri": root_uri,
        "clientInfo": {
            "name": "tuide",
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "willSave": true,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": {
                    "completionItem": { "snippetSupport": true }
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"]
                },
                "signatureHelp": {
                    "signatureInformation": {
                        "parameterInformation": { "labelOffsetSupport": true }
                    }
                },
                "definition": { "linkSupport": true },
                "references": {},
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                "publishDiagnostics": { "relatedInformation": false }
            },
            "workspace": {
                "didChangeConfiguration": { "dynamicRegistration": true },
                "symbol": { "symbolKind": { "valueSet": symbol_kinds } },
                "executeCommand": { "dynamicRegistration": true }
            }
        }
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Full-document sync: the whole text replaces the previous content.
pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn text_document_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn hover_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

/// Flatten hover contents to plain text, one block per paragraph.
#[must_use]
pub fn hover_text(hover: &Hover) -> String {
    fn marked(s: &MarkedString) -> &str {
        match s {
            MarkedString::String(text) => text,
            MarkedString::LanguageString(ls) => &ls.value,
        }
    }

    match &hover.contents {
        HoverContents::Scalar(s) => marked(s).to_string(),
        HoverContents::Array(items) => items
            .iter()
            .map(marked)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        HoverContents::Markup(markup) => markup.value.clone(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireDiagnostic {
    pub range: WireRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRange {
    pub start: WirePosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePosition {
    pub line: u32,
    pub character: u32,
}

impl WireDiagnostic {
    pub fn into_diagnostic(self) -> Diagnostic {
        Diagnostic {
            severity: self
                .severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            message: self.message,
            line: self.range.start.line,
            col: self.range.start.character,
            source: self.source.unwrap_or_else(|| String::from("unknown")),
        }
    }
}

/// Absolute `file://` URI for `path`, resolving relative paths against `root`.
pub(crate) fn path_to_file_uri(root: &Path, path: &Path) -> Option<url::Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    url::Url::from_file_path(normalize_path(&absolute)).ok()
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

/// Lexically resolve `.` and `..` components.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
