//! Notification router: forwards server-initiated messages.
//!
//! Notifications become [`LspEvent`]s in wire order. Requests sent *by*
//! the server (`workspace/configuration`, `client/registerCapability`, ...)
//! are outside the supported method set and are answered with a
//! `Method not found` error so the server does not block waiting.

use std::path::PathBuf;

use serde_json::Value;

use crate::codec::{Message, RequestId, ResponseError};
use crate::protocol::{self, PublishDiagnosticsParams};
use crate::types::EventSink;

pub(crate) struct NotificationRouter {
    events: EventSink,
    root: PathBuf,
}

impl NotificationRouter {
    pub fn new(events: EventSink, root: PathBuf) -> Self {
        Self {
            events,
            root: protocol::normalize_path(&root),
        }
    }

    pub fn route(&self, method: &str, params: Option<Value>) {
        if method == protocol::PUBLISH_DIAGNOSTICS
            && let Some(params) = &params
        {
            self.publish_diagnostics(params);
        }
        self.events.notification(method, params);
    }

    /// The reply for a server-to-client request.
    pub fn reject_server_request(&self, id: RequestId, method: &str) -> Message {
        tracing::debug!(
            language = %self.events.language(),
            "server sent request {method} (id {id}); replying method not found"
        );
        Message::Response {
            id,
            outcome: Err(ResponseError::method_not_found(method)),
        }
    }

    fn publish_diagnostics(&self, params: &Value) {
        let parsed = match serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(
                    language = %self.events.language(),
                    "failed to parse publishDiagnostics: {e}"
                );
                return;
            }
        };

        let Some(path) = protocol::file_uri_to_path(&parsed.uri) else {
            return;
        };
        if !protocol::normalize_path(&path).starts_with(&self.root) {
            tracing::warn!(
                language = %self.events.language(),
                "diagnostics for path outside project root: {}",
                path.display()
            );
            return;
        }

        let items = parsed
            .diagnostics
            .into_iter()
            .map(protocol::WireDiagnostic::into_diagnostic)
            .collect();
        self.events.diagnostics(path, items);
    }
}
