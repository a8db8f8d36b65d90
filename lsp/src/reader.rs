//! Background tasks reading the server's output streams.
//!
//! [`StreamReader::run`] parses frames from stdout one at a time and
//! dispatches each before reading the next, so responses and notifications
//! are observed in wire order. [`run_stderr_drain`] forwards stderr lines
//! and never touches protocol state.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::codec::{DecodedFrame, FrameReader, Message, RequestId, decode};
use crate::correlator::Correlator;
use crate::router::NotificationRouter;
use crate::types::EventSink;
use crate::writer::Outbound;

/// Why the stream reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReaderExit {
    Cancelled,
    /// Clean end-of-stream at a frame boundary.
    Eof,
    /// I/O failure, EOF mid-frame, or an oversized frame.
    Failed(String),
}

pub(crate) struct StreamReader {
    pub correlator: Arc<Correlator>,
    pub router: NotificationRouter,
    pub outbound: Outbound,
    pub events: EventSink,
}

impl StreamReader {
    pub async fn run<R>(self, stdout: R, cancel: CancellationToken) -> ReaderExit
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = FrameReader::new(stdout);
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return ReaderExit::Cancelled,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(Some(DecodedFrame::Body(body))) => match decode(&body) {
                    Ok(message) => self.dispatch(message),
                    Err(e) => self.events.error(format!("received invalid message: {e}")),
                },
                Ok(Some(DecodedFrame::Malformed { header })) => {
                    tracing::warn!(
                        language = %self.events.language(),
                        "discarding header block without Content-Length: {header:?}"
                    );
                }
                Ok(None) => return ReaderExit::Eof,
                Err(e) => return ReaderExit::Failed(format!("{e:#}")),
            }
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Response {
                id: RequestId::Number(id),
                outcome,
            } => {
                let outcome = outcome.map_err(Into::into);
                if !self.correlator.resolve(id, outcome) {
                    tracing::trace!(
                        language = %self.events.language(),
                        id,
                        "dropping response with no pending request"
                    );
                }
            }
            Message::Response { id, .. } => {
                tracing::trace!(
                    language = %self.events.language(),
                    "dropping response for foreign id {id}"
                );
            }
            Message::Request { id, method, .. } => {
                let reply = self.router.reject_server_request(id, &method);
                if !self.outbound.send_detached(reply) {
                    tracing::debug!(
                        language = %self.events.language(),
                        "could not queue reply to {method}"
                    );
                }
            }
            Message::Notification { method, params } => self.router.route(&method, params),
        }
    }
}

/// Forward each stderr line until end-of-stream or cancellation.
pub(crate) async fn run_stderr_drain<R>(stderr: R, events: EventSink, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => events.stderr(line.trim_end().to_string()),
            Ok(None) => return,
            Err(e) => {
                events.error(format!("error reading server stderr: {e}"));
                return;
            }
        }
    }
}
