//! Single-writer task owning the server's stdin.
//!
//! Every outgoing frame goes through one queue, so concurrent requests
//! never interleave bytes on the wire.

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameWriter, Message};
use crate::error::LspError;

const WRITER_CHANNEL_CAPACITY: usize = 64;

pub(crate) enum WriterCommand {
    Send {
        message: Message,
        /// Completion signal; `None` for fire-and-forget frames.
        done: Option<oneshot::Sender<Result<(), String>>>,
    },
    Shutdown,
}

/// Cloneable handle to the writer queue of one server run.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<WriterCommand>,
    generation: u64,
}

impl Outbound {
    /// The server run this writer belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a message and wait until it has been flushed.
    pub async fn send(&self, message: Message) -> Result<(), LspError> {
        let (done, written) = oneshot::channel();
        self.tx
            .send(WriterCommand::Send {
                message,
                done: Some(done),
            })
            .await
            .map_err(|_| LspError::Disconnected("writer closed".to_string()))?;

        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LspError::Disconnected(e)),
            Err(_) => Err(LspError::Disconnected("writer closed".to_string())),
        }
    }

    /// Queue a message without waiting. Returns `false` if the queue is
    /// closed or full.
    pub fn send_detached(&self, message: Message) -> bool {
        self.tx
            .try_send(WriterCommand::Send {
                message,
                done: None,
            })
            .is_ok()
    }

    /// Ask the writer to stop after draining what is already queued.
    pub async fn close(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown).await;
    }
}

pub(crate) fn spawn_writer<W>(
    stdin: W,
    language: String,
    generation: u64,
) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(stdin);
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCommand::Send { message, done } => {
                    let result = writer.write_message(&message).await;
                    let failed = result.is_err();
                    if let Err(e) = &result {
                        tracing::warn!(language = %language, "LSP write error: {e:#}");
                    }
                    if let Some(done) = done {
                        let _ = done.send(result.map_err(|e| format!("{e:#}")));
                    }
                    if failed {
                        break;
                    }
                }
                WriterCommand::Shutdown => break,
            }
        }
        tracing::trace!(language = %language, "LSP writer stopped");
    });
    (Outbound { tx, generation }, handle)
}
