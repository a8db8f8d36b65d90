//! `LspClient` facade: one language, one server process.
//!
//! The client composes the process supervisor, the single-writer queue, the
//! stream reader and the correlator, and owns the initialization handshake.
//! Document-sync and query calls made outside `Ready` are silent no-ops;
//! every failure reaches the collaborator as an [`LspEvent::Error`].
//!
//! Lifecycle operations (`start`, `shutdown`, transport-loss teardown) are
//! serialized by one async lock. A stale teardown spawned for an earlier run
//! checks the run's generation and never touches a restarted server.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lsp_types::{Hover, ServerCapabilities};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::Message;
use crate::correlator::Correlator;
use crate::error::LspError;
use crate::process::{ServerPipes, ServerProcess};
use crate::protocol;
use crate::reader::{ReaderExit, StreamReader, run_stderr_drain};
use crate::router::NotificationRouter;
use crate::types::{ClientConfig, EventSink, LspEvent, SessionState};
use crate::writer::{Outbound, spawn_writer};

type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Byte streams of one server run, with the process when there is one.
struct Transport {
    process: Option<ServerProcess>,
    stdin: BoxedWrite,
    stdout: BoxedRead,
    stderr: BoxedRead,
}

impl Transport {
    fn spawned(process: ServerProcess, pipes: ServerPipes) -> Self {
        Self {
            process: Some(process),
            stdin: Box::new(pipes.stdin),
            stdout: Box::new(pipes.stdout),
            stderr: Box::new(pipes.stderr),
        }
    }
}

/// Tasks and process of the current run.
struct RunningServer {
    generation: u64,
    process: Option<ServerProcess>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    config: ClientConfig,
    events: EventSink,
    state: watch::Sender<SessionState>,
    correlator: Arc<Correlator>,
    /// Present only while the writer accepts frames.
    outbound: Mutex<Option<Outbound>>,
    lifecycle: Mutex<Option<RunningServer>>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    generation: AtomicU64,
}

/// Client for one language server.
///
/// Cloning is cheap; clones share the session.
#[derive(Clone)]
pub struct LspClient {
    session: Arc<Session>,
}

impl LspClient {
    /// Create a client in the `Idle` state. Nothing is spawned until
    /// [`start`](Self::start).
    pub fn new(config: ClientConfig, events: mpsc::UnboundedSender<LspEvent>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let events = EventSink::new(&config.language_id, events);
        Self {
            session: Arc::new(Session {
                config,
                events,
                state,
                correlator: Arc::new(Correlator::new()),
                outbound: Mutex::new(None),
                lifecycle: Mutex::new(None),
                capabilities: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.session.config.language_id
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.session.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state.borrow().clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    /// Watch state transitions without consuming the event channel.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.state.subscribe()
    }

    /// Spawn the server and run the `initialize` handshake.
    ///
    /// Returns `true` once the session is `Ready` (immediately if it already
    /// is). Spawn and handshake failures are reported as events and leave
    /// the session `Failed`.
    pub async fn start(&self) -> bool {
        let config = &self.session.config;
        self.session
            .start_with(|| {
                let (process, pipes) = ServerProcess::spawn(&config.command, &config.root)?;
                Ok(Transport::spawned(process, pipes))
            })
            .await
    }

    pub async fn notify_did_open(&self, path: &Path, text: &str) {
        let Some((outbound, uri)) = self.session.document(path).await else {
            return;
        };
        let params = protocol::did_open_params(uri.as_str(), self.language_id(), 1, text);
        self.session
            .notify_on(&outbound, protocol::DID_OPEN, Some(params))
            .await;
    }

    pub async fn notify_did_change(&self, path: &Path, text: &str, version: i32) {
        let Some((outbound, uri)) = self.session.document(path).await else {
            return;
        };
        let params = protocol::did_change_params(uri.as_str(), version, text);
        self.session
            .notify_on(&outbound, protocol::DID_CHANGE, Some(params))
            .await;
    }

    pub async fn notify_did_save(&self, path: &Path) {
        let Some((outbound, uri)) = self.session.document(path).await else {
            return;
        };
        let params = protocol::text_document_params(uri.as_str());
        self.session
            .notify_on(&outbound, protocol::DID_SAVE, Some(params))
            .await;
    }

    pub async fn notify_did_close(&self, path: &Path) {
        let Some((outbound, uri)) = self.session.document(path).await else {
            return;
        };
        let params = protocol::text_document_params(uri.as_str());
        self.session
            .notify_on(&outbound, protocol::DID_CLOSE, Some(params))
            .await;
    }

    /// Hover at a zero-based position. `None` covers "not ready", "no
    /// hover" and failures; failures are also reported as events.
    pub async fn request_hover(&self, path: &Path, line: u32, character: u32) -> Option<Hover> {
        let (outbound, uri) = self.session.document(path).await?;
        let params = protocol::hover_params(uri.as_str(), line, character);

        let result = match self
            .session
            .request_on(&outbound, protocol::HOVER, Some(params))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.session.events.error(format!("hover failed: {e}"));
                return None;
            }
        };
        if result.is_null() {
            return None;
        }
        match serde_json::from_value::<Hover>(result) {
            Ok(hover) => Some(hover),
            Err(e) => {
                self.session
                    .events
                    .error(format!("unparsable hover result: {e}"));
                None
            }
        }
    }

    /// Send an arbitrary request. Fails with [`LspError::NotReady`] outside
    /// `Ready`.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, LspError> {
        let outbound = self.session.ready_outbound().await.ok_or(LspError::NotReady)?;
        self.session.request_on(&outbound, method, params).await
    }

    /// Send an arbitrary notification. Fails with [`LspError::NotReady`]
    /// outside `Ready`, and with [`LspError::Timeout`] when the frame cannot
    /// be written within the request timeout.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let outbound = self.session.ready_outbound().await.ok_or(LspError::NotReady)?;
        let bound = self.session.config.timeouts.request();
        let result = send_within(&outbound, Message::notification(method, params), bound).await;
        if let Err(e) = &result {
            self.session.on_send_error(&outbound, e).await;
        }
        result
    }

    /// Capabilities from the last successful `initialize` response.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.session.capabilities.read().await.clone()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.session.correlator.pending_count()
    }

    /// Stop the server. Idempotent and safe in any state.
    ///
    /// A non-forced shutdown from `Ready` sends `shutdown` and `exit` and
    /// waits for a natural exit before escalating to terminate and kill.
    /// The session always ends `Stopped` with no pending requests.
    pub async fn shutdown(&self, force: bool) {
        self.session.shutdown(force).await;
    }

    #[cfg(test)]
    async fn start_with_io(&self, io: tests::ServerIo) -> bool {
        self.session
            .start_with(|| {
                Ok(Transport {
                    process: None,
                    stdin: Box::new(io.stdin),
                    stdout: Box::new(io.stdout),
                    stderr: Box::new(io.stderr),
                })
            })
            .await
    }
}

impl Session {
    fn is_ready(&self) -> bool {
        *self.state.borrow() == SessionState::Ready
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            tracing::debug!(language = %self.events.language(), state = next.label(), "session state changed");
            self.events.state(next);
        }
    }

    /// Enter `Failed` unless a failure was already recorded for this run.
    fn fail(&self, reason: &str) {
        let already_failed = matches!(*self.state.borrow(), SessionState::Failed(_));
        if !already_failed {
            self.set_state(SessionState::Failed(reason.to_string()));
        }
    }

    async fn start_with<F>(self: &Arc<Self>, make_transport: F) -> bool
    where
        F: FnOnce() -> Result<Transport, LspError>,
    {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_ready() {
            return true;
        }
        if let Some(stale) = lifecycle.take() {
            self.teardown(stale, false, None).await;
        }

        tracing::info!(
            language = %self.events.language(),
            command = ?self.config.command,
            "starting language server"
        );
        self.set_state(SessionState::Starting);

        let transport = match make_transport() {
            Ok(transport) => transport,
            Err(e) => {
                self.events.error(e.to_string());
                self.fail(&e.to_string());
                return false;
            }
        };

        if let Some(pid) = transport.process.as_ref().and_then(ServerProcess::id) {
            tracing::debug!(language = %self.events.language(), pid, "language server spawned");
        }
        let outbound = self.launch(&mut lifecycle, transport).await;
        self.set_state(SessionState::AwaitingInitialize);

        match self.initialize(&outbound).await {
            Ok(()) => {
                tracing::info!(language = %self.events.language(), "language server ready");
                self.set_state(SessionState::Ready);
                true
            }
            Err(e) => {
                let reason = format!("initialize failed: {e}");
                self.events.error(reason.clone());
                self.fail(&reason);
                if let Some(server) = lifecycle.take() {
                    self.teardown(server, false, None).await;
                }
                false
            }
        }
    }

    /// Start the writer, reader and stderr tasks for a new run.
    async fn launch(
        self: &Arc<Self>,
        slot: &mut Option<RunningServer>,
        transport: Transport,
    ) -> Outbound {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let language = self.events.language().to_string();

        let (outbound, writer) = spawn_writer(transport.stdin, language, generation);
        *self.outbound.lock().await = Some(outbound.clone());

        let stream_reader = StreamReader {
            correlator: Arc::clone(&self.correlator),
            router: NotificationRouter::new(self.events.clone(), self.config.root.clone()),
            outbound: outbound.clone(),
            events: self.events.clone(),
        };
        let session: Weak<Self> = Arc::downgrade(self);
        let reader_cancel = cancel.clone();
        let stdout = transport.stdout;
        let reader = tokio::spawn(async move {
            let reason = match stream_reader.run(stdout, reader_cancel).await {
                ReaderExit::Cancelled => return,
                ReaderExit::Eof => "server closed its output stream".to_string(),
                ReaderExit::Failed(e) => format!("server output stream failed: {e}"),
            };
            if let Some(session) = session.upgrade() {
                session.on_transport_lost(generation, reason).await;
            }
        });

        let stderr = tokio::spawn(run_stderr_drain(
            transport.stderr,
            self.events.clone(),
            cancel.clone(),
        ));

        *slot = Some(RunningServer {
            generation,
            process: transport.process,
            cancel,
            reader,
            stderr,
            writer,
        });
        outbound
    }

    async fn initialize(&self, outbound: &Outbound) -> Result<(), LspError> {
        let root_uri = Url::from_file_path(&self.config.root)
            .map_err(|()| LspError::InvalidPath(self.config.root.clone()))?;
        let params = protocol::initialize_params(std::process::id(), root_uri.as_str());

        let result = self
            .correlator
            .issue(
                outbound,
                protocol::INITIALIZE,
                Some(params),
                self.config.timeouts.initialize(),
            )
            .await?;

        let capabilities = match result.get("capabilities") {
            Some(raw) => serde_json::from_value::<ServerCapabilities>(raw.clone())
                .inspect_err(|e| {
                    tracing::warn!(
                        language = %self.events.language(),
                        "ignoring unparsable server capabilities: {e}"
                    );
                })
                .ok(),
            None => Some(ServerCapabilities::default()),
        };
        *self.capabilities.write().await = capabilities;

        send_within(
            outbound,
            Message::notification(protocol::INITIALIZED, Some(json!({}))),
            self.config.timeouts.initialize(),
        )
        .await
    }

    /// Writer handle and URI for a document call, or `None` when the call
    /// should be skipped.
    async fn document(&self, path: &Path) -> Option<(Outbound, Url)> {
        let outbound = self.ready_outbound().await?;
        let Some(uri) = protocol::path_to_file_uri(&self.config.root, path) else {
            self.events
                .error(LspError::InvalidPath(path.to_path_buf()).to_string());
            return None;
        };
        Some((outbound, uri))
    }

    async fn ready_outbound(&self) -> Option<Outbound> {
        if !self.is_ready() {
            return None;
        }
        self.outbound.lock().await.clone()
    }

    async fn request_on(
        self: &Arc<Self>,
        outbound: &Outbound,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, LspError> {
        let result = self
            .correlator
            .issue(outbound, method, params, self.config.timeouts.request())
            .await;
        if let Err(e) = &result {
            self.on_send_error(outbound, e).await;
        }
        result
    }

    async fn notify_on(self: &Arc<Self>, outbound: &Outbound, method: &str, params: Option<Value>) {
        let message = Message::notification(method, params);
        match send_within(outbound, message, self.config.timeouts.request()).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.on_send_error(outbound, &e).await,
            Err(e) => self.events.error(format!("{method} not delivered: {e}")),
        }
    }

    /// A fatal error on the write path tears down the run that `outbound`
    /// belongs to, and only that run.
    async fn on_send_error(self: &Arc<Self>, outbound: &Outbound, error: &LspError) {
        if !error.is_fatal() {
            return;
        }
        Arc::clone(self)
            .on_transport_lost(outbound.generation(), error.to_string())
            .await;
    }

    /// The server's output stream ended or a write failed.
    async fn on_transport_lost(self: Arc<Self>, generation: u64, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let live = matches!(
            *self.state.borrow(),
            SessionState::Starting | SessionState::AwaitingInitialize | SessionState::Ready
        );
        if !live {
            return;
        }

        self.outbound.lock().await.take();
        self.fail(&reason);
        let failed = self.correlator.fail_all(&reason);
        self.events.error(format!("language server stopped: {reason}"));
        tracing::debug!(language = %self.events.language(), failed, "failed pending requests");

        tokio::spawn(async move {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle
                .as_ref()
                .is_some_and(|server| server.generation == generation)
                && let Some(server) = lifecycle.take()
            {
                self.teardown(server, false, None).await;
            }
        });
    }

    async fn shutdown(&self, force: bool) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(server) = lifecycle.take() else {
            self.correlator.fail_all("session stopped");
            self.set_state(SessionState::Stopped);
            return;
        };

        let handshake = !force && self.is_ready();
        tracing::info!(language = %self.events.language(), force, "shutting down language server");
        self.set_state(SessionState::ShuttingDown);

        let exit_wait = (!force).then(|| self.config.timeouts.exit_wait());
        self.teardown(server, handshake, exit_wait).await;
        self.set_state(SessionState::Stopped);
    }

    /// Bring one run down completely. The caller holds the lifecycle lock.
    async fn teardown(
        &self,
        mut server: RunningServer,
        handshake: bool,
        exit_wait: Option<Duration>,
    ) {
        let timeouts = self.config.timeouts;
        let outbound = self.outbound.lock().await.take();

        if handshake && let Some(outbound) = &outbound {
            if let Err(e) = self
                .correlator
                .issue(outbound, protocol::SHUTDOWN, None, timeouts.shutdown_request())
                .await
            {
                tracing::debug!(language = %self.events.language(), "shutdown request failed: {e}");
            }
            let exit = Message::notification(protocol::EXIT, None);
            if let Err(e) = send_within(outbound, exit, timeouts.shutdown_request()).await {
                tracing::debug!(language = %self.events.language(), "exit notification failed: {e}");
            }
        }

        server.cancel.cancel();
        join_task(&mut server.reader, "reader", timeouts.terminate_wait()).await;
        join_task(&mut server.stderr, "stderr drain", timeouts.terminate_wait()).await;

        if let Some(process) = server.process.as_mut() {
            process.stop(exit_wait, timeouts.terminate_wait()).await;
        }

        if let Some(outbound) = outbound {
            let _ = tokio::time::timeout(timeouts.terminate_wait(), outbound.close()).await;
        }
        join_task(&mut server.writer, "writer", timeouts.terminate_wait()).await;

        let failed = self.correlator.fail_all("session shut down");
        if failed > 0 {
            tracing::debug!(language = %self.events.language(), failed, "failed pending requests on shutdown");
        }
        *self.capabilities.write().await = None;
    }
}

/// Queue `message` and wait for it to be written, for at most `bound`.
async fn send_within(outbound: &Outbound, message: Message, bound: Duration) -> Result<(), LspError> {
    let method = message.method().unwrap_or_default().to_string();
    tokio::time::timeout(bound, outbound.send(message))
        .await
        .unwrap_or_else(|_| Err(LspError::Timeout { method, after: bound }))
}

/// Await a background task, aborting it if it does not finish in time.
async fn join_task(handle: &mut JoinHandle<()>, name: &str, bound: Duration) {
    match tokio::time::timeout(bound, &mut *handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => tracing::warn!("{name} task panicked: {e}"),
        Err(_) => {
            tracing::debug!("{name} task did not stop in time; aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::codec::{DecodedFrame, FrameReader, FrameWriter, RequestId, ResponseError, decode};
    use crate::protocol::hover_text;
    use crate::types::Timeouts;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    #[cfg(windows)]
    const ROOT: &str = r"C:\proj";
    #[cfg(not(windows))]
    const ROOT: &str = "/proj";

    #[cfg(windows)]
    const ROOT_URI: &str = "file:///C:/proj";
    #[cfg(not(windows))]
    const ROOT_URI: &str = "file:///proj";

    #[cfg(not(windows))]
    const A_PY_URI: &str = "file:///proj/a.py";

    /// Client ends of an in-memory server.
    pub(super) struct ServerIo {
        pub stdin: DuplexStream,
        pub stdout: DuplexStream,
        pub stderr: DuplexStream,
    }

    /// The server ends, driven by each test.
    struct FakeServer {
        incoming: FrameReader<DuplexStream>,
        outgoing: FrameWriter<DuplexStream>,
        stderr: DuplexStream,
    }

    fn fake_pair() -> (ServerIo, FakeServer) {
        fake_pair_with(64 * 1024)
    }

    /// `stdin_capacity` bounds how much the client can write before the
    /// server reads.
    fn fake_pair_with(stdin_capacity: usize) -> (ServerIo, FakeServer) {
        let (client_stdin, server_stdin) = duplex(stdin_capacity);
        let (server_stdout, client_stdout) = duplex(64 * 1024);
        let (server_stderr, client_stderr) = duplex(1024);
        (
            ServerIo {
                stdin: client_stdin,
                stdout: client_stdout,
                stderr: client_stderr,
            },
            FakeServer {
                incoming: FrameReader::new(server_stdin),
                outgoing: FrameWriter::new(server_stdout),
                stderr: server_stderr,
            },
        )
    }

    impl FakeServer {
        async fn recv(&mut self) -> Message {
            match self.incoming.read_frame().await.unwrap() {
                Some(DecodedFrame::Body(body)) => decode(&body).unwrap(),
                other => panic!("expected a frame, got {other:?}"),
            }
        }

        async fn expect_request(&mut self, expected: &str) -> (RequestId, Option<Value>) {
            match self.recv().await {
                Message::Request { id, method, params } if method == expected => (id, params),
                other => panic!("expected {expected} request, got {other:?}"),
            }
        }

        async fn expect_notification(&mut self, expected: &str) -> Option<Value> {
            match self.recv().await {
                Message::Notification { method, params } if method == expected => params,
                other => panic!("expected {expected} notification, got {other:?}"),
            }
        }

        async fn send(&mut self, message: Message) {
            self.outgoing.write_message(&message).await.unwrap();
        }

        async fn respond(&mut self, id: RequestId, result: Value) {
            self.send(Message::Response {
                id,
                outcome: Ok(result),
            })
            .await;
        }

        /// Answer `initialize` and consume `initialized`.
        async fn accept_initialize(&mut self) -> (RequestId, Value) {
            let (id, params) = self.expect_request("initialize").await;
            self.respond(id.clone(), json!({ "capabilities": { "hoverProvider": true } }))
                .await;
            assert_eq!(self.expect_notification("initialized").await, Some(json!({})));
            (id, params.unwrap())
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            request_ms: 2_000,
            initialize_ms: 2_000,
            shutdown_request_ms: 500,
            exit_wait_ms: 200,
            terminate_wait_ms: 500,
        }
    }

    fn client_with(
        command: &str,
        timeouts: Timeouts,
    ) -> (LspClient, mpsc::UnboundedReceiver<LspEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ClientConfig::new("python", vec![command.to_string()], Path::new(ROOT))
            .with_timeouts(timeouts);
        (LspClient::new(config, tx), rx)
    }

    fn client() -> (LspClient, mpsc::UnboundedReceiver<LspEvent>) {
        client_with("pylsp", timeouts())
    }

    fn spawn_start(client: &LspClient, io: ServerIo) -> JoinHandle<bool> {
        let client = client.clone();
        tokio::spawn(async move { client.start_with_io(io).await })
    }

    async fn ready_client() -> (LspClient, FakeServer, mpsc::UnboundedReceiver<LspEvent>) {
        let (client, events) = client();
        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);
        server.accept_initialize().await;
        assert!(starting.await.unwrap());
        (client, server, events)
    }

    fn a_py() -> PathBuf {
        Path::new(ROOT).join("a.py")
    }

    fn states(events: &mut mpsc::UnboundedReceiver<LspEvent>) -> Vec<SessionState> {
        std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                LspEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    async fn next_error(events: &mut mpsc::UnboundedReceiver<LspEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(LspEvent::Error { message, .. }) = events.recv().await {
                    return message;
                }
            }
        })
        .await
        .expect("no error event")
    }

    #[tokio::test]
    async fn test_start_runs_initialize_handshake() {
        let (client, mut events) = client();
        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);

        let (id, params) = server.accept_initialize().await;
        assert_eq!(id, RequestId::Number(1));
        assert_eq!(params["rootUri"], ROOT_URI);
        assert_eq!(params["processId"], std::process::id());
        assert!(params["capabilities"]["textDocument"]["hover"].is_object());

        assert!(starting.await.unwrap());
        assert!(client.is_ready());
        let capabilities = client.server_capabilities().await.unwrap();
        assert!(capabilities.hover_provider.is_some());
        assert_eq!(
            states(&mut events),
            vec![
                SessionState::Starting,
                SessionState::AwaitingInitialize,
                SessionState::Ready
            ]
        );

        // Already ready: no second spawn.
        assert!(client.start().await);
    }

    #[tokio::test]
    async fn test_calls_before_ready_are_noops() {
        let (client, mut events) = client();

        client.notify_did_open(&a_py(), "x = 1").await;
        client.notify_did_save(&a_py()).await;
        assert!(client.request_hover(&a_py(), 0, 0).await.is_none());
        assert!(matches!(
            client.request("custom/anything", None).await,
            Err(LspError::NotReady)
        ));
        assert!(matches!(
            client.notify("custom/anything", None).await,
            Err(LspError::NotReady)
        ));
        assert_eq!(client.pending_requests(), 0);
        assert!(events.try_recv().is_err());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_hover_forwards_position_and_null_means_no_hover() {
        let (client, mut server, _events) = ready_client().await;

        let hovering = {
            let client = client.clone();
            tokio::spawn(async move { client.request_hover(&a_py(), 0, 2).await })
        };
        let (id, params) = server.expect_request("textDocument/hover").await;
        let params = params.unwrap();
        assert_eq!(params["textDocument"]["uri"], A_PY_URI);
        assert_eq!(params["position"], json!({ "line": 0, "character": 2 }));

        server.respond(id, Value::Null).await;
        assert!(hovering.await.unwrap().is_none());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_hover_relative_path_and_markup_result() {
        let (client, mut server, _events) = ready_client().await;

        let hovering = {
            let client = client.clone();
            tokio::spawn(async move { client.request_hover(Path::new("a.py"), 3, 4).await })
        };
        let (id, params) = server.expect_request("textDocument/hover").await;
        assert_eq!(params.unwrap()["textDocument"]["uri"], A_PY_URI);

        server
            .respond(
                id,
                json!({ "contents": { "kind": "markdown", "value": "def f() -> int" } }),
            )
            .await;
        let hover = hovering.await.unwrap().unwrap();
        assert_eq!(hover_text(&hover), "def f() -> int");
    }

    #[tokio::test]
    async fn test_unparsable_hover_reported_as_error() {
        let (client, mut server, mut events) = ready_client().await;

        let hovering = {
            let client = client.clone();
            tokio::spawn(async move { client.request_hover(&a_py(), 0, 0).await })
        };
        let (id, _) = server.expect_request("textDocument/hover").await;
        server.respond(id, json!(42)).await;

        assert!(hovering.await.unwrap().is_none());
        assert!(next_error(&mut events).await.contains("unparsable hover"));
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_document_notifications() {
        let (client, mut server, _events) = ready_client().await;
        let path = a_py();

        client.notify_did_open(&path, "x = 1\n").await;
        let params = server.expect_notification("textDocument/didOpen").await.unwrap();
        assert_eq!(params["textDocument"]["languageId"], "python");
        assert_eq!(params["textDocument"]["version"], 1);
        assert_eq!(params["textDocument"]["text"], "x = 1\n");

        client.notify_did_change(&path, "x = 2\n", 2).await;
        let params = server.expect_notification("textDocument/didChange").await.unwrap();
        assert_eq!(params["textDocument"]["version"], 2);
        assert_eq!(params["contentChanges"][0]["text"], "x = 2\n");

        client.notify_did_save(&path).await;
        server.expect_notification("textDocument/didSave").await;
        client.notify_did_close(&path).await;
        server.expect_notification("textDocument/didClose").await;
    }

    #[tokio::test]
    async fn test_server_error_reaches_only_the_caller() {
        let (client, mut server, _events) = ready_client().await;

        let calling = {
            let client = client.clone();
            tokio::spawn(async move { client.request("custom/fails", None).await })
        };
        let (id, _) = server.expect_request("custom/fails").await;
        server
            .send(Message::Response {
                id,
                outcome: Err(ResponseError {
                    code: -32603,
                    message: "internal".to_string(),
                    data: None,
                }),
            })
            .await;

        assert!(matches!(
            calling.await.unwrap(),
            Err(LspError::Server { code: -32603, .. })
        ));
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_session_ready() {
        let (client, events) = client_with(
            "pylsp",
            Timeouts {
                request_ms: 100,
                ..timeouts()
            },
        );
        drop(events);
        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);
        server.accept_initialize().await;
        assert!(starting.await.unwrap());

        let result = client.request("custom/slow", None).await;
        assert!(matches!(result, Err(LspError::Timeout { .. })));
        let (id, _) = server.expect_request("custom/slow").await;
        server.respond(id, json!("late")).await;

        assert!(client.is_ready());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_output_stream_eof_fails_pending_and_disables_calls() {
        let (client, mut server, mut events) = ready_client().await;
        let mut state = client.subscribe_state();

        let calling = {
            let client = client.clone();
            tokio::spawn(async move { client.request("custom/slow", None).await })
        };
        server.expect_request("custom/slow").await;
        drop(server);

        assert!(matches!(
            calling.await.unwrap(),
            Err(LspError::Disconnected(_))
        ));
        state
            .wait_for(|s| matches!(s, SessionState::Failed(_)))
            .await
            .unwrap();
        assert!(next_error(&mut events).await.contains("stopped"));

        assert!(client.request_hover(&a_py(), 0, 0).await.is_none());
        assert!(matches!(
            client.notify("custom/anything", None).await,
            Err(LspError::NotReady)
        ));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_failure_keeps_ids_increasing() {
        let (client, mut server, _events) = ready_client().await;
        let mut state = client.subscribe_state();

        let calling = {
            let client = client.clone();
            tokio::spawn(async move { client.request("custom/slow", None).await })
        };
        let (slow_id, _) = server.expect_request("custom/slow").await;
        assert_eq!(slow_id, RequestId::Number(2));
        drop(server);
        let _ = calling.await.unwrap();
        state
            .wait_for(|s| matches!(s, SessionState::Failed(_)))
            .await
            .unwrap();

        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);
        let (id, _) = server.accept_initialize().await;
        assert_eq!(id, RequestId::Number(3));
        assert!(starting.await.unwrap());
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_initialize_timeout_fails_start() {
        let (client, mut events) = client_with(
            "pylsp",
            Timeouts {
                initialize_ms: 100,
                ..timeouts()
            },
        );
        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);
        server.expect_request("initialize").await;

        assert!(!starting.await.unwrap());
        assert!(matches!(client.state(), SessionState::Failed(_)));
        assert!(next_error(&mut events).await.contains("initialize failed"));
        assert_eq!(client.pending_requests(), 0);
        assert!(client.server_capabilities().await.is_none());
    }

    #[tokio::test]
    async fn test_start_gives_up_when_server_never_reads() {
        let (client, _events) = client_with(
            "pylsp",
            Timeouts {
                initialize_ms: 100,
                terminate_wait_ms: 100,
                ..timeouts()
            },
        );
        let (io, _server) = fake_pair_with(64);

        let started = tokio::time::timeout(Duration::from_secs(5), client.start_with_io(io))
            .await
            .expect("start must give up within its bounds");
        assert!(!started);
        assert!(matches!(client.state(), SessionState::Failed(_)));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_initialize_error_response_fails_start() {
        let (client, _events) = client();
        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);
        let (id, _) = server.expect_request("initialize").await;
        server
            .send(Message::Response {
                id,
                outcome: Err(ResponseError {
                    code: -32002,
                    message: "not initialized".to_string(),
                    data: None,
                }),
            })
            .await;

        assert!(!starting.await.unwrap());
        assert!(matches!(client.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_false() {
        let (client, mut events) =
            client_with("definitely-not-a-language-server-xyz", timeouts());

        assert!(!client.start().await);
        assert!(matches!(client.state(), SessionState::Failed(_)));
        assert!(next_error(&mut events).await.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_and_twice() {
        let (client, _events) = client();
        client.shutdown(false).await;
        assert_eq!(client.state(), SessionState::Stopped);
        client.shutdown(true).await;
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_forced_shutdown_fails_pending_requests() {
        let (client, mut server, _events) = ready_client().await;

        let calling = {
            let client = client.clone();
            tokio::spawn(async move { client.request("custom/slow", None).await })
        };
        server.expect_request("custom/slow").await;

        client.shutdown(true).await;
        assert!(matches!(
            calling.await.unwrap(),
            Err(LspError::Disconnected(_))
        ));
        assert_eq!(client.state(), SessionState::Stopped);
        assert_eq!(client.pending_requests(), 0);
        assert!(client.server_capabilities().await.is_none());

        client.shutdown(true).await;
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_sends_shutdown_then_exit() {
        let (client, mut server, mut events) = ready_client().await;
        let _ = states(&mut events);

        let stopping = {
            let client = client.clone();
            tokio::spawn(async move { client.shutdown(false).await })
        };
        let (id, params) = server.expect_request("shutdown").await;
        assert!(params.is_none());
        server.respond(id, Value::Null).await;
        assert!(server.expect_notification("exit").await.is_none());

        stopping.await.unwrap();
        assert_eq!(
            states(&mut events),
            vec![SessionState::ShuttingDown, SessionState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_graceful_shutdown_escalates_when_server_stops_reading() {
        let (client, mut events) = client_with(
            "pylsp",
            Timeouts {
                request_ms: 100,
                shutdown_request_ms: 100,
                exit_wait_ms: 100,
                terminate_wait_ms: 100,
                ..timeouts()
            },
        );
        let (io, mut server) = fake_pair_with(64);
        let starting = spawn_start(&client, io);
        server.accept_initialize().await;
        assert!(starting.await.unwrap());

        // From here on the server never reads, so a large didOpen fills the pipe.
        let text = "x".repeat(200 * 1024);
        tokio::time::timeout(
            Duration::from_secs(5),
            client.notify_did_open(&a_py(), &text),
        )
        .await
        .expect("didOpen must give up within the request bound");
        assert!(next_error(&mut events).await.contains("not delivered"));
        assert!(client.is_ready());

        tokio::time::timeout(Duration::from_secs(5), client.shutdown(false))
            .await
            .expect("graceful shutdown must escalate within its bounds");
        assert_eq!(client.state(), SessionState::Stopped);
        assert_eq!(client.pending_requests(), 0);

        // The lifecycle lock was released.
        tokio::time::timeout(Duration::from_secs(5), client.shutdown(true))
            .await
            .unwrap();
        drop(server);
    }

    #[tokio::test]
    async fn test_late_write_failure_from_old_run_spares_restarted_run() {
        let (client, server, _events) = ready_client().await;
        let mut state = client.subscribe_state();
        let first_run = client.session.ready_outbound().await.unwrap();

        drop(server);
        state
            .wait_for(|s| matches!(s, SessionState::Failed(_)))
            .await
            .unwrap();

        let (io, mut server) = fake_pair();
        let starting = spawn_start(&client, io);
        server.accept_initialize().await;
        assert!(starting.await.unwrap());

        // A caller still holding the first run's writer reports its failure late.
        client
            .session
            .on_send_error(
                &first_run,
                &LspError::Disconnected("writer closed".to_string()),
            )
            .await;
        assert!(client.is_ready());

        client.notify_did_save(&a_py()).await;
        server.expect_notification("textDocument/didSave").await;
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_server_traffic_becomes_events() {
        let (client, mut server, mut events) = ready_client().await;

        server
            .send(Message::notification(
                "textDocument/publishDiagnostics",
                Some(json!({
                    "uri": A_PY_URI,
                    "diagnostics": [{
                        "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
                        "severity": 1,
                        "message": "undefined name 'y'"
                    }]
                })),
            ))
            .await;
        server.stderr.write_all(b"pylsp: indexing\n").await.unwrap();

        let mut saw_diagnostics = false;
        let mut saw_stderr = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(saw_diagnostics && saw_stderr) {
                match events.recv().await {
                    Some(LspEvent::Diagnostics { path, items, .. }) => {
                        assert_eq!(path, a_py());
                        assert_eq!(items.len(), 1);
                        saw_diagnostics = true;
                    }
                    Some(LspEvent::Stderr { line, .. }) => {
                        assert_eq!(line, "pylsp: indexing");
                        saw_stderr = true;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_diagnostics && saw_stderr);
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_server_request_answered_with_method_not_found() {
        let (_client, mut server, _events) = ready_client().await;

        server
            .send(Message::Request {
                id: RequestId::String("cfg-1".to_string()),
                method: "workspace/configuration".to_string(),
                params: Some(json!({ "items": [] })),
            })
            .await;

        match server.recv().await {
            Message::Response {
                id,
                outcome: Err(error),
            } => {
                assert_eq!(id, RequestId::String("cfg-1".to_string()));
                assert_eq!(error.code, ResponseError::METHOD_NOT_FOUND);
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }
}
