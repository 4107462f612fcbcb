//! Per-connection session protocol.
//!
//! A session moves through `Connected → Handshaking → Verified → Closing →
//! Closed`. The reader (this task) decodes frames and dispatches them
//! strictly in arrival order; a separate writer task drains the outbox so
//! replies, logs, prompts, and results leave in the order they were queued.
//!
//! Session-local failures (network faults, protocol violations, rejected
//! handshakes) end the session with a best-effort `Disconnect` frame and are
//! not reported upward. Anything else is returned to the host, which treats
//! it as fatal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::engine::{CheckpointDecision, Engine, OperatorChannel, RunHandle, RunReport};
use crate::loader::{self, PortableCode};
use crate::target::{PromptRequest, Prompter};
use crate::wire::handshake;
use crate::wire::messages::{
    CheckpointAnswer, CheckpointPrompt, CodeImage, LoadFailed, LogLevel, Message, RunEntryPoint,
    RunStarted,
};
use crate::wire::FrameCodec;
use crate::{AppError, Result};

/// How long a closing session waits for queued frames to be written.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepted, nothing read yet.
    Connected,
    /// Waiting for the client's `Hello`.
    Handshaking,
    /// Handshake succeeded; all frame kinds accepted.
    Verified,
    /// Tearing down.
    Closing,
    /// Finished.
    Closed,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: Uuid,
    /// Remote address.
    pub peer: SocketAddr,
    /// Protocol state.
    pub state: SessionState,
    /// Client identification from the handshake.
    pub client: Option<String>,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
}

/// Registry entry for one connection.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    client: Mutex<Option<String>>,
    close: CancellationToken,
}

impl SessionHandle {
    /// Create a handle whose close signal also fires when `parent` does.
    #[must_use]
    pub fn new(peer: SocketAddr, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState::Connected),
            client: Mutex::new(None),
            close: parent.child_token(),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Protocol state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Snapshot for external readers.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: self.peer,
            state: self.state(),
            client: self.client.lock().clone(),
            connected_at: self.connected_at,
        }
    }

    /// Ask the session to close. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether a close was requested.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Everything a session needs from its host.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Host configuration.
    pub config: Arc<GlobalConfig>,
    /// Execution engine shared by all sessions.
    pub engine: Arc<Engine>,
}

#[derive(Debug)]
enum Outbound {
    Frame(Message),
    Upgrade,
    Close,
}

/// Sending side of the writer task.
#[derive(Debug, Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    /// Queue a frame; returns false once the writer is gone.
    fn send(&self, message: impl Into<Message>) -> bool {
        self.tx.send(Outbound::Frame(message.into())).is_ok()
    }

    fn log(&self, run_id: Option<&str>, level: LogLevel, line: impl Into<String>) {
        self.send(Message::log(run_id, level, line));
    }

    fn upgrade(&self) {
        let _ = self.tx.send(Outbound::Upgrade);
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

struct PendingPrompt {
    run_id: String,
    choices: Vec<CheckpointDecision>,
    answer: oneshot::Sender<CheckpointDecision>,
}

/// Checkpoint prompts waiting for an answer on this session.
#[derive(Default)]
struct PendingPrompts {
    prompts: Mutex<HashMap<String, PendingPrompt>>,
}

impl PendingPrompts {
    fn insert(&self, prompt_id: String, prompt: PendingPrompt) {
        self.prompts.lock().insert(prompt_id, prompt);
    }

    /// Deliver an answer. A decision that was not offered leaves the prompt open.
    fn resolve(&self, answer: CheckpointAnswer) -> std::result::Result<(), String> {
        let mut prompts = self.prompts.lock();
        let Some(pending) = prompts.get(&answer.prompt_id) else {
            return Err(format!("no open checkpoint {}", answer.prompt_id));
        };
        if !pending.choices.contains(&answer.decision) {
            return Err(format!(
                "decision '{}' was not offered at checkpoint {}",
                answer.decision, answer.prompt_id
            ));
        }
        if let Some(pending) = prompts.remove(&answer.prompt_id) {
            // The run may have ended in the meantime.
            let _ = pending.answer.send(answer.decision);
        }
        Ok(())
    }

    fn forget_run(&self, run_id: &str) {
        self.prompts.lock().retain(|_, p| p.run_id != run_id);
    }

    /// Drop every open prompt; waiting runs see the operator as gone.
    fn clear(&self) -> usize {
        let mut prompts = self.prompts.lock();
        let count = prompts.len();
        prompts.clear();
        count
    }
}

/// Operator side of the runs a session started.
struct SessionOperator {
    outbox: Outbox,
    pending: Arc<PendingPrompts>,
}

impl Prompter for SessionOperator {
    fn prompt(&self, request: PromptRequest) -> oneshot::Receiver<CheckpointDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request.prompt_id.clone(),
            PendingPrompt {
                run_id: request.run_id.clone(),
                choices: request.choices.clone(),
                answer: tx,
            },
        );
        let sent = self.outbox.send(CheckpointPrompt {
            run_id: request.run_id,
            prompt_id: request.prompt_id.clone(),
            message: request.message,
            choices: request.choices,
        });
        if !sent {
            // Nobody can answer; dropping the sender closes the receiver.
            self.pending.prompts.lock().remove(&request.prompt_id);
        }
        rx
    }
}

impl OperatorChannel for SessionOperator {
    fn started(&self, run: &RunHandle) {
        self.outbox.send(RunStarted {
            run_id: run.run_id.clone(),
            entry: run.entry.clone(),
        });
    }

    fn log(&self, run_id: &str, level: LogLevel, line: &str) {
        self.outbox.log(Some(run_id), level, line);
    }

    fn report(&self, report: &RunReport) {
        self.pending.forget_run(&report.run_id);
        self.outbox.send(report.to_result());
    }
}

/// Drive one accepted connection to completion.
///
/// # Errors
///
/// Only errors that are not session-local are returned; the host escalates
/// them to its abort path.
pub async fn run_session(
    stream: TcpStream,
    handle: Arc<SessionHandle>,
    cx: SessionContext,
) -> Result<()> {
    let span = info_span!("session", session_id = %handle.id(), peer = %handle.peer());
    async move {
        let (read_half, write_half) = stream.into_split();
        let max_frame_bytes = cx.config.max_frame_bytes;
        let mut reader = FramedRead::new(read_half, FrameCodec::new(max_frame_bytes));
        let writer = FramedWrite::new(write_half, FrameCodec::new(max_frame_bytes));

        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Outbox { tx };
        let writer_task = tokio::spawn(write_loop(writer, rx).in_current_span());

        let pending = Arc::new(PendingPrompts::default());
        let mut session = Session {
            handle: Arc::clone(&handle),
            cx,
            outbox: outbox.clone(),
            operator: Arc::new(SessionOperator {
                outbox: outbox.clone(),
                pending: Arc::clone(&pending),
            }),
            pending: Arc::clone(&pending),
            code: None,
        };

        handle.set_state(SessionState::Handshaking);
        let result = tokio::select! {
            () = handle.close.cancelled() => {
                info!("session closed by host");
                outbox.send(Message::disconnect("host is shutting down"));
                Ok(())
            }
            result = session.serve(&mut reader) => result,
        };

        let result = match result {
            Err(err) if err.is_session_local() => {
                warn!(%err, "session ended with error");
                outbox.send(Message::disconnect(format!("disconnected with exception: {err}")));
                Ok(())
            }
            other => other,
        };

        handle.set_state(SessionState::Closing);
        let stopped = session.cx.engine.stop_owned_by(handle.id());
        let dropped = pending.clear();
        drop(session);

        outbox.close();
        drop(outbox);
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => debug!(%err, "writer ended with error"),
            Ok(Err(join_err)) if join_err.is_panic() => {
                handle.set_state(SessionState::Closed);
                handle.close();
                return Err(AppError::Host(format!("session writer panicked: {join_err}")));
            }
            Ok(Err(join_err)) => debug!(%join_err, "writer task cancelled"),
            Err(_) => warn!("writer did not drain in time"),
        }

        handle.set_state(SessionState::Closed);
        handle.close();
        info!(stopped_runs = stopped, dropped_prompts = dropped, "session closed");
        result
    }
    .instrument(span)
    .await
}

async fn write_loop(
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(message) => writer.send(message).await?,
            Outbound::Upgrade => writer.encoder_mut().upgrade(),
            Outbound::Close => break,
        }
    }
    writer.close().await
}

struct Session {
    handle: Arc<SessionHandle>,
    cx: SessionContext,
    outbox: Outbox,
    operator: Arc<SessionOperator>,
    pending: Arc<PendingPrompts>,
    code: Option<Arc<PortableCode>>,
}

impl Session {
    async fn serve<R>(&mut self, reader: &mut FramedRead<R, FrameCodec>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.handshake(reader).await?;

        while let Some(frame) = reader.next().await {
            if !self.dispatch(frame?).await? {
                break;
            }
        }
        Ok(())
    }

    async fn handshake<R>(&mut self, reader: &mut FramedRead<R, FrameCodec>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let first = tokio::time::timeout(self.cx.config.handshake_timeout(), reader.next())
            .await
            .map_err(|_| AppError::Network("handshake timed out".into()))?
            .ok_or_else(|| AppError::Network("connection closed before handshake".into()))??;

        let Message::Hello(hello) = first else {
            return Err(AppError::Protocol(format!(
                "expected Hello, got {:?}",
                first.kind()
            )));
        };

        let session_id = self.handle.id().to_string();
        match handshake::verify(&hello, &self.cx.config.handshake_token, &session_id) {
            Ok(ack) => {
                *self.handle.client.lock() = Some(hello.client.clone());
                self.handle.set_state(SessionState::Verified);
                reader.decoder_mut().upgrade();
                self.outbox.upgrade();
                self.outbox.send(ack);
                info!(client = %hello.client, "session verified");
                Ok(())
            }
            Err(nack) => {
                warn!(client = %hello.client, reason = %nack.reason, "handshake rejected");
                let reason = nack.reason.clone();
                self.outbox.send(nack);
                Err(AppError::Unauthorized(reason))
            }
        }
    }

    /// Handle one verified frame. Returns false when the client disconnects.
    async fn dispatch(&mut self, message: Message) -> Result<bool> {
        debug!(kind = ?message.kind(), "frame received");
        match message {
            Message::CodeImage(image) => self.load_image(image).await?,
            Message::ListCatalog(_) => match &self.code {
                Some(code) => {
                    self.outbox.send(code.catalog());
                }
                None => {
                    self.outbox.send(LoadFailed {
                        reason: "no code image loaded".into(),
                    });
                }
            },
            Message::RunEntryPoint(request) => self.start_run(request),
            Message::StopRun(stop) => {
                if let Err(err) = self.cx.engine.stop_run(&stop.run_id, Some(self.handle.id())) {
                    self.outbox.log(Some(&stop.run_id), LogLevel::Warn, err.to_string());
                }
            }
            Message::CheckpointAnswer(answer) => {
                if let Err(reason) = self.pending.resolve(answer) {
                    warn!(%reason, "checkpoint answer rejected");
                    self.outbox.log(None, LogLevel::Warn, reason);
                }
            }
            Message::SimulateInput(input) => {
                if let Err(reason) = self.cx.engine.target().send_input(&input.event) {
                    self.outbox.log(None, LogLevel::Warn, reason);
                }
            }
            Message::Disconnect(disconnect) => {
                info!(reason = %disconnect.reason, "client disconnected");
                return Ok(false);
            }
            Message::Hello(_) => {
                return Err(AppError::Protocol("Hello received after handshake".into()));
            }
            other => {
                return Err(AppError::Protocol(format!(
                    "unexpected {:?} frame from client",
                    other.kind()
                )));
            }
        }
        Ok(true)
    }

    async fn load_image(&mut self, image: CodeImage) -> Result<()> {
        let modules = self.cx.engine.target().modules();
        let CodeImage { image, symbols } = image;
        let loaded = tokio::task::spawn_blocking(move || {
            loader::load(&image, symbols.as_deref(), &modules)
        })
        .await
        .map_err(|err| AppError::Host(format!("loader task failed: {err}")))?;

        match loaded {
            Ok(code) => {
                let code = Arc::new(code);
                for skipped in code.skipped() {
                    self.outbox.log(None, LogLevel::Warn, format!("skipped {skipped}"));
                }
                self.outbox.send(code.catalog());
                self.code = Some(code);
            }
            Err(err) => {
                warn!(%err, "code image rejected");
                self.code = None;
                self.outbox.send(LoadFailed {
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    fn start_run(&mut self, request: RunEntryPoint) {
        let Some(code) = &self.code else {
            self.outbox.log(None, LogLevel::Error, "no code image loaded");
            return;
        };
        let started = code.instantiate(request.index).and_then(|(entry, task)| {
            let operator: Arc<dyn OperatorChannel> = Arc::clone(&self.operator) as _;
            self.cx.engine.start(
                entry.qualified_name(),
                Box::new(task),
                request.time_flow,
                operator,
                Some(self.handle.id()),
            )
        });
        // On success the operator already queued `RunStarted`.
        if let Err(err) = started {
            self.outbox.log(None, LogLevel::Error, err.to_string());
        }
    }
}
