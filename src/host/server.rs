//! TCP host: accept loop, session supervision, stop and abort.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::registry::SessionRegistry;
use super::session::{self, SessionContext, SessionHandle, SessionInfo};
use crate::config::GlobalConfig;
use crate::engine::Engine;
use crate::wire::codec::MAX_HANDSHAKE_FRAME_BYTES;
use crate::wire::{FrameCodec, Message};
use crate::{AppError, Result};

/// Back-off after the process ran out of file descriptors.
const FD_EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

/// Listening host owning the session registry.
#[derive(Debug)]
pub struct Host {
    config: Arc<GlobalConfig>,
    engine: Arc<Engine>,
    registry: SessionRegistry,
    stop: CancellationToken,
    supervisor: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    abort_reason: Mutex<Option<String>>,
}

impl Host {
    /// Bind the listener.
    ///
    /// `supervisor` is cancelled when the host aborts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid address or `AppError::Io`
    /// if the port cannot be bound.
    pub async fn bind(
        config: Arc<GlobalConfig>,
        engine: Arc<Engine>,
        supervisor: CancellationToken,
    ) -> Result<Arc<Self>> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| AppError::Io(format!("failed to bind {addr}: {err}")))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "host listening");

        Ok(Arc::new(Self {
            config,
            engine,
            registry: SessionRegistry::new(),
            stop: CancellationToken::new(),
            supervisor,
            tracker: TaskTracker::new(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            abort_reason: Mutex::new(None),
        }))
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Host` if the accept loop was already started.
    pub fn spawn(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| AppError::Host("accept loop already started".into()))?;
        let host = Arc::clone(self);
        let span = info_span!("accept_loop", addr = %self.local_addr);
        self.tracker
            .spawn(async move { host.accept_loop(listener).await }.instrument(span));
        Ok(())
    }

    /// Sessions that completed the handshake.
    #[must_use]
    pub fn verified_sessions(&self) -> Vec<SessionInfo> {
        self.registry.verified()
    }

    /// Every registered session.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Why the host aborted, if it did.
    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    /// Stop accepting, close every session, and wait for all session tasks.
    ///
    /// Safe to call more than once and concurrently with session teardown.
    pub async fn stop(&self) {
        self.stop.cancel();
        for handle in self.registry.handles() {
            handle.close();
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!(remaining = self.registry.len(), "host stopped");
    }

    /// Tear the host down after a fatal error.
    ///
    /// Cancels accepting and every session and signals the supervisor, which
    /// is expected to finish with [`stop`](Self::stop).
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "host aborting");
        self.abort_reason.lock().get_or_insert(reason);
        self.stop.cancel();
        self.tracker.close();
        self.supervisor.cancel();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    info!("accept loop stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(err) if is_fd_exhaustion(&err) => {
                        warn!(%err, "out of file descriptors, backing off");
                        tokio::time::sleep(FD_EXHAUSTION_BACKOFF).await;
                    }
                    Err(err) if is_transient(&err) => {
                        warn!(%err, "transient accept error");
                    }
                    Err(err) => {
                        self.abort(format!("accept failed: {err}"));
                        break;
                    }
                },
            }
        }
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.registry.len() >= self.config.max_sessions {
            warn!(%peer, max = self.config.max_sessions, "rejecting connection, host busy");
            self.tracker.spawn(reject_busy(stream));
            return;
        }

        let handle = Arc::new(SessionHandle::new(peer, &self.stop));
        // Registered before the session reads a single byte.
        self.registry.insert(Arc::clone(&handle));
        debug!(session_id = %handle.id(), %peer, "connection accepted");

        let host = Arc::clone(self);
        self.tracker.spawn(host.supervise(stream, handle));
    }

    async fn supervise(self: Arc<Self>, stream: TcpStream, handle: Arc<SessionHandle>) {
        let id = handle.id();
        let cx = SessionContext {
            config: Arc::clone(&self.config),
            engine: Arc::clone(&self.engine),
        };
        let outcome = tokio::spawn(session::run_session(stream, handle, cx)).await;
        self.registry.remove(id);

        match outcome {
            Ok(Ok(())) => debug!(session_id = %id, "session finished"),
            Ok(Err(err)) => self.abort(format!("session {id} failed: {err}")),
            Err(join_err) if join_err.is_panic() => {
                self.abort(format!("session {id} panicked: {join_err}"));
            }
            Err(join_err) => warn!(session_id = %id, %join_err, "session task cancelled"),
        }
    }
}

async fn reject_busy(stream: TcpStream) {
    let mut writer = FramedWrite::new(stream, FrameCodec::new(MAX_HANDSHAKE_FRAME_BYTES));
    if let Err(err) = writer.send(Message::disconnect("host busy")).await {
        debug!(%err, "failed to notify rejected connection");
    }
}

/// Per-connection accept failures that leave the listener usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// `EMFILE` / `ENFILE`.
fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23 | 24))
}
