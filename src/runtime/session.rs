//! Per-connection protocol state machine.
//!
//! ```text
//! Idle -> ReadingHeader -> ReadingBody -> Dispatching -> Idle
//! Idle -> Writing -> Idle
//! any  -> Closed
//! ```
//!
//! A session runs its action queue strictly front to back on a single task,
//! so at most one read or write is ever outstanding on the transport. When
//! the queue runs dry the session parks until the application layer enqueues
//! another action through its [`SessionHandle`](super::SessionHandle).

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::directory::{SessionDirectory, SessionSignals};
use crate::config::Config;
use crate::error::{HandlerError, ProtocolError, SessionError};
use crate::protocol::header;
use crate::protocol::{Action, ActionKind, HandlerRegistry, Mode, PayloadKind, Request};

/// Read buffer growth step.
const READ_CHUNK: usize = 16 * 1024;

/// Initial capacity of an outgoing header.
const HEADER_CAPACITY: usize = 256;

/// A byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Shut down both directions of the stream.
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn shutdown_both(&self) -> io::Result<()> {
        socket2::SockRef::from(self).shutdown(Shutdown::Both)
    }
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ReadingHeader,
    ReadingBody,
    Dispatching,
    Writing,
    /// Terminal.
    Closed,
}

/// Per-session limits and defaults.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    /// Payload kind for requests without a `type` property.
    pub default_payload: PayloadKind,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
            default_payload: config.default_payload,
        }
    }
}

/// State shared by every session of one listener.
pub struct SessionContext {
    pub handlers: HandlerRegistry,
    pub settings: SessionSettings,
    pub directory: Arc<SessionDirectory>,
}

/// One accepted connection.
pub struct Session<T: Transport> {
    id: usize,
    peer: SocketAddr,
    transport: T,
    state: SessionState,
    queue: VecDeque<Action>,
    read_buf: BytesMut,
    signals: SessionSignals,
    context: Arc<SessionContext>,
}

impl<T: Transport> Session<T> {
    /// Wrap a connection already registered in the directory under `id`.
    pub fn new(
        id: usize,
        peer: SocketAddr,
        transport: T,
        signals: SessionSignals,
        context: Arc<SessionContext>,
    ) -> Self {
        Self {
            id,
            peer,
            transport,
            state: SessionState::Idle,
            queue: VecDeque::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            signals,
            context,
        }
    }

    /// Run the session to completion.
    ///
    /// Queues the initial read, works through the queue until the peer hangs
    /// up, the session is cancelled, or an error occurs, then closes the
    /// transport and releases the directory entry.
    pub async fn execute(mut self) -> Result<(), SessionError> {
        debug!(conn_id = self.id, peer = %self.peer, "Session started");

        self.queue.push_back(Action::read());
        let result = self.run().await;

        match &result {
            Ok(()) => debug!(conn_id = self.id, "Connection closed by peer"),
            Err(e) if e.is_cancelled() => debug!(conn_id = self.id, "Session cancelled"),
            Err(e) => warn!(conn_id = self.id, peer = %self.peer, error = %e, "Session failed"),
        }

        let discarded = self.queue.len();
        self.queue.clear();
        if discarded > 0 {
            debug!(conn_id = self.id, discarded, "Discarded pending actions");
        }

        self.close();
        self.context.directory.remove(self.id);
        result
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            self.collect_enqueued();

            // The front action leaves the queue while it runs. On failure the
            // remainder is discarded, so nothing else can observe the order.
            let Some(action) = self.queue.pop_front() else {
                self.transition(SessionState::Idle);
                match self.wait_for_action().await? {
                    Some(action) => self.queue.push_back(action),
                    None => return Ok(()),
                }
                continue;
            };

            match action.mode() {
                Mode::Read => {
                    if !self.do_read(action).await? {
                        return Ok(());
                    }
                }
                Mode::Write => self.do_write(action).await?,
            }
            self.transition(SessionState::Idle);
        }
    }

    /// Read, frame and dispatch one request.
    ///
    /// Returns `false` if the peer closed the connection before sending
    /// anything.
    async fn do_read(&mut self, mut action: Action) -> Result<bool, SessionError> {
        self.transition(SessionState::ReadingHeader);
        let Some(raw) = self.read_header().await? else {
            return Ok(false);
        };

        let properties = header::parse(&raw)?;
        action.resolve_header(properties, self.context.settings.default_payload)?;

        let limit = self.context.settings.max_body_bytes;
        if action.size() > limit {
            return Err(ProtocolError::BodyTooLarge {
                size: action.size(),
                limit,
            }
            .into());
        }

        self.transition(SessionState::ReadingBody);
        let body = self.read_body(action.size()).await?;

        self.transition(SessionState::Dispatching);
        let request = Request {
            kind: action.payload_kind(),
            properties: action.into_properties(),
            body,
        };
        let pending = self.context.handlers.get(request.kind)?.handle(request);
        let follow_ups = tokio::select! {
            biased;
            _ = self.signals.cancel.wait_for(|cancelled| *cancelled) => Err(SessionError::Cancelled),
            result = pending => result.map_err(SessionError::from),
        }?;

        trace!(conn_id = self.id, queued = follow_ups.len(), "Request dispatched");
        // Actions enqueued while the request was in flight go first.
        self.collect_enqueued();
        self.queue.extend(follow_ups);
        Ok(true)
    }

    /// Read up to and including the header sentinel.
    ///
    /// Bytes past the sentinel stay buffered for the body and later requests.
    /// Returns `None` on a clean EOF before any header byte arrived.
    async fn read_header(&mut self) -> Result<Option<BytesMut>, SessionError> {
        let limit = self.context.settings.max_header_bytes;
        let mut scanned: usize = 0;

        loop {
            let from = scanned.saturating_sub(header::SENTINEL.len() - 1);
            if let Some(len) = header::find_sentinel(&self.read_buf[from..]) {
                let len = from + len;
                if len > limit {
                    return Err(ProtocolError::HeaderTooLarge { limit }.into());
                }
                return Ok(Some(self.read_buf.split_to(len)));
            }
            if self.read_buf.len() >= limit {
                return Err(ProtocolError::HeaderTooLarge { limit }.into());
            }
            scanned = self.read_buf.len();

            self.read_buf.reserve(READ_CHUNK);
            let n = cancellable(
                &mut self.signals.cancel,
                self.transport.read_buf(&mut self.read_buf),
            )
            .await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-header",
                )));
            }
        }
    }

    /// Read exactly `size` body bytes.
    async fn read_body(&mut self, size: usize) -> Result<Bytes, SessionError> {
        while self.read_buf.len() < size {
            self.read_buf.reserve(size - self.read_buf.len());
            let n = cancellable(
                &mut self.signals.cancel,
                self.transport.read_buf(&mut self.read_buf),
            )
            .await?;
            if n == 0 {
                return Err(SessionError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                )));
            }
        }
        Ok(self.read_buf.split_to(size).freeze())
    }

    /// Send a response: header, then body bytes.
    async fn do_write(&mut self, mut action: Action) -> Result<(), SessionError> {
        self.transition(SessionState::Writing);

        let file = match action.file_path().map(Path::to_path_buf) {
            Some(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(resource_error)?;
                let len = file.metadata().await.map_err(resource_error)?.len();
                let size = usize::try_from(len).map_err(|_| {
                    resource_error(io::Error::new(io::ErrorKind::InvalidData, "file too large"))
                })?;
                action.set_size(size);
                Some(file)
            }
            None => None,
        };

        // File bodies are streamed, so only string bodies are buffered.
        let mut out = BytesMut::with_capacity(HEADER_CAPACITY);
        action.prepare_header(&mut out);
        if let ActionKind::WriteString(text) = action.kind() {
            out.extend_from_slice(text.as_bytes());
        }

        let transport = &mut self.transport;
        cancellable(&mut self.signals.cancel, async {
            transport.write_all(&out).await?;
            if let Some(file) = file {
                let expected = action.size() as u64;
                let copied = tokio::io::copy(&mut file.take(expected), &mut *transport).await?;
                if copied < expected {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while streaming",
                    ));
                }
            }
            transport.flush().await
        })
        .await?;

        trace!(conn_id = self.id, bytes = action.size(), "Response written");
        Ok(())
    }

    /// Move actions enqueued by the application layer onto the queue.
    fn collect_enqueued(&mut self) {
        while let Ok(action) = self.signals.inbox.try_recv() {
            self.queue.push_back(action);
        }
    }

    /// Park with no I/O outstanding until an action is enqueued.
    ///
    /// Returns `None` once every handle has been dropped.
    async fn wait_for_action(&mut self) -> Result<Option<Action>, SessionError> {
        let SessionSignals { inbox, cancel } = &mut self.signals;
        tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => Err(SessionError::Cancelled),
            action = inbox.recv() => Ok(action),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            trace!(conn_id = self.id, from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }

    /// Shut the transport down. Only the first call has any effect.
    fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closed);
        if let Err(e) = self.transport.shutdown_both() {
            debug!(conn_id = self.id, error = %e, "Transport shutdown failed");
        }
    }
}

/// Run `op` unless the session is cancelled first.
///
/// Dropping `op` on cancellation abandons the pending read or write.
async fn cancellable<F, R>(cancel: &mut watch::Receiver<bool>, op: F) -> Result<R, SessionError>
where
    F: Future<Output = io::Result<R>>,
{
    tokio::select! {
        biased;
        _ = cancel.wait_for(|cancelled| *cancelled) => Err(SessionError::Cancelled),
        result = op => result.map_err(SessionError::Transport),
    }
}

fn resource_error(e: io::Error) -> SessionError {
    SessionError::Handler(HandlerError::Io(e))
}
