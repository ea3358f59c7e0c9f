//! Listener and reactor.
//!
//! The listener owns a dedicated reactor thread running a current-thread
//! tokio runtime. Every accept, read, write and handler completion runs on
//! that one thread, so no session state needs locking; only the session
//! directory is shared with the caller.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::directory::{SessionDirectory, SessionHandle};
use super::session::{Session, SessionContext, SessionSettings};
use crate::config::Config;
use crate::error::ServerError;
use crate::protocol::HandlerRegistry;

/// Pending-connection backlog for the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// How long shutdown waits for cancelled sessions to release their entries.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A listening endpoint and the reactor serving its connections.
pub struct Listener {
    local_addr: SocketAddr,
    directory: Arc<SessionDirectory>,
    /// Set once `close` has been called; cancels the pending accept.
    closed: watch::Sender<bool>,
    /// Set once `shutdown` has been called; stops the reactor.
    stopped: watch::Sender<bool>,
    reactor: Option<thread::JoinHandle<()>>,
}

impl Listener {
    /// Bind `config.host:config.port`, start the reactor and begin accepting.
    ///
    /// Bind failures are returned to the caller and never retried.
    pub fn open(config: &Config, handlers: HandlerRegistry) -> Result<Self, ServerError> {
        let ip: IpAddr = config
            .host
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.host.clone()))?;
        let addr = SocketAddr::new(ip, config.port);

        let std_listener =
            create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = std_listener.local_addr().map_err(ServerError::Runtime)?;

        let directory = Arc::new(SessionDirectory::new());
        let context = Arc::new(SessionContext {
            handlers,
            settings: SessionSettings::from(config),
            directory: Arc::clone(&directory),
        });

        let (closed, closed_rx) = watch::channel(false);
        let (stopped, stopped_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let reactor = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || {
                // The runtime is created and dropped on this thread only.
                let (runtime, listener) = match start_runtime(addr, std_listener) {
                    Ok(started) => started,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_reactor(runtime, listener, context, closed_rx, stopped_rx);
            })
            .map_err(ServerError::Runtime)?;

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(ServerError::Runtime(io::Error::other(
                "reactor thread exited during startup",
            )))
        });
        if let Err(e) = started {
            let _ = reactor.join();
            return Err(e);
        }

        info!(addr = %local_addr, "Listening");

        Ok(Self {
            local_addr,
            directory,
            closed,
            stopped,
            reactor: Some(reactor),
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Stop accepting new connections. Live sessions keep running. Idempotent.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(addr = %self.local_addr, "Closing listener");
        }
    }

    /// Close the listener, cancel every session, and stop the reactor. Idempotent.
    pub fn shutdown(&mut self) {
        self.close();
        let Some(reactor) = self.reactor.take() else {
            return;
        };

        self.directory.close_all();
        self.stopped.send_replace(true);
        if reactor.join().is_err() {
            error!("Reactor thread panicked");
        }
        info!(addr = %self.local_addr, "Server shut down");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the reactor's runtime and register the listening socket with it.
fn start_runtime(
    addr: SocketAddr,
    std_listener: std::net::TcpListener,
) -> Result<(Runtime, TcpListener), ServerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;
    let listener = {
        let _guard = runtime.enter();
        TcpListener::from_std(std_listener).map_err(|source| ServerError::Bind { addr, source })?
    };
    Ok((runtime, listener))
}

/// Body of the reactor thread.
fn run_reactor(
    runtime: Runtime,
    listener: TcpListener,
    context: Arc<SessionContext>,
    closed: watch::Receiver<bool>,
    mut stopped: watch::Receiver<bool>,
) {
    runtime.block_on(async move {
        tokio::spawn(accept_loop(listener, Arc::clone(&context), closed));

        // Also returns if the listener handle is gone.
        let _ = stopped.wait_for(|stop| *stop).await;

        let directory = &context.directory;
        directory.close_all();
        if tokio::time::timeout(SHUTDOWN_GRACE, directory.drained())
            .await
            .is_err()
        {
            for id in directory.ids() {
                if let Some(handle) = directory.get(id) {
                    warn!(conn_id = id, peer = %handle.peer(), "Session still open after shutdown grace period");
                }
            }
        }
    });
    // Dropping the runtime drops any task still running.
}

/// Accept connections until the listener is closed or accept fails.
///
/// The next accept is issued as soon as a connection has been registered
/// and its session spawned.
async fn accept_loop(
    listener: TcpListener,
    context: Arc<SessionContext>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => {
                debug!("Accept cancelled");
                break;
            }
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => {
                let (handle, signals) = SessionHandle::new(peer);
                let id = context.directory.insert(handle);
                debug!(conn_id = id, peer = %peer, "Accepted connection");

                let session = Session::new(id, peer, stream, signals, Arc::clone(&context));
                tokio::spawn(session.execute());
            }
            Err(e) => {
                error!(error = %e, "Accept failed, listener stopped");
                break;
            }
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadKind;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(port: u16, file_root: &std::path::Path) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            default_payload: PayloadKind::String,
            max_header_bytes: 1024,
            max_body_bytes: 64 * 1024,
            file_root: file_root.to_path_buf(),
            log_level: "info".to_string(),
        }
    }

    fn open(dir: &TempDir) -> Listener {
        let config = test_config(0, dir.path());
        Listener::open(&config, HandlerRegistry::with_defaults(dir.path())).unwrap()
    }

    async fn request(stream: &mut TcpStream, frame: &[u8], reply_len: usize) -> Vec<u8> {
        stream.write_all(frame).await.unwrap();
        let mut reply = vec![0u8; reply_len];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
            .await
            .expect("reply should arrive")
            .unwrap();
        reply
    }

    async fn wait_for_sessions(directory: &SessionDirectory, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while directory.len() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} sessions, found {}",
                directory.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn assert_closed_by_server(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server should close the connection");
        // A reset is as good as EOF here.
        if let Ok(n) = read {
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_string_echo_over_tcp() {
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        let expected = b"PROTO1\nsize=5\ntype=string_type\n\nhello";
        let reply = request(&mut client, b"PROTO1\nsize=5\n\nhello", expected.len()).await;
        assert_eq!(reply, expected);

        // The session stays open for the next request.
        let expected = b"PROTO1\nsize=0\ntype=string_type\n\n";
        let reply = request(&mut client, b"PROTO1\n\n", expected.len()).await;
        assert_eq!(reply, expected);
        assert_eq!(listener.directory().len(), 1);
    }

    #[tokio::test]
    async fn test_file_upload_and_download() {
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        let ack = b"PROTO1\nname=a.txt\nsize=0\nstatus=stored\ntype=string_type\n\n";
        let reply = request(
            &mut client,
            b"PROTO1\ntype=file_type\nname=a.txt\nsize=4\n\ndata",
            ack.len(),
        )
        .await;
        assert_eq!(reply, ack);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"data");

        let expected = b"PROTO1\nname=a.txt\nsize=4\ntype=file_type\n\ndata";
        let reply = request(
            &mut client,
            b"PROTO1\ntype=file_type\nname=a.txt\n\n",
            expected.len(),
        )
        .await;
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_accepts_rapid_connections() {
        const CLIENTS: usize = 64;
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);
        let addr = listener.local_addr();

        let mut tasks = Vec::with_capacity(CLIENTS);
        for i in 0..CLIENTS {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let body = format!("client-{i:03}");
                let frame = format!("PROTO1\nsize={}\n\n{body}", body.len());
                let expected = format!(
                    "PROTO1\nsize={}\ntype=string_type\n\n{body}",
                    body.len()
                );
                let reply = request(&mut client, frame.as_bytes(), expected.len()).await;
                assert_eq!(reply, expected.as_bytes());
                client
            }));
        }

        let mut clients = Vec::with_capacity(CLIENTS);
        for task in tasks {
            clients.push(task.await.unwrap());
        }
        assert_eq!(listener.directory().len(), CLIENTS);

        drop(clients);
        wait_for_sessions(listener.directory(), 0).await;
    }

    #[tokio::test]
    async fn test_peer_close_releases_session() {
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);

        let client = TcpStream::connect(listener.local_addr()).await.unwrap();
        wait_for_sessions(listener.directory(), 1).await;

        drop(client);
        wait_for_sessions(listener.directory(), 0).await;
    }

    #[tokio::test]
    async fn test_bad_client_does_not_affect_others() {
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);
        let mut good = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut bad = TcpStream::connect(listener.local_addr()).await.unwrap();
        wait_for_sessions(listener.directory(), 2).await;

        bad.write_all(b"BADPROTO\n\n").await.unwrap();
        assert_closed_by_server(&mut bad).await;
        wait_for_sessions(listener.directory(), 1).await;

        let expected = b"PROTO1\nsize=2\ntype=string_type\n\nok";
        let reply = request(&mut good, b"PROTO1\nsize=2\n\nok", expected.len()).await;
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_oversized_header_closes_session() {
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        let mut flood = b"PROTO1\n".to_vec();
        flood.extend(std::iter::repeat(b'k').take(4096));
        // The server may reset before the whole flood is written.
        let _ = client.write_all(&flood).await;

        assert_closed_by_server(&mut client).await;
        wait_for_sessions(listener.directory(), 0).await;
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir);

        let config = test_config(first.local_addr().port(), dir.path());
        match Listener::open(&config, HandlerRegistry::with_defaults(dir.path())) {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr.port(), config.port),
            Err(other) => panic!("unexpected: {other}"),
            Ok(_) => panic!("second bind on the same port should fail"),
        }
    }

    #[test]
    fn test_invalid_host() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(0, dir.path());
        config.host = "not-an-ip".to_string();
        assert!(matches!(
            Listener::open(&config, HandlerRegistry::with_defaults(dir.path())),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_keeps_sessions() {
        let dir = TempDir::new().unwrap();
        let listener = open(&dir);
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        wait_for_sessions(listener.directory(), 1).await;

        listener.close();
        listener.close();

        let expected = b"PROTO1\nsize=3\ntype=string_type\n\nyes";
        let reply = request(&mut client, b"PROTO1\nsize=3\n\nyes", expected.len()).await;
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sessions() {
        let dir = TempDir::new().unwrap();
        let mut listener = open(&dir);
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(b"PROTO1\nsize=").await.unwrap();
        wait_for_sessions(listener.directory(), 1).await;

        let directory = Arc::clone(listener.directory());
        listener.shutdown();
        listener.shutdown();

        assert!(directory.is_empty());
        assert_closed_by_server(&mut client).await;
    }
}
