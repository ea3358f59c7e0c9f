//! Payload handlers.
//!
//! Once a session has read a complete request (header plus body), it hands
//! the request to the handler registered for the request's payload kind. A
//! handler answers with follow-up actions, which are appended to the back of
//! the session's queue in order.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use super::action::{Action, PayloadKind};
use super::header::{Properties, SIZE_KEY, TYPE_KEY};
use crate::error::{HandlerError, ProtocolError};

/// Property naming the resource a file payload refers to.
pub const NAME_KEY: &str = "name";
/// Property set on file-store acknowledgements.
pub const STATUS_KEY: &str = "status";

/// A fully framed request.
#[derive(Debug, Clone)]
pub struct Request {
    pub properties: Properties,
    pub kind: PayloadKind,
    pub body: Bytes,
}

impl Request {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Future returned by a handler: the actions to enqueue next.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<Action>, HandlerError>> + Send>>;

/// A pluggable payload handler.
pub trait PayloadHandler: Send + Sync {
    fn handle(&self, request: Request) -> HandlerFuture;
}

/// One handler per concrete payload kind.
#[derive(Clone)]
pub struct HandlerRegistry {
    string: Arc<dyn PayloadHandler>,
    file: Arc<dyn PayloadHandler>,
}

impl HandlerRegistry {
    pub fn new(string: Arc<dyn PayloadHandler>, file: Arc<dyn PayloadHandler>) -> Self {
        Self { string, file }
    }

    /// Echo string payloads and store file payloads under `file_root`.
    pub fn with_defaults(file_root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(StringEcho), Arc::new(FileStore::new(file_root)))
    }

    /// Look up the handler for `kind`. `Unknown` is a protocol error.
    pub fn get(&self, kind: PayloadKind) -> Result<&Arc<dyn PayloadHandler>, ProtocolError> {
        match kind {
            PayloadKind::String => Ok(&self.string),
            PayloadKind::File => Ok(&self.file),
            PayloadKind::Unknown => Err(ProtocolError::UnknownPayloadKind(String::new())),
        }
    }
}

/// Replies with the same text and keeps reading.
pub struct StringEcho;

impl PayloadHandler for StringEcho {
    fn handle(&self, request: Request) -> HandlerFuture {
        Box::pin(async move {
            let text =
                String::from_utf8(request.body.to_vec()).map_err(|_| HandlerError::InvalidText)?;

            let mut reply = Action::write_string(text);
            for (key, value) in request.properties {
                if key != SIZE_KEY && key != TYPE_KEY {
                    reply.put_property(key, value);
                }
            }
            Ok(vec![reply, Action::read()])
        })
    }
}

/// Stores uploaded files under a root directory and serves them back.
///
/// A request with a body stores it as `name`; a request with an empty body
/// asks for `name` to be streamed back.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PayloadHandler for FileStore {
    fn handle(&self, request: Request) -> HandlerFuture {
        let root = self.root.clone();
        Box::pin(async move {
            let name = request
                .property(NAME_KEY)
                .ok_or(HandlerError::MissingProperty(NAME_KEY))?
                .to_string();
            let path = resolve_name(&root, &name)?;

            if request.body.is_empty() {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => {}
                    Ok(_) => return Err(HandlerError::NotFound(path)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(HandlerError::NotFound(path))
                    }
                    Err(e) => return Err(e.into()),
                }
                let reply = Action::write_file(path).with_property(NAME_KEY, name);
                return Ok(vec![reply, Action::read()]);
            }

            tokio::fs::create_dir_all(&root).await?;
            tokio::fs::write(&path, &request.body).await?;
            debug!(path = %path.display(), bytes = request.body.len(), "Stored file payload");

            let ack = Action::write_string("")
                .with_property(NAME_KEY, name)
                .with_property(STATUS_KEY, "stored");
            Ok(vec![ack, Action::read()])
        })
    }
}

/// Resolve `name` to a path directly under `root`.
///
/// Only a single plain path component is accepted.
fn resolve_name(root: &Path, name: &str) -> Result<PathBuf, HandlerError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => Ok(root.join(part)),
        _ => Err(HandlerError::InvalidName(name.to_string())),
    }
}
