//! Queued units of protocol work.
//!
//! An `Action` is either an inbound request waiting to be read or an
//! outbound response waiting to be written. The variant set is closed, so
//! the session dispatches with a plain `match`.

use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::header::{self, Properties, SIZE_KEY, TYPE_KEY};
use crate::error::ProtocolError;

/// Direction of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Payload kind, carried on the wire in the `type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Not yet resolved. Never valid once a header has been parsed.
    Unknown,
    String,
    File,
}

impl PayloadKind {
    /// Wire tag for this kind.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            PayloadKind::Unknown => None,
            PayloadKind::String => Some("string_type"),
            PayloadKind::File => Some("file_type"),
        }
    }

    /// Map a wire tag to a kind. Unrecognised tags map to `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "string_type" => PayloadKind::String,
            "file_type" => PayloadKind::File,
            _ => PayloadKind::Unknown,
        }
    }
}

impl FromStr for PayloadKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match PayloadKind::from_tag(s) {
            PayloadKind::Unknown => Err(ProtocolError::UnknownPayloadKind(s.to_string())),
            kind => Ok(kind),
        }
    }
}

/// The closed set of action variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Read the next request; the payload kind is unresolved until its header arrives.
    Read,
    /// Send a text payload.
    WriteString(String),
    /// Stream the contents of a file.
    WriteFile(PathBuf),
}

/// One unit of protocol work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    kind: ActionKind,
    payload_kind: PayloadKind,
    properties: Properties,
    size: usize,
}

impl Action {
    /// A pending read of the next request.
    pub fn read() -> Self {
        Self {
            kind: ActionKind::Read,
            payload_kind: PayloadKind::Unknown,
            properties: Properties::new(),
            size: 0,
        }
    }

    /// A response carrying `value` as a string payload.
    pub fn write_string(value: impl Into<String>) -> Self {
        let value = value.into();
        let size = value.len();
        let mut action = Self {
            kind: ActionKind::WriteString(value),
            payload_kind: PayloadKind::String,
            properties: Properties::new(),
            size: 0,
        };
        action.set_size(size);
        action.stamp_type();
        action
    }

    /// A response streaming the file at `path`.
    ///
    /// The size is taken from the file's length when the write is prepared.
    pub fn write_file(path: impl Into<PathBuf>) -> Self {
        let mut action = Self {
            kind: ActionKind::WriteFile(path.into()),
            payload_kind: PayloadKind::File,
            properties: Properties::new(),
            size: 0,
        };
        action.stamp_type();
        action
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn mode(&self) -> Mode {
        match self.kind {
            ActionKind::Read => Mode::Read,
            ActionKind::WriteString(_) | ActionKind::WriteFile(_) => Mode::Write,
        }
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload_kind
    }

    /// Length of the body that follows the header.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Set a property. `size` and `type` are owned by the action and cannot
    /// be overridden on write actions.
    pub fn put_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.mode() == Mode::Write && (key == SIZE_KEY || key == TYPE_KEY) {
            return;
        }
        self.properties.insert(key, value.into());
    }

    /// Builder form of [`Action::put_property`].
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_property(key, value);
        self
    }

    pub fn into_properties(self) -> Properties {
        self.properties
    }

    /// Path of a file-backed write.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.kind {
            ActionKind::WriteFile(path) => Some(path),
            _ => None,
        }
    }

    /// Install a freshly parsed header on a read action and derive its
    /// payload kind and body size.
    ///
    /// A request without a `type` property takes `default_kind`.
    pub fn resolve_header(
        &mut self,
        properties: Properties,
        default_kind: PayloadKind,
    ) -> Result<(), ProtocolError> {
        let payload_kind = match properties.get(TYPE_KEY) {
            Some(tag) => PayloadKind::from_tag(tag),
            None => default_kind,
        };
        if payload_kind == PayloadKind::Unknown {
            let tag = properties.get(TYPE_KEY).cloned().unwrap_or_default();
            return Err(ProtocolError::UnknownPayloadKind(tag));
        }

        self.size = header::declared_size(&properties);
        self.payload_kind = payload_kind;
        self.properties = properties;
        Ok(())
    }

    /// Record the body length, keeping the `size` property in step.
    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
        self.properties.insert(SIZE_KEY.to_string(), size.to_string());
    }

    /// Serialize this action's header into `out`.
    pub fn prepare_header(&self, out: &mut BytesMut) {
        header::prepare(&self.properties, out);
    }

    fn stamp_type(&mut self) {
        if let Some(tag) = self.payload_kind.tag() {
            self.properties.insert(TYPE_KEY.to_string(), tag.to_string());
        }
    }
}
