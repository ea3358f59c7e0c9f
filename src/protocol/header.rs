//! Header framing.
//!
//! ```text
//! PROTO1\n
//! key=value\n
//! ...\n
//! \n
//! <body of exactly `size` bytes>
//! ```

use bytes::BytesMut;
use std::collections::BTreeMap;

use crate::error::ProtocolError;

/// First line of every header.
pub const PROTOCOL_IDENTIFIER: &str = "PROTO1";

pub const LINE_SEPARATOR: char = '\n';
pub const PAIR_SEPARATOR: char = '=';

/// Blank line ending the header: two consecutive line separators.
pub const SENTINEL: &[u8] = b"\n\n";

/// Property carrying the body length.
pub const SIZE_KEY: &str = "size";
/// Property carrying the payload kind tag.
pub const TYPE_KEY: &str = "type";

/// Header properties. Keys are unique; the last write wins.
pub type Properties = BTreeMap<String, String>;

/// Find the end of the header in `buffer`.
///
/// Returns the header length including the sentinel, or `None` if the
/// sentinel has not arrived yet.
pub fn find_sentinel(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(SENTINEL.len())
        .position(|w| w == SENTINEL)
        .map(|pos| pos + SENTINEL.len())
}

/// Parse a complete header (identifier line through the sentinel).
///
/// Blank lines are skipped, and a repeated key overwrites the earlier value.
/// Unknown keys are kept for the dispatch layer.
pub fn parse(raw: &[u8]) -> Result<Properties, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    let mut lines = text.split(LINE_SEPARATOR);

    if lines.next() != Some(PROTOCOL_IDENTIFIER) {
        return Err(ProtocolError::BadIdentifier);
    }

    let mut properties = Properties::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(PAIR_SEPARATOR)
            .ok_or_else(|| ProtocolError::MalformedProperty(line.to_string()))?;
        properties.insert(key.to_string(), value.to_string());
    }

    Ok(properties)
}

/// Serialize a header into `out`: identifier, one line per property, blank line.
pub fn prepare(properties: &Properties, out: &mut BytesMut) {
    out.extend_from_slice(PROTOCOL_IDENTIFIER.as_bytes());
    out.extend_from_slice(&[LINE_SEPARATOR as u8]);
    for (key, value) in properties {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&[PAIR_SEPARATOR as u8]);
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(&[LINE_SEPARATOR as u8]);
    }
    out.extend_from_slice(&[LINE_SEPARATOR as u8]);
}

/// Declared body length. Absent or unparseable means zero.
pub fn declared_size(properties: &Properties) -> usize {
    properties
        .get(SIZE_KEY)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}
