//! Wire protocol: header framing, actions, and payload handlers.
//!
//! ## Protocol Format
//!
//! Requests and responses share one framing:
//!
//! ```text
//! PROTO1\n
//! type=string_type\n
//! size=5\n
//! \n
//! hello
//! ```
//!
//! The header is the identifier line followed by `key=value` lines and ends at
//! the first blank line. Exactly `size` body bytes follow; a missing or
//! unparseable `size` means no body. The `type` property selects the payload
//! handler (`string_type` or `file_type`).

pub mod action;
pub mod handler;
pub mod header;

pub use action::{Action, ActionKind, Mode, PayloadKind};
pub use handler::{HandlerRegistry, PayloadHandler, Request};
