//! Connection runtime.
//!
//! - `Listener`: binds the endpoint and runs the reactor thread
//! - `Session`: per-connection protocol state machine
//! - `SessionDirectory`: registry of live sessions

mod directory;
mod listener;
mod session;

pub use directory::{SessionDirectory, SessionHandle, SessionSignals};
pub use listener::Listener;
pub use session::{Session, SessionContext, SessionSettings, SessionState, Transport};
