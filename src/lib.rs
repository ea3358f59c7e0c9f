//! service-server: a framed request/response server.
//!
//! Clients speak a line-oriented header protocol over TCP. Each request
//! carries a typed payload that is routed to a pluggable handler, and
//! handlers answer by queueing further reads and writes on the session.

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
