//! jobdeck: a session-scoped job orchestration server.
//!
//! Each browser session owns a config, a target list, and a directory of
//! artifacts. A job runs an external worker for the session and streams
//! its output back as server-sent events.

pub mod api;
pub mod artifacts;
pub mod config;
pub mod gc;
pub mod job;
pub mod session;
pub mod stream;
