//! WebSocket transport: connection handles, `session_update` fan-out, and
//! the per-socket session loop.

pub mod broadcast;
pub mod connection;
pub mod session;
