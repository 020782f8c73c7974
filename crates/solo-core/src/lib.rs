//! # solo-core
//!
//! Foundation types shared by every solo crate:
//!
//! - **Branded IDs**: `UserId`, `ConnectionId`, `TokenId`
//! - **Errors**: the `SessionError` taxonomy (`ChannelClosed`,
//!   `StaleUnregister`, `RegistryUnavailable`)
//! - **Protocol**: tagged server messages, client message decoding,
//!   invalidation notices and close reasons
//! - **Logging**: global `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{Result, SessionError};
pub use ids::{ConnectionId, TokenId, UserId};
pub use protocol::{ClientMessage, CloseReason, InvalidationNotice, InvalidationReason, ServerMessage};
