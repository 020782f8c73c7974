//! # solo-server
//!
//! Single-active-session gateway built on Axum.
//!
//! - Session registry: at most one live connection per user, with an epoch
//!   that orders every change
//! - Invalidation dispatcher: `force_logout` notice, grace period, close 4000
//! - Keepalive monitor: evicts sessions that stop heartbeating
//! - Session query service: display-safe active-session listing
//! - HTTP endpoints under `/api`, `/metrics`, and the `/ws/{user_id}` gateway
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod http;
pub mod keepalive;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use gateway::SessionGateway;
pub use server::SoloServer;
