//! # tutoria-server
//!
//! Axum HTTP + `WebSocket` server for tutoring sessions.
//!
//! - `WebSocket` gateway: admission, heartbeat, ordered message dispatch
//! - Dialogue synchronization with background tutor answers
//! - Sandbox control and the reverse proxy in front of running workers
//! - Startup reconciliation of stored session state

#![deny(unsafe_code)]

pub mod connection;
pub mod control;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod i18n;
pub mod log_sink;
pub mod proxy;
pub mod publish;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod sync;
pub mod tasks;

pub use error::SessionError;
pub use gateway::Gateway;
pub use reconcile::reconcile_sessions;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
