//! Isolated execution of learner programs.
//!
//! One worker per session code: a child process running the generated program
//! plus a small HTTP/WebSocket listener on a port taken from a reserved range.
//! [`SandboxOrchestrator`] owns the workers; output reaches the session through
//! a [`LogBuffer`] and the injected [`SandboxSink`].

pub mod error;
pub mod events;
pub mod listener;
pub mod log_buffer;
pub mod orchestrator;
pub mod ports;
pub mod routes;
pub mod worker;

pub use error::SandboxError;
pub use events::WorkerEvent;
pub use log_buffer::{LogBuffer, SandboxSink};
pub use orchestrator::{SandboxControl, SandboxOrchestrator};
pub use ports::{PortAllocator, PortLease};
pub use routes::RouteTable;
pub use worker::WorkerConfig;
