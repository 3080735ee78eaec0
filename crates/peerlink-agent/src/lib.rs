//! # Peerlink Agent
//!
//! A single-threaded protocol agent with a worker-thread bridge for
//! blocking platform calls and a `Locator` service for peer discovery and
//! connection redirect.

#![warn(missing_docs)]

/// Single-threaded event loop and its posting handle
pub mod event_loop;

/// Blocking-call bridge: request types, worker pool, native I/O
pub mod asyncreq;

/// Connection endpoints
pub mod channel;

/// Driving byte streams as channels
pub mod connection;

/// Command registry and dispatch
pub mod protocol;

/// Pairing channels into a relay
pub mod proxy;

/// Outbound channel establishment
pub mod connector;

/// Known peers and change notification
pub mod peer;

/// Event fan-out to subscribed channels
pub mod broadcast;

/// The `Locator` service
pub mod locator;

/// Agent configuration
pub mod config;

/// Error types
pub mod error;

/// Agent wiring and accept loop
pub mod agent;

pub use agent::Agent;
pub use asyncreq::{AsyncDispatcher, AsyncOp, AsyncRequest, Completion, OpKind};
pub use channel::Channel;
pub use config::{AgentConfig, ConfigError};
pub use error::AgentError;
pub use event_loop::{EventLoop, LoopHandle};
pub use peer::{PeerRecord, PeerRegistry};
