//! # Peerlink Protocol
//!
//! Value-stream encoding, message model and error codes shared by the
//! peerlink agent and its clients.

#![warn(missing_docs)]

/// Error types for protocol operations
pub mod error;

/// Numeric error codes carried in replies
pub mod codes;

/// Message kinds and parsed message views
pub mod message;

/// Message codec for async byte streams
pub mod codec;

/// Output and argument value streams
pub mod stream;

pub use codec::MessageCodec;
pub use error::ProtocolError;
pub use message::{Message, MessageKind};
pub use stream::{ArgReader, OutputStream};
