//! Synchronous request/response semantics over an asynchronous message queue
//!
//! This crate provides the bridge between blocking callers and the remote
//! administrative service:
//! - CorrelationRegistry: pending-reply slots keyed by correlation id
//! - MessageBridge: correlation-tagged producer and awaiting consumer,
//!   plus the single reply dispatch task
//! - MessageTransport: the seam to the actual broker (in-memory for tests
//!   and local development, AMQP behind the `amqp` feature)

pub mod bridge;
pub mod registry;
pub mod transport;

pub use bridge::MessageBridge;
pub use registry::{CorrelationRegistry, PendingReply};
pub use transport::{Destination, MessageTransport};

pub use usm_common::{Result, UsmError};
