//! Transport seam between the bridge and the actual broker
//!
//! Destinations are logical queue names; resolving them (and everything
//! behind `send`) belongs to the transport implementation.

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;

use usm_common::{CorrelationId, Result};

/// Resolved logical destination for outbound messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound half of the broker connection. Send failures surface as
/// `UsmError::Transport`; the inbound side feeds the bridge's reply channel
/// and is wired per implementation.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Resolve a logical queue name to a destination
    async fn lookup(&self, name: &str) -> Result<Destination>;

    /// Emit one message; returns as soon as the broker accepted it
    async fn send(
        &self,
        to: &Destination,
        payload: Vec<u8>,
        correlation_id: CorrelationId,
    ) -> Result<()>;
}
