//! In-memory transport for tests and local development
//!
//! Outbound messages land on an unbounded channel whose receiver plays the
//! remote service. Replies are fed straight into the bridge's inbound
//! channel by the test/dev responder.

use async_trait::async_trait;
use tokio::sync::mpsc;

use usm_common::{CorrelationId, Result, UsmError};

use super::{Destination, MessageTransport};

/// One message as it left the bridge
#[derive(Debug)]
pub struct OutboundMessage {
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub correlation_id: CorrelationId,
}

pub struct MemoryTransport {
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl MemoryTransport {
    /// Returns the transport plus the receiver a responder drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (Self { outbound_tx }, outbound_rx)
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn lookup(&self, name: &str) -> Result<Destination> {
        Ok(Destination::new(name))
    }

    async fn send(
        &self,
        to: &Destination,
        payload: Vec<u8>,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        self.outbound_tx
            .send(OutboundMessage {
                destination: to.clone(),
                payload,
                correlation_id,
            })
            .map_err(|_| UsmError::transport("in-memory destination is closed"))
    }
}
