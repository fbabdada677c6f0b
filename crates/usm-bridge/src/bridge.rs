//! Message Bridge - correlation-tagged producer and awaiting consumer
//!
//! `publish` emits a request and returns its correlation id immediately.
//! `request` registers a reply slot first, then publishes, then parks the
//! caller in the registry until the reply dispatch task completes the slot
//! or the timeout fires. Registration happens strictly before publish, so a
//! reply can never arrive without a waiter to match it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use usm_common::{
    CorrelationId, MessageEnvelope, ReplyBody, ReplyEnvelope, RequestBody, Result, UsmError,
};

use crate::registry::CorrelationRegistry;
use crate::transport::{Destination, MessageTransport};

pub struct MessageBridge {
    transport: Arc<dyn MessageTransport>,
    registry: Arc<CorrelationRegistry>,
    request_destination: Destination,
}

impl MessageBridge {
    pub fn new(transport: Arc<dyn MessageTransport>, request_destination: Destination) -> Self {
        Self {
            transport,
            registry: Arc::new(CorrelationRegistry::new()),
            request_destination,
        }
    }

    pub fn registry(&self) -> Arc<CorrelationRegistry> {
        self.registry.clone()
    }

    /// Producer side: emit one request and return its correlation id
    /// without waiting for anything to come back
    pub async fn publish(&self, body: RequestBody) -> Result<CorrelationId> {
        let envelope = MessageEnvelope::new(body);
        let id = envelope.correlation_id;
        let payload = serde_json::to_vec(&envelope)?;

        self.transport
            .send(&self.request_destination, payload, id)
            .await?;
        debug!(correlation_id = %id, destination = %self.request_destination, "request published");
        Ok(id)
    }

    /// Consumer side: publish and block until the matching reply arrives or
    /// `timeout` elapses. A publish failure deregisters the slot and
    /// surfaces as a transport error.
    pub async fn request(&self, body: RequestBody, timeout: Duration) -> Result<ReplyBody> {
        let envelope = MessageEnvelope::new(body);
        let id = envelope.correlation_id;
        let payload = serde_json::to_vec(&envelope)?;

        let pending = self.registry.register(id)?;
        if let Err(e) = self
            .transport
            .send(&self.request_destination, payload, id)
            .await
        {
            self.registry.deregister(id);
            return Err(e);
        }
        debug!(correlation_id = %id, "request published, awaiting reply");

        let reply = self.registry.await_reply(pending, timeout).await?;
        Ok(reply.body)
    }

    /// Spawn the single process-wide reply dispatch task. It drains raw
    /// payloads from `inbound_rx`, unmarshals them and completes the
    /// matching slot; delivery is fire-and-forget, a slow waiter never
    /// stalls the loop.
    pub fn spawn_reply_dispatcher(
        &self,
        mut inbound_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();

        tokio::spawn(async move {
            info!("reply dispatcher started");
            loop {
                tokio::select! {
                    inbound = inbound_rx.recv() => {
                        let payload = match inbound {
                            Some(p) => p,
                            None => {
                                info!("inbound channel closed, reply dispatcher exiting");
                                break;
                            }
                        };

                        let reply: ReplyEnvelope = match serde_json::from_slice(&payload) {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(error = %e, "dropping undecodable reply payload");
                                continue;
                            }
                        };

                        let id = reply.correlation_id;
                        if registry.complete(reply) {
                            debug!(correlation_id = %id, "reply delivered to waiter");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("reply dispatcher shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryTransport, OutboundMessage};
    use usm_common::{OperationAck, ResponseBody};

    struct Harness {
        bridge: MessageBridge,
        outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
        inbound_tx: mpsc::Sender<Vec<u8>>,
        shutdown_tx: broadcast::Sender<()>,
        dispatcher: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (transport, outbound_rx) = MemoryTransport::new();
        let bridge = MessageBridge::new(Arc::new(transport), Destination::new("USM.requests"));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatcher = bridge.spawn_reply_dispatcher(inbound_rx, shutdown_tx.subscribe());
        Harness {
            bridge,
            outbound_rx,
            inbound_tx,
            shutdown_tx,
            dispatcher,
        }
    }

    fn probe_request() -> RequestBody {
        RequestBody::GetDeploymentDescriptor {
            application_name: "reporting".to_string(),
        }
    }

    fn ack_reply(id: CorrelationId) -> Vec<u8> {
        serde_json::to_vec(&ReplyEnvelope {
            correlation_id: id,
            body: ReplyBody::Success(ResponseBody::DeployAck(OperationAck::ok())),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn publish_returns_id_and_emits_one_message() {
        let mut h = harness();
        let id = h.bridge.publish(probe_request()).await.unwrap();

        let outbound = h.outbound_rx.recv().await.unwrap();
        assert_eq!(outbound.correlation_id, id);
        assert_eq!(outbound.destination.name(), "USM.requests");

        let envelope: MessageEnvelope = serde_json::from_slice(&outbound.payload).unwrap();
        assert_eq!(envelope.correlation_id, id);
    }

    #[tokio::test]
    async fn request_resolves_when_matching_reply_arrives() {
        let mut h = harness();

        let responder = {
            let inbound_tx = h.inbound_tx.clone();
            let outbound = h.outbound_rx.recv();
            async move {
                let msg = outbound.await.unwrap();
                inbound_tx.send(ack_reply(msg.correlation_id)).await.unwrap();
            }
        };

        let (reply, _) = tokio::join!(
            h.bridge.request(probe_request(), Duration::from_secs(5)),
            responder
        );
        match reply.unwrap() {
            ReplyBody::Success(ResponseBody::DeployAck(ack)) => assert!(ack.is_ok()),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_when_reply_targets_other_id() {
        let mut h = harness();

        let responder = {
            let inbound_tx = h.inbound_tx.clone();
            let outbound = h.outbound_rx.recv();
            async move {
                // reply to a correlation id nobody registered
                let _ = outbound.await.unwrap();
                inbound_tx.send(ack_reply(CorrelationId::new())).await.unwrap();
            }
        };

        let (result, _) = tokio::join!(
            h.bridge.request(probe_request(), Duration::from_millis(200)),
            responder
        );
        assert!(matches!(result, Err(UsmError::Timeout { .. })));
        assert_eq!(h.bridge.registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_deregisters_the_slot() {
        let mut h = harness();
        // closing the outbound side makes every send fail
        h.outbound_rx.close();

        let result = h.bridge.request(probe_request(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(UsmError::Transport(_))));
        assert_eq!(h.bridge.registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn dispatcher_stops_on_shutdown_signal() {
        let h = harness();
        h.shutdown_tx.send(()).unwrap();
        h.dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn dispatcher_survives_undecodable_payloads() {
        let mut h = harness();
        h.inbound_tx.send(b"not json".to_vec()).await.unwrap();

        let responder = {
            let inbound_tx = h.inbound_tx.clone();
            let outbound = h.outbound_rx.recv();
            async move {
                let msg = outbound.await.unwrap();
                inbound_tx.send(ack_reply(msg.correlation_id)).await.unwrap();
            }
        };

        let (reply, _) = tokio::join!(
            h.bridge.request(probe_request(), Duration::from_secs(5)),
            responder
        );
        assert!(reply.is_ok());
    }
}
