//! AMQP transport backed by lapin
//!
//! One connection, one channel. Requests are published to the resolved
//! request queue with the correlation id in the message properties; the
//! reply consumer forwards raw delivery payloads into the bridge's inbound
//! channel and acks each delivery.

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use async_trait::async_trait;

use usm_common::{CorrelationId, Result, UsmError};

use super::{Destination, MessageTransport};

pub struct AmqpTransport {
    // dropping the connection tears down the channel, keep it alive
    _connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| UsmError::transport(format!("AMQP connect failed: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| UsmError::transport(format!("AMQP channel open failed: {}", e)))?;

        info!(uri = %uri, "AMQP transport connected");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    /// Start the long-lived reply consumer, forwarding delivery payloads
    /// into `inbound_tx` until shutdown or the broker closes the stream
    pub async fn consume_replies(
        &self,
        reply_queue: &Destination,
        inbound_tx: mpsc::Sender<Vec<u8>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let mut consumer = self
            .channel
            .basic_consume(
                reply_queue.name(),
                "usm-bridge-replies",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| UsmError::transport(format!("AMQP consume failed: {}", e)))?;

        let queue = reply_queue.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = consumer.next() => {
                        let delivery = match delivery {
                            Some(Ok(d)) => d,
                            Some(Err(e)) => {
                                warn!(queue = %queue, error = %e, "reply delivery failed");
                                continue;
                            }
                            None => {
                                error!(queue = %queue, "reply stream closed by broker");
                                break;
                            }
                        };

                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(queue = %queue, error = %e, "failed to ack reply");
                        }
                        if inbound_tx.send(delivery.data).await.is_err() {
                            info!(queue = %queue, "inbound channel closed, stopping reply consumer");
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(queue = %queue, "reply consumer shutting down");
                        break;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl MessageTransport for AmqpTransport {
    async fn lookup(&self, name: &str) -> Result<Destination> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| UsmError::transport(format!("queue lookup for {} failed: {}", name, e)))?;
        Ok(Destination::new(name))
    }

    async fn send(
        &self,
        to: &Destination,
        payload: Vec<u8>,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let properties =
            BasicProperties::default().with_correlation_id(correlation_id.to_string().into());

        self.channel
            .basic_publish(
                "",
                to.name(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| UsmError::transport(format!("publish to {} failed: {}", to, e)))?
            .await
            .map_err(|e| UsmError::transport(format!("publish to {} not confirmed: {}", to, e)))?;

        Ok(())
    }
}
