use crate::amqp::transport::{Acker, BrokerChannel};
use crate::amqp::BasicProperties;
use amq_protocol_types::DeliveryTag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error returned when settling a message through a [`MessageProxy`].
#[derive(thiserror::Error, Debug)]
pub enum ResponseError {
    /// The message has already been acknowledged or rejected.
    #[error("Message {delivery_tag} has already been responded to")]
    AlreadyResponded { delivery_tag: DeliveryTag },
    /// The broker operation itself failed.
    #[error("Failed to {operation} message {delivery_tag}")]
    Broker {
        operation: &'static str,
        delivery_tag: DeliveryTag,
        #[source]
        source: anyhow::Error,
    },
}

/// The handle a [`Handler`](super::Handler) uses to respond to a message and to publish new ones.
///
/// # Responses
///
/// A message can be terminally resolved only once: the first call to
/// [`acknowledge`](MessageProxy::acknowledge) or [`reject`](MessageProxy::reject) wins,
/// every following call fails with [`ResponseError::AlreadyResponded`] and never reaches the
/// broker.
///
/// Handlers are not required to respond: if `consume` returns without responding, the message
/// is acknowledged on its behalf; if it fails, the message is rejected and requeued.
///
/// # Publishing
///
/// [`publish`](MessageProxy::publish) goes through a channel dedicated to publishing, shared by
/// all the handler instances of a consumer, and can be used any number of times.
pub struct MessageProxy {
    delivery_tag: DeliveryTag,
    acker: Box<dyn Acker>,
    publish_channel: Arc<dyn BrokerChannel>,
    responded: AtomicBool,
}

impl MessageProxy {
    pub fn new(
        delivery_tag: DeliveryTag,
        acker: Box<dyn Acker>,
        publish_channel: Arc<dyn BrokerChannel>,
    ) -> Self {
        Self {
            delivery_tag,
            acker,
            publish_channel,
            responded: AtomicBool::new(false),
        }
    }

    /// Whether the message has already been acknowledged or rejected.
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    /// Acknowledge the message: the broker will discard it.
    pub async fn acknowledge(&self) -> Result<(), ResponseError> {
        self.claim_response()?;
        self.acker
            .ack()
            .await
            .map_err(|source| ResponseError::Broker {
                operation: "acknowledge",
                delivery_tag: self.delivery_tag,
                source,
            })
    }

    /// Reject the message.
    ///
    /// With `requeue` set the broker redelivers the message, otherwise it is dead-lettered
    /// (if the queue has a dead letter exchange) or discarded.
    pub async fn reject(&self, requeue: bool) -> Result<(), ResponseError> {
        self.claim_response()?;
        self.acker
            .reject(requeue)
            .await
            .map_err(|source| ResponseError::Broker {
                operation: "reject",
                delivery_tag: self.delivery_tag,
                source,
            })
    }

    /// Publish a message on `exchange` with `routing_key`.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        self.publish_channel
            .publish(exchange, routing_key, payload, properties)
            .await
    }

    // Flip the flag before talking to the broker: a failed ack/reject still counts as the
    // response, the delivery tag must never be settled twice on the wire.
    fn claim_response(&self) -> Result<(), ResponseError> {
        self.responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| ResponseError::AlreadyResponded {
                delivery_tag: self.delivery_tag,
            })
    }
}
