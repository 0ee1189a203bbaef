//! The narrow set of broker operations the dispatcher relies on.
//!
//! The orchestration engine never touches `lapin` types directly: it talks to a [`Transport`],
//! the [`BrokerConnection`]s it produces and the [`BrokerChannel`]s opened on top of them.
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) provides the `lapin`-backed
//! implementation used in production.
use crate::consumers::Delivery;
use amq_protocol_types::FieldTable;
use futures_util::stream::BoxStream;
use lapin::{options::QueueDeclareOptions, BasicProperties};
use std::sync::Arc;

/// A stream of deliveries pushed by the broker on a consume channel.
///
/// The stream ends (or yields an error) when the channel or the underlying connection is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// `Transport` knows how to establish a physical link with the broker.
///
/// It is invoked once at startup and then again every time the link has to be re-established.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, anyhow::Error>;
}

/// A physical link to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a new logical channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error>;

    /// Resolves once the link has been lost.
    ///
    /// It must resolve immediately if the link is already down.
    async fn closed(&self);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// The outcome of a queue declaration, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A logical channel, used either to consume from a queue or to publish messages.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Limit the number of unacknowledged deliveries the broker pushes on this channel.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclaration, anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Register a consumer on `queue`, identified by `consumer_tag`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error>;

    /// Cancel a consumer registration previously created with [`BrokerChannel::consume`].
    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Settles a single delivery with the broker.
///
/// Acking or rejecting twice is a protocol violation: callers are expected to guarantee that
/// at most one of the two methods is invoked for a given delivery.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error>;
}
