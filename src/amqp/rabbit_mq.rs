//! [`lapin`]-backed implementations of the transport traits.
//!
//! [`lapin`]: https://docs.rs/crate/lapin
use crate::amqp::transport::{
    Acker, BrokerChannel, BrokerConnection, DeliveryStream, QueueDeclaration,
};
use crate::consumers::Delivery;
use amq_protocol_types::FieldTable;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

const REPLY_SUCCESS: u16 = 200;

/// A connection to a RabbitMq broker.
///
/// `lapin` notifies connection failures through a callback: we record them in a watch channel
/// so that [`BrokerConnection::closed`] can be awaited by whoever supervises the link.
pub struct Connection {
    inner: lapin::Connection,
    lost: Arc<watch::Sender<bool>>,
}

impl Connection {
    pub(crate) fn new(inner: lapin::Connection) -> Self {
        let lost = Arc::new(watch::channel(false).0);
        // Register a callback to log connection errors and flag the link as lost.
        let on_error = Arc::clone(&lost);
        inner.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            on_error.send_replace(true);
        });
        Self { inner, lost }
    }

    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl BrokerConnection for Connection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(Channel(channel)))
    }

    async fn closed(&self) {
        let mut lost = self.lost.subscribe();
        loop {
            if *lost.borrow_and_update() || !self.inner.status().connected() {
                return;
            }
            if lost.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_connected(&self) -> bool {
        !*self.lost.borrow() && self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

/// A RabbitMq channel.
#[derive(Clone)]
pub struct Channel(lapin::Channel);

impl Channel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.0
    }
}

#[async_trait::async_trait]
impl BrokerChannel for Channel {
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self, arguments))]
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclaration, anyhow::Error> {
        let queue = self.0.queue_declare(name, options, arguments).await?;
        Ok(QueueDeclaration {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let options = QueueBindOptions { nowait: false };
        self.0
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Delivery::from)
                    .map_err(anyhow::Error::from)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        self.0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.0.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Acker for lapin::acker::Acker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        lapin::acker::Acker::ack(self, BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        lapin::acker::Acker::reject(self, BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(Into::into)
    }
}
