use crate::connection::ResilientConnection;
use crate::consumers::handler::{Handler, HandlerFactory, HandlerRegistry};
use crate::consumers::{Message, MessageProxy};
use crate::error::DispatchError;
use crate::sync::WaitGroup;
use deadpool::unmanaged::Pool;
use futures_util::{FutureExt, StreamExt};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The pool of handler instances shared by the dispatch tasks of a consumer.
pub(crate) type HandlerPool = Pool<Box<dyn Handler>>;

/// Declarative description of a consumer: which queue to consume from, with which handler
/// and how many messages to process concurrently.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// The queue to consume from.
    pub queue: String,
    /// The identifier of the handler, as registered in the [`HandlerRegistry`].
    pub consumer: String,
    /// The maximum number of unacknowledged deliveries the broker pushes to this consumer.
    #[serde(
        default = "default_prefetch_count",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub prefetch_count: u16,
    /// The number of handler instances, i.e. how many messages are processed concurrently.
    #[serde(
        default = "default_consumer_count",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub consumer_count: usize,
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_consumer_count() -> usize {
    1
}

impl ConsumerSpec {
    /// A consumer with a single handler instance and a prefetch count of 1.
    pub fn new(queue: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer: consumer.into(),
            prefetch_count: default_prefetch_count(),
            consumer_count: default_consumer_count(),
        }
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    #[must_use]
    pub fn with_consumer_count(mut self, consumer_count: usize) -> Self {
        self.consumer_count = consumer_count;
        self
    }

    pub(crate) fn check(&self) -> Result<(), DispatchError> {
        if self.prefetch_count == 0 {
            return Err(DispatchError::Configuration(format!(
                "the prefetch count of the consumer on `{}` must be at least 1",
                self.queue
            )));
        }
        if self.consumer_count == 0 {
            return Err(DispatchError::Configuration(format!(
                "the consumer count of the consumer on `{}` must be at least 1",
                self.queue
            )));
        }
        Ok(())
    }
}

/// Consumes a queue and dispatches its messages to a pool of handler instances.
///
/// Every run opens two dedicated channels: one to consume from the queue, whose prefetch count
/// limits how many unacknowledged deliveries the broker pushes to us, and one shared by the
/// handlers to publish messages.
///
/// Deliveries are never processed inline: each one is handed to its own task, which waits
/// for a free handler instance. At most `consumer_count` messages are therefore processed
/// concurrently, while the consume loop keeps pulling buffered deliveries from the channel.
pub struct Consumer {
    spec: ConsumerSpec,
    factory: HandlerFactory,
    connection_label: String,
}

impl Consumer {
    /// Resolve the handler of `spec` against `registry`.
    ///
    /// Fails with [`DispatchError::HandlerLoad`] if the handler identifier cannot be resolved.
    pub fn new(
        spec: ConsumerSpec,
        registry: &HandlerRegistry,
        connection_label: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        spec.check()?;
        info!("Loading consumer {}", spec.consumer);
        let factory = registry.resolve(&spec.consumer)?;
        Ok(Self {
            spec,
            factory,
            connection_label: connection_label.into(),
        })
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    /// A unique tag for a consumer registration, to tell apart consumers sharing the same queue.
    pub fn consumer_tag(&self) -> String {
        format!(
            "{}-[{}]-{}",
            self.connection_label,
            self.spec.consumer,
            Uuid::new_v4().simple()
        )
    }

    fn build_pool(&self) -> HandlerPool {
        let handlers: Vec<Box<dyn Handler>> = (0..self.spec.consumer_count)
            .map(|_| (self.factory)())
            .collect();
        Pool::from(handlers)
    }

    /// Consume messages until `shutdown` resolves or the delivery stream ends.
    ///
    /// On shutdown the consumer registration is cancelled, so that the broker stops pushing
    /// new deliveries. Messages already handed to a dispatch task keep being processed:
    /// use the connection's [`WaitGroup`] to wait for them.
    #[tracing::instrument(
        skip_all,
        name = "consumer_run",
        fields(queue = %self.spec.queue, consumer = %self.spec.consumer)
    )]
    pub async fn run_until_shutdown(
        &self,
        connection: &ResilientConnection,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), DispatchError> {
        let publish_channel = connection.open_channel().await?;
        let consume_channel = connection.open_channel().await?;
        consume_channel
            .set_prefetch(self.spec.prefetch_count)
            .await
            .map_err(DispatchError::channel("set the prefetch count"))?;

        let pool = self.build_pool();
        info!(
            "{} instances of {} created",
            self.spec.consumer_count, self.spec.consumer
        );

        let consumer_tag = self.consumer_tag();
        let mut deliveries = consume_channel
            .consume(&self.spec.queue, &consumer_tag)
            .await
            .map_err(DispatchError::channel("start consuming"))?;
        let wait_group = connection.wait_group().clone();
        // Marks this run as over on every exit path, including being dropped mid-await.
        let run = RunGuard::default();

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Prefer shutting down over pulling more deliveries.
                biased;

                _ = &mut shutdown => {
                    info!("Consumer {} received shutdown event", consumer_tag);
                    if let Err(e) = consume_channel.cancel(&consumer_tag).await {
                        warn!(error = ?e, "Failed to cancel consumer {}", consumer_tag);
                    }
                    return Ok(());
                }

                delivery = deliveries.next() => {
                    match delivery {
                        None => {
                            info!("Delivery stream of consumer {} closed", consumer_tag);
                            return Ok(());
                        }
                        Some(Err(source)) => {
                            error!("Consumer error: {}", source);
                            return Err(DispatchError::Consume { consumer_tag, source });
                        }
                        Some(Ok(delivery)) => {
                            let (message, acker) = delivery.into_parts();
                            debug!(
                                "A message was received with delivery tag: {}",
                                message.delivery_tag
                            );
                            let proxy = MessageProxy::new(
                                message.delivery_tag,
                                acker,
                                publish_channel.clone(),
                            );
                            // Processing happens in its own task: a slow message must not hold
                            // back the other handler instances in the pool.
                            tokio::spawn(process(
                                pool.clone(),
                                proxy,
                                message,
                                wait_group.clone(),
                                run.stopped(),
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Set once the consume loop that received a delivery has exited.
///
/// Its deliveries belong to a channel that is being torn down: the broker requeues whatever
/// is left unacknowledged, so they must not reach a handler anymore.
#[derive(Clone, Default)]
pub(crate) struct Stopped(Arc<AtomicBool>);

impl Stopped {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RunGuard(Stopped);

impl RunGuard {
    fn stopped(&self) -> Stopped {
        self.0.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// One unit of work in the wait group, released when dropped, unwinding included.
struct InFlight(WaitGroup);

impl InFlight {
    fn enter(wait_group: WaitGroup) -> Self {
        wait_group.add(1);
        Self(wait_group)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Err(e) = self.0.done() {
            error!("{}", e);
        }
    }
}

/// Process a single message: borrow a handler instance, run it and settle the message.
#[tracing::instrument(
    name = "process_message",
    skip_all,
    fields(delivery_tag = message.delivery_tag),
    level = "debug"
)]
pub(crate) async fn process(
    pool: HandlerPool,
    proxy: MessageProxy,
    message: Message,
    wait_group: WaitGroup,
    stopped: Stopped,
) {
    // Blocks until an instance is free.
    let mut handler = match pool.get().await {
        Ok(handler) => handler,
        Err(e) => {
            error!("No handler instance available: {}", e);
            reject(&proxy).await;
            return;
        }
    };
    let in_flight = InFlight::enter(wait_group);

    // Checked after entering the wait group: either the drain sees this task, or this task
    // sees that its consumer has stopped.
    if stopped.is_set() {
        warn!(
            "Consumer stopped before message {} reached a handler, returning it",
            message.delivery_tag
        );
        reject(&proxy).await;
        drop(handler);
        drop(in_flight);
        return;
    }

    let outcome = AssertUnwindSafe(handler.consume(&proxy, &message))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(&*panic)
            ))
        });

    match outcome {
        Ok(()) => {
            if !proxy.has_responded() {
                if let Err(e) = proxy.acknowledge().await {
                    error!("Acknowledgement Error: {}", e);
                }
            }
        }
        Err(e) => {
            error!(error = ?e, "Failed to consume message {}", message.delivery_tag);
            if let Err(panic) = AssertUnwindSafe(handler.shutdown(Some(&e)))
                .catch_unwind()
                .await
            {
                error!(
                    "Handler panicked while shutting down: {}",
                    panic_message(&*panic)
                );
            }
            if !proxy.has_responded() {
                reject(&proxy).await;
            }
        }
    }

    // Back to the pool, then out of the wait group.
    drop(handler);
    drop(in_flight);
}

async fn reject(proxy: &MessageProxy) {
    if let Err(e) = proxy.reject(true).await {
        error!("Rejection Error: {}. Aborting.", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
