//! Error types surfaced by the dispatcher.

/// Failures that can stop (part of) the dispatcher.
///
/// Errors raised by message handlers are deliberately absent: they are contained within the
/// processing of the message that caused them and never reach this type.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// The physical link with the broker could not be established.
    #[error("Failed to connect to the RabbitMq broker")]
    Connection(#[source] anyhow::Error),
    /// An operation on a channel failed (opening it, setting the prefetch, registering a consumer).
    #[error("Failed to {operation} on a RabbitMq channel")]
    Channel {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    /// A queue could not be declared, e.g. it already exists with different settings.
    #[error("Failed to declare queue `{queue}`")]
    Declaration {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    /// A queue could not be bound to an exchange, e.g. the exchange does not exist.
    #[error("Failed to bind queue `{queue}` to exchange `{exchange}` with routing key `{routing_key}`")]
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: anyhow::Error,
    },
    /// A handler identifier could not be resolved to a constructible handler.
    #[error("Failed to load handler `{identifier}`: {reason}")]
    HandlerLoad { identifier: String, reason: String },
    /// The delivery stream of a consumer failed, usually because the link was lost.
    #[error("Consumer `{consumer_tag}` stopped receiving deliveries")]
    Consume {
        consumer_tag: String,
        #[source]
        source: anyhow::Error,
    },
    /// The dispatcher configuration is invalid.
    #[error("Invalid dispatcher configuration: {0}")]
    Configuration(String),
    /// The startup handler failed.
    #[error("The startup handler `{identifier}` failed")]
    Startup {
        identifier: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    pub(crate) fn channel(operation: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Channel { operation, source }
    }
}
