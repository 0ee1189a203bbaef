//! Declaration of the messaging topology - queues and their bindings.
//!
//! Declarations are never passive: queues are created if they are missing, and the broker
//! rejects a declaration that conflicts with the settings of an existing queue. Bindings are
//! applied after their queue has been declared, in the order they are specified. Existing
//! bindings are never removed.
//!
//! ```
//! use amqp_dispatcher::topology::QueueSpec;
//!
//! let orders = QueueSpec::new("orders")
//!     .with_binding("orders-x", "created")
//!     .with_binding("orders-x", "updated");
//! assert!(orders.durable);
//! assert_eq!(orders.bindings.len(), 2);
//! ```
use crate::amqp::options::QueueDeclareOptions;
use crate::amqp::types::{AMQPValue, FieldTable, LongString};
use crate::amqp::{BrokerChannel, QueueDeclaration};
use crate::error::DispatchError;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_option_number_from_string;
use std::collections::BTreeMap;
use tracing::info;

pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const X_MAX_LENGTH: &str = "x-max-length";
pub const X_EXPIRES: &str = "x-expires";
pub const X_MESSAGE_TTL: &str = "x-message-ttl";
pub const X_QUEUE_TYPE: &str = "x-queue-type";

/// Declarative description of a queue and the exchanges it is bound to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueSpec {
    /// The name of the queue.
    pub queue: String,
    /// The queue survives broker restarts. Defaults to `true`.
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub x_dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub x_dead_letter_routing_key: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub x_max_length: Option<i64>,
    /// Queue expiry, in milliseconds.
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub x_expires: Option<i64>,
    /// Message TTL, in milliseconds.
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub x_message_ttl: Option<i64>,
    /// E.g. `classic` or `quorum`.
    #[serde(default)]
    pub x_queue_type: Option<String>,
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

fn default_durable() -> bool {
    true
}

/// Binds a queue to `exchange` using `routing_key`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BindingSpec {
    pub exchange: String,
    pub routing_key: String,
}

impl QueueSpec {
    /// A durable, non-exclusive queue without arguments or bindings.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            x_dead_letter_exchange: None,
            x_dead_letter_routing_key: None,
            x_max_length: None,
            x_expires: None,
            x_message_ttl: None,
            x_queue_type: None,
            bindings: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_binding(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.bindings.push(BindingSpec {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// The optional broker arguments of the queue.
    ///
    /// Options that are unset, empty or zero are left out.
    pub fn arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        let strings = [
            (X_DEAD_LETTER_EXCHANGE, &self.x_dead_letter_exchange),
            (X_DEAD_LETTER_ROUTING_KEY, &self.x_dead_letter_routing_key),
            (X_QUEUE_TYPE, &self.x_queue_type),
        ];
        for (key, value) in strings {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                arguments.insert(key.into(), AMQPValue::LongString(LongString::from(value)));
            }
        }
        let numbers = [
            (X_MAX_LENGTH, self.x_max_length),
            (X_EXPIRES, self.x_expires),
            (X_MESSAGE_TTL, self.x_message_ttl),
        ];
        for (key, value) in numbers {
            if let Some(value) = value.filter(|v| *v != 0) {
                arguments.insert(key.into(), AMQPValue::LongLongInt(value));
            }
        }
        arguments
    }

    fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

/// Declare the queue described by `spec`.
#[tracing::instrument(name = "declare_queue", skip_all, fields(queue = %spec.queue))]
pub async fn declare_queue(
    channel: &dyn BrokerChannel,
    spec: &QueueSpec,
) -> Result<QueueDeclaration, DispatchError> {
    info!("Declaring queue {}", spec.queue);
    let declared = channel
        .declare_queue(&spec.queue, spec.declare_options(), spec.arguments())
        .await
        .map_err(|source| DispatchError::Declaration {
            queue: spec.queue.clone(),
            source,
        })?;
    info!(
        "Queue {} - {} messages and {} consumers connected",
        declared.name, declared.message_count, declared.consumer_count
    );
    Ok(declared)
}

/// Bind a declared queue to an exchange.
pub async fn bind(
    channel: &dyn BrokerChannel,
    queue: &QueueDeclaration,
    binding: &BindingSpec,
) -> Result<(), DispatchError> {
    info!(
        "Binding {} to {}:{}",
        queue.name, binding.exchange, binding.routing_key
    );
    channel
        .bind_queue(&queue.name, &binding.exchange, &binding.routing_key)
        .await
        .map_err(|source| DispatchError::Binding {
            queue: queue.name.clone(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
            source,
        })
}

/// Declare every queue in `specs` and apply its bindings.
///
/// Returns the declared queues, keyed by the name used in their specification.
/// The first failure aborts the whole setup.
pub async fn declare_and_bind_all(
    channel: &dyn BrokerChannel,
    specs: &[QueueSpec],
) -> Result<BTreeMap<String, QueueDeclaration>, DispatchError> {
    let mut declared_queues = BTreeMap::new();
    for spec in specs {
        let declared = declare_queue(channel, spec).await?;
        for binding in &spec.bindings {
            bind(channel, &declared, binding).await?;
        }
        declared_queues.insert(spec.queue.clone(), declared);
    }
    Ok(declared_queues)
}
