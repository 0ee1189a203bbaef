use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::transport::Acker;
use crate::amqp::types::{AMQPValue, FieldTable};
use crate::amqp::BasicProperties;
use amq_protocol_types::{DeliveryTag, ShortString};
use std::borrow::Cow;

/// A delivery pushed by the broker on a consume channel.
///
/// It is split into an immutable [`Message`], handed to handlers, and the [`Acker`] used
/// by the [`MessageProxy`](super::MessageProxy) to settle the delivery.
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn into_parts(self) -> (Message, Box<dyn Acker>) {
        let message = Message {
            delivery_tag: self.delivery_tag,
            exchange: self.exchange,
            routing_key: self.routing_key,
            redelivered: self.redelivered,
            properties: self.properties,
            data: self.data,
        };
        (message, self.acker)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
            acker: Box::new(value.acker),
        }
    }
}

/// A received AMQP message.
///
/// Handlers only ever get a shared reference to it: settling the delivery goes through the
/// [`MessageProxy`](super::MessageProxy).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique (per channel) identifier of the delivery.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl Message {
    pub fn body(&self) -> &[u8] {
        &self.data
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.properties.get_header(key)
    }

    /// Lookup a header string value. Returns `None` if missing or not a string.
    pub fn header_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.properties.get_header_str(key)
    }
}
