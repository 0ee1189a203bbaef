//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
pub mod convenience;
mod factory;
pub mod rabbit_mq;
pub mod transport;

pub use factory::ConnectionFactory;
pub use transport::{
    Acker, BrokerChannel, BrokerConnection, DeliveryStream, QueueDeclaration, Transport,
};

pub use lapin::{options, types, BasicProperties};
