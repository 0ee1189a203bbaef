//! `amqp-dispatcher` consumes messages from RabbitMq queues, built on top of [`lapin`],
//! and dispatches them to bounded pools of handler instances.
//!
//! It keeps a [`ResilientConnection`](crate::connection::ResilientConnection) to the broker,
//! declares the configured [topology](crate::topology) and runs one
//! [`Consumer`](crate::consumers::Consumer) per configured queue. Every message is
//! acknowledged, or rejected and requeued, exactly once: by its
//! [`Handler`](crate::consumers::Handler) through the
//! [`MessageProxy`](crate::consumers::MessageProxy), or by the dispatcher on its behalf.
//!
//! [`Dispatcher`](crate::dispatcher::Dispatcher) and [`cli::run`](crate::cli::run) are the best
//! starting points.

pub mod amqp;
pub mod cli;
pub mod configuration;
pub mod connection;
pub mod consumers;
pub mod dispatcher;
pub mod error;
pub mod sync;
pub mod topology;

pub use error::DispatchError;
