//! Facilities to consume messages from a RabbitMq queue with a pool of handler instances.
//! Check out [`Handler`] and [`Consumer`] as a starting point.
pub use consumer::{Consumer, ConsumerSpec};
pub use handler::{Handler, HandlerFactory, HandlerRegistry, StartupHook};
pub use message::{Delivery, Message};
pub use proxy::{MessageProxy, ResponseError};

mod consumer;
mod handler;
mod message;
mod proxy;
