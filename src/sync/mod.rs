//! Synchronisation primitives used to drain in-flight work.

mod wait_group;

pub use wait_group::{WaitGroup, WaitGroupError};
