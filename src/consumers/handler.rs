//! Message handlers and the registry used to resolve them from configuration.
use crate::consumers::{Message, MessageProxy};
use crate::error::DispatchError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Implementers of the `Handler` trait process the messages retrieved from a queue.
///
/// Each consumer owns a fixed-size pool of handler instances: an instance processes a single
/// message at a time and gets exclusive (`&mut`) access to itself while doing so.
///
/// # Responding
///
/// `consume` can settle the message explicitly through the [`MessageProxy`] (e.g. to reject a
/// poison message without requeueing it). If it does not:
/// - returning `Ok(())` acknowledges the message;
/// - returning `Err(_)` calls [`Handler::shutdown`] with the error and rejects the message with
///   `requeue = true`, the broker will redeliver it.
///
/// Instances are returned to the pool after every message, whatever the outcome: `shutdown` is
/// an instance's chance to release or reset its internal resources before it is reused.
#[async_trait::async_trait]
pub trait Handler: Send + 'static {
    async fn consume(
        &mut self,
        proxy: &MessageProxy,
        message: &Message,
    ) -> Result<(), anyhow::Error>;

    async fn shutdown(&mut self, error: Option<&anyhow::Error>);
}

/// Builds a new handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// A hook executed once, before connecting to the broker.
pub type StartupHook = Arc<dyn Fn() -> Result<(), anyhow::Error> + Send + Sync>;

/// Maps handler identifiers to the code that builds them.
///
/// Identifiers have the form `<module>:<type>` (e.g. `billing.handlers:InvoiceHandler`) and are
/// what consumer specifications refer to.
///
/// ```
/// use amqp_dispatcher::consumers::{Handler, HandlerRegistry, Message, MessageProxy};
///
/// #[derive(Default)]
/// struct Noop;
///
/// #[async_trait::async_trait]
/// impl Handler for Noop {
///     async fn consume(&mut self, _: &MessageProxy, _: &Message) -> Result<(), anyhow::Error> {
///         Ok(())
///     }
///
///     async fn shutdown(&mut self, _: Option<&anyhow::Error>) {}
/// }
///
/// let registry = HandlerRegistry::new().register::<Noop>("handlers:Noop");
/// assert!(registry.resolve("handlers:Noop").is_ok());
/// assert!(registry.resolve("handlers:Missing").is_err());
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFactory>,
    startup_hooks: HashMap<String, StartupHook>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler type built via its `Default` implementation.
    #[must_use]
    pub fn register<H: Handler + Default>(self, identifier: impl Into<String>) -> Self {
        self.register_factory(identifier, || Box::new(H::default()) as Box<dyn Handler>)
    }

    /// Register a handler built by `factory`.
    #[must_use]
    pub fn register_factory<F>(mut self, identifier: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    {
        self.handlers.insert(identifier.into(), Arc::new(factory));
        self
    }

    /// Register a hook that can be referenced as `startup_handler`.
    #[must_use]
    pub fn register_startup_hook<F>(mut self, identifier: impl Into<String>, hook: F) -> Self
    where
        F: Fn() -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        self.startup_hooks.insert(identifier.into(), Arc::new(hook));
        self
    }

    /// Resolve `identifier` to the factory of its handler.
    pub fn resolve(&self, identifier: &str) -> Result<HandlerFactory, DispatchError> {
        check_identifier(identifier)?;
        self.handlers
            .get(identifier)
            .cloned()
            .ok_or_else(|| DispatchError::HandlerLoad {
                identifier: identifier.to_owned(),
                reason: "no handler is registered under this identifier".into(),
            })
    }

    pub fn resolve_startup_hook(&self, identifier: &str) -> Result<StartupHook, DispatchError> {
        check_identifier(identifier)?;
        self.startup_hooks
            .get(identifier)
            .cloned()
            .ok_or_else(|| DispatchError::HandlerLoad {
                identifier: identifier.to_owned(),
                reason: "no startup hook is registered under this identifier".into(),
            })
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("startup_hooks", &self.startup_hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn check_identifier(identifier: &str) -> Result<(), DispatchError> {
    match identifier.split_once(':') {
        Some((module, name))
            if !module.is_empty() && !name.is_empty() && !name.contains(':') =>
        {
            Ok(())
        }
        _ => Err(DispatchError::HandlerLoad {
            identifier: identifier.to_owned(),
            reason: "expected an identifier of the form `<module>:<type>`".into(),
        }),
    }
}
