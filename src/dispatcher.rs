//! Wires configuration, handlers and the broker connection together.
use crate::amqp::configuration::{RabbitMqSettings, ReconnectPolicy};
use crate::amqp::{ConnectionFactory, Transport};
use crate::configuration::{DispatcherConfig, DispatcherEnvironment};
use crate::connection::ResilientConnection;
use crate::consumers::{Consumer, HandlerRegistry};
use crate::error::DispatchError;
use crate::topology::{self, QueueSpec};
use futures_util::future::join_all;
use futures_util::FutureExt;
use shutdown_handler::ShutdownHandler;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// Declares the configured topology and runs the configured consumers, across reconnections,
/// until it is asked to shut down.
///
/// ```no_run
/// use amqp_dispatcher::configuration::{DispatcherConfig, DispatcherEnvironment};
/// use amqp_dispatcher::consumers::HandlerRegistry;
/// use amqp_dispatcher::dispatcher::Dispatcher;
///
/// # async fn run(registry: HandlerRegistry) -> Result<(), anyhow::Error> {
/// let config = DispatcherConfig::from_file("config.yml")?;
/// let dispatcher = Dispatcher::new(config, registry, DispatcherEnvironment::from_env());
/// dispatcher.validate()?;
/// dispatcher.run_until_sigterm().await
/// # }
/// ```
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: HandlerRegistry,
    environment: DispatcherEnvironment,
    settings: RabbitMqSettings,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: HandlerRegistry,
        environment: DispatcherEnvironment,
    ) -> Self {
        Self {
            config,
            registry,
            environment,
            settings: RabbitMqSettings::default(),
        }
    }

    /// Use `settings` to connect to the broker.
    ///
    /// The address is still overridden by the broker url of the environment, if any.
    #[must_use]
    pub fn with_settings(mut self, settings: RabbitMqSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Check that the configuration can be run: every handler and the startup handler resolve,
    /// every consumer has a positive prefetch and consumer count.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if let Some(identifier) = &self.config.startup_handler {
            self.registry.resolve_startup_hook(identifier)?;
        }
        let declared: HashSet<&str> = self
            .config
            .queues
            .iter()
            .map(|queue| queue.queue.as_str())
            .collect();
        for spec in &self.config.consumers {
            spec.check()?;
            self.registry.resolve(&spec.consumer)?;
            if !declared.contains(spec.queue.as_str()) {
                warn!(
                    "Queue {} is not declared by this dispatcher, it is expected to exist",
                    spec.queue
                );
            }
        }
        Ok(())
    }

    /// Run until the process receives SIGTERM.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await?;
        Ok(())
    }

    /// Run until `shutdown` is triggered.
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), DispatchError> {
        let settings = self.broker_settings()?;
        let transport = ConnectionFactory::new_from_config(&settings)
            .map_err(DispatchError::Connection)?
            .with_connection_name(self.environment.connection_label());
        self.run_with_transport(transport, settings.reconnect_policy(), shutdown)
            .await
    }

    /// Run until `shutdown` is triggered, connecting to the broker through `transport`.
    #[tracing::instrument(skip_all, name = "dispatcher_run")]
    pub async fn run_with_transport(
        self,
        transport: impl Transport,
        policy: ReconnectPolicy,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), DispatchError> {
        self.run_startup_handler()?;

        let connection = ResilientConnection::connect(transport, policy).await?;
        connection.on_close(|| info!("The connection to the RabbitMq broker was closed"));

        let consumers = Arc::new(self.load_consumers());
        let queues = Arc::new(self.config.queues);
        let weak = Arc::downgrade(&connection);
        connection.register_reconnect_task(Arc::new(move || {
            begin_consumption(weak.clone(), queues.clone(), consumers.clone()).boxed()
        }));

        connection.run_until_shutdown(shutdown).await
    }

    fn broker_settings(&self) -> Result<RabbitMqSettings, DispatchError> {
        let Some(url) = &self.environment.rabbit_url else {
            return Ok(self.settings.clone());
        };
        let from_url = RabbitMqSettings::from_url(url)
            .map_err(|e| DispatchError::Configuration(format!("{e:#}")))?;
        Ok(RabbitMqSettings {
            connection_timeout_seconds: self.settings.connection_timeout_seconds,
            reconnect_initial_delay_ms: self.settings.reconnect_initial_delay_ms,
            reconnect_max_delay_ms: self.settings.reconnect_max_delay_ms,
            ..from_url
        })
    }

    fn run_startup_handler(&self) -> Result<(), DispatchError> {
        let Some(identifier) = &self.config.startup_handler else {
            return Ok(());
        };
        let hook = self.registry.resolve_startup_hook(identifier)?;
        info!("Running startup handler {}", identifier);
        hook().map_err(|source| DispatchError::Startup {
            identifier: identifier.clone(),
            source,
        })
    }

    /// Consumers whose handler cannot be loaded are skipped, the others still run.
    fn load_consumers(&self) -> Vec<Consumer> {
        let label = self.environment.connection_label();
        self.config
            .consumers
            .iter()
            .filter_map(|spec| match Consumer::new(spec.clone(), &self.registry, &label) {
                Ok(consumer) => Some(consumer),
                Err(e) => {
                    error!(error = ?e, "Skipping the consumer on queue {}", spec.queue);
                    None
                }
            })
            .collect()
    }
}

/// Runs on every new link: declare the topology, then consume until the link is lost or the
/// dispatcher shuts down.
async fn begin_consumption(
    connection: Weak<ResilientConnection>,
    queues: Arc<Vec<QueueSpec>>,
    consumers: Arc<Vec<Consumer>>,
) -> Result<(), DispatchError> {
    let Some(connection) = connection.upgrade() else {
        return Ok(());
    };

    if !queues.is_empty() {
        let channel = connection.open_channel().await?;
        topology::declare_and_bind_all(channel.as_ref(), &queues).await?;
        if let Err(e) = channel.close().await {
            warn!(error = ?e, "Failed to close the topology channel");
        }
    }

    let epoch = connection.epoch_shutdown();
    let runs: Vec<_> = consumers
        .iter()
        .map(|consumer| run_consumer(consumer, &connection, &epoch))
        .collect();
    join_all(runs).await;
    Ok(())
}

async fn run_consumer(
    consumer: &Consumer,
    connection: &ResilientConnection,
    epoch: &ShutdownHandler,
) {
    if let Err(e) = consumer
        .run_until_shutdown(connection, epoch.wait_for_signal())
        .await
    {
        error!(error = ?e, "Consumer on queue {} stopped", consumer.spec().queue);
    }
}
