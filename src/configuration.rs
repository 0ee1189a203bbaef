//! The declarative configuration of a dispatcher and the environment it runs in.
use crate::consumers::ConsumerSpec;
use crate::error::DispatchError;
use crate::topology::QueueSpec;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// What the dispatcher declares and consumes.
///
/// ```yaml
/// startup_handler: app.hooks:warm_up
/// queues:
///   - queue: orders
///     x_dead_letter_exchange: orders.dlx
///     bindings:
///       - exchange: orders-x
///         routing_key: created
/// consumers:
///   - queue: orders
///     consumer: app.handlers:OrderHandler
///     prefetch_count: 2
///     consumer_count: 2
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub consumers: Vec<ConsumerSpec>,
    /// Identifier of a hook executed once, before connecting to the broker.
    #[serde(default)]
    pub startup_handler: Option<String>,
}

impl DispatcherConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DispatchError> {
        serde_yaml::from_str(yaml).map_err(|e| DispatchError::Configuration(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read the configuration file {}", path.display()))?;
        Ok(Self::from_yaml_str(&yaml)?)
    }
}

pub const RABBITMQ_URL: &str = "RABBITMQ_URL";
pub const RABBIT_URL: &str = "RABBIT_URL";
pub const NOMAD_JOB_NAME: &str = "NOMAD_JOB_NAME";
pub const NOMAD_ALLOC_ID: &str = "NOMAD_ALLOC_ID";

const DEFAULT_JOB_NAME: &str = "amqp-dispatcher";
const DEFAULT_ALLOC_ID: &str = "local";

/// Deployment details, read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherEnvironment {
    /// Broker url, overriding the address in the broker settings when set.
    pub rabbit_url: Option<String>,
    pub job_name: String,
    pub alloc_id: String,
}

impl Default for DispatcherEnvironment {
    fn default() -> Self {
        Self {
            rabbit_url: None,
            job_name: DEFAULT_JOB_NAME.into(),
            alloc_id: DEFAULT_ALLOC_ID.into(),
        }
    }
}

impl DispatcherEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let default = Self::default();
        Self {
            rabbit_url: lookup(RABBITMQ_URL).or_else(|| lookup(RABBIT_URL)),
            job_name: lookup(NOMAD_JOB_NAME).unwrap_or(default.job_name),
            alloc_id: lookup(NOMAD_ALLOC_ID).unwrap_or(default.alloc_id),
        }
    }

    /// Identifies this process to the broker, e.g. in consumer tags.
    pub fn connection_label(&self) -> String {
        format!("{}.{}", self.job_name, self.alloc_id)
    }
}
