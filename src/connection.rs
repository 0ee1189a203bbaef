//! A broker connection that survives the loss of its physical link.
use crate::amqp::configuration::ReconnectPolicy;
use crate::amqp::{BrokerChannel, BrokerConnection, Transport};
use crate::error::DispatchError;
use crate::sync::WaitGroup;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use shutdown_handler::ShutdownHandler;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long the dispatch loops of an epoch get to stop once they have been asked to.
const EPOCH_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The state of the physical link with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Disconnected,
}

/// The task that (re)builds all broker-side state on a fresh link: topology and consumers.
///
/// It is executed on the initial link and again after every successful reconnection.
/// It should run until the shutdown handler returned by
/// [`ResilientConnection::epoch_shutdown`] is triggered.
pub type ReconnectTask =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// Invoked every time the physical link goes down.
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;

/// A connection to the broker that re-establishes its physical link when it is lost.
///
/// The connection does not hold any broker-side state by itself: on every new link
/// (an *epoch*) it runs the registered [`ReconnectTask`], which is expected to declare the
/// topology and restart the consumers. Channels opened during an epoch die with its link.
///
/// The connection also owns the process-wide [`WaitGroup`] tracking the messages being
/// processed: it is drained before reconnecting and before closing the link on shutdown.
pub struct ResilientConnection {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    link: RwLock<Arc<dyn BrokerConnection>>,
    epoch: Mutex<Arc<ShutdownHandler>>,
    state: watch::Sender<LinkState>,
    reconnect_task: Mutex<Option<ReconnectTask>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    wait_group: WaitGroup,
}

enum EpochEnd {
    Shutdown,
    LinkLost,
    Failed(DispatchError),
}

impl ResilientConnection {
    /// Establish the initial link with the broker.
    ///
    /// Failing to connect at startup is fatal: retries only kick in once a link has been
    /// established at least once.
    pub async fn connect(
        transport: impl Transport,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, DispatchError> {
        let link = transport.connect().await.map_err(DispatchError::Connection)?;
        info!("Connected to the RabbitMq broker");
        Ok(Arc::new(Self {
            transport: Arc::new(transport),
            policy,
            link: RwLock::new(link),
            epoch: Mutex::new(Arc::new(ShutdownHandler::new())),
            state: watch::channel(LinkState::Connected).0,
            reconnect_task: Mutex::new(None),
            close_callbacks: Mutex::new(Vec::new()),
            wait_group: WaitGroup::new(),
        }))
    }

    /// Open a channel on the current link.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, DispatchError> {
        self.link()
            .open_channel()
            .await
            .map_err(DispatchError::channel("open a channel"))
    }

    /// Register the task to run on every new link. It replaces any previously registered task.
    pub fn register_reconnect_task(&self, task: ReconnectTask) {
        *self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Register a callback invoked every time the link goes down.
    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.close_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Tracks the messages currently being processed across all consumers.
    pub fn wait_group(&self) -> &WaitGroup {
        &self.wait_group
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Subscribe to the changes of [`LinkState`].
    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// The shutdown handler of the current epoch.
    ///
    /// It is triggered when the link is lost or when the connection is shutting down: dispatch
    /// loops started by the [`ReconnectTask`] must stop when it fires.
    pub fn epoch_shutdown(&self) -> Arc<ShutdownHandler> {
        self.epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn link(&self) -> Arc<dyn BrokerConnection> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Supervise the link until `shutdown` is triggered.
    ///
    /// On every epoch the registered [`ReconnectTask`] is executed. When the link is lost the
    /// epoch is stopped, in-flight messages are drained and a new link is established, with
    /// capped exponential backoff between attempts, forever.
    ///
    /// Returns an error only if the [`ReconnectTask`] fails.
    pub async fn run_until_shutdown(
        &self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), DispatchError> {
        let outcome = self.supervise(&shutdown).await;
        self.reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        outcome
    }

    async fn supervise(&self, shutdown: &ShutdownHandler) -> Result<(), DispatchError> {
        loop {
            let link = self.link();
            match self.run_epoch(&link, shutdown).await {
                EpochEnd::Shutdown => {
                    self.drain().await;
                    self.close(&link).await;
                    return Ok(());
                }
                EpochEnd::Failed(e) => {
                    error!(error = ?e, "Failed to set up consumption, shutting down");
                    self.drain().await;
                    self.close(&link).await;
                    return Err(e);
                }
                EpochEnd::LinkLost => {
                    warn!("Lost the connection to the RabbitMq broker");
                    self.state.send_replace(LinkState::Reconnecting);
                    self.fire_close_callbacks();
                    self.drain().await;
                    match self.reconnect(shutdown).await {
                        Some(link) => {
                            *self.link.write().unwrap_or_else(PoisonError::into_inner) = link;
                            self.state.send_replace(LinkState::Connected);
                        }
                        None => {
                            self.state.send_replace(LinkState::Disconnected);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn run_epoch(
        &self,
        link: &Arc<dyn BrokerConnection>,
        shutdown: &ShutdownHandler,
    ) -> EpochEnd {
        let epoch = Arc::new(ShutdownHandler::new());
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner) = epoch.clone();

        let task = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut running = match task {
            Some(task) => task(),
            None => futures_util::future::ok(()).boxed(),
        };

        let mut finished = false;
        let end = loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for_signal() => break EpochEnd::Shutdown,
                _ = link.closed() => break EpochEnd::LinkLost,
                outcome = &mut running, if !finished => {
                    finished = true;
                    if let Err(e) = outcome {
                        break EpochEnd::Failed(e);
                    }
                }
            }
        };

        epoch.shutdown();
        if !finished && tokio::time::timeout(EPOCH_GRACE_PERIOD, &mut running).await.is_err() {
            warn!("Consumers did not stop within {:?}", EPOCH_GRACE_PERIOD);
        }
        end
    }

    async fn reconnect(&self, shutdown: &ShutdownHandler) -> Option<Arc<dyn BrokerConnection>> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            let connected = tokio::select! {
                biased;

                _ = shutdown.wait_for_signal() => return None,
                connected = async {
                    tokio::time::sleep(delay).await;
                    self.transport.connect().await
                } => connected,
            };
            match connected {
                Ok(link) => {
                    info!("Reconnected to the RabbitMq broker after {} attempt(s)", attempt);
                    return Some(link);
                }
                Err(e) => warn!(error = ?e, "Reconnection attempt {} failed", attempt),
            }
        }
    }

    async fn drain(&self) {
        let in_flight = self.wait_group.count();
        if in_flight > 0 {
            info!("Waiting for {} in-flight message(s) to be processed", in_flight);
        }
        self.wait_group.wait().await;
    }

    async fn close(&self, link: &Arc<dyn BrokerConnection>) {
        if link.is_connected() {
            if let Err(e) = link.close().await {
                warn!(error = ?e, "Failed to close the connection to the RabbitMq broker");
            }
        }
        self.state.send_replace(LinkState::Disconnected);
        self.fire_close_callbacks();
        info!("Connection closed");
    }

    fn fire_close_callbacks(&self) {
        for callback in self
            .close_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback();
        }
    }
}
