// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Managed Consumer
//!
//! Supervises one dispatched `QueueConsumer`. When the consumer fails (a
//! channel fault or a lost connection) it is dropped, `ConsumerStopped` is
//! published and, if restarts are enabled, a new consumer is created on a
//! fresh connection after `reconnect_timeout`.
//!
//! At most one consumer is live and at most one restart is pending at any
//! time. A failed restart is final: the state becomes `RestartFailed` and
//! nothing else is attempted.
//!
//! Every `start` and `stop` opens a new generation. Supervision tasks and
//! pending restarts belong to the generation that spawned them and give up
//! as soon as it is no longer current, so a late failure or a slow reconnect
//! can never touch a consumer started afterwards. Connections opened by the
//! supervisor are closed together with the consumer that used them; an
//! injected connection is left open.

use crate::{
    broker::{AmqpConnection, Connector},
    config::{AmqpConfigs, ConsumerOptions, DEFAULT_RECONNECT_TIMEOUT},
    consumer::QueueConsumer,
    dispatcher::{create_consumer, CreateConsumerOptions, MessageHandler},
    errors::AmqpError,
    retry::RetryPolicy,
};
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

const EVENTS_CAPACITY: usize = 16;

/// Settings of a `ManagedConsumer`.
#[derive(Clone)]
pub struct ManagedConsumerOptions {
    pub url: String,
    /// Used for the first start only; restarts always open a new connection
    pub connection: Option<Arc<dyn AmqpConnection>>,
    pub consumer: ConsumerOptions,
    pub restart: bool,
    pub reconnect_timeout: Duration,
    /// Unbounded when `None`
    pub max_restarts: Option<u32>,
    pub connect_retry: RetryPolicy,
}

impl ManagedConsumerOptions {
    /// Options restarting without limit after the default reconnect timeout.
    ///
    /// # Parameters
    /// * `url` - The AMQP URL used whenever a new connection is needed
    /// * `consumer` - Settings of every consumer created by the supervisor
    pub fn new(url: &str, consumer: ConsumerOptions) -> Self {
        ManagedConsumerOptions {
            url: url.to_owned(),
            connection: None,
            consumer,
            restart: true,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            max_restarts: None,
            connect_retry: RetryPolicy::connection(),
        }
    }

    pub fn from_configs(cfg: &AmqpConfigs, queue_name: &str) -> Self {
        ManagedConsumerOptions {
            restart: cfg.restart,
            reconnect_timeout: cfg.reconnect_timeout(),
            max_restarts: cfg.max_restarts,
            ..ManagedConsumerOptions::new(&cfg.url, cfg.consumer_options(queue_name))
        }
    }

    pub fn connection(mut self, connection: Arc<dyn AmqpConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = Some(max);
        self
    }

    pub fn connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }
}

/// Lifecycle of a `ManagedConsumer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedState {
    Unstarted,
    /// `start` is creating the first consumer
    Starting,
    Running,
    Stopped,
    /// Waiting for `reconnect_timeout` or connecting a replacement consumer
    Restarting,
    RestartFailed,
    /// `max_restarts` restarts were performed and the consumer failed again
    GaveUp,
}

impl ManagedState {
    fn can_start(self) -> bool {
        matches!(
            self,
            ManagedState::Unstarted
                | ManagedState::Stopped
                | ManagedState::RestartFailed
                | ManagedState::GaveUp
        )
    }
}

impl fmt::Display for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ManagedState::Unstarted => "unstarted",
            ManagedState::Starting => "starting",
            ManagedState::Running => "running",
            ManagedState::Stopped => "stopped",
            ManagedState::Restarting => "restarting",
            ManagedState::RestartFailed => "restart-failed",
            ManagedState::GaveUp => "gave-up",
        };
        f.write_str(state)
    }
}

/// Notifications published to every `subscribe`r.
#[derive(Debug, Clone)]
pub enum ManagedEvent {
    /// The live consumer failed and was stopped
    ConsumerStopped(AmqpError),
    /// A replacement consumer is running
    ConsumerRestarted(Arc<QueueConsumer>),
    /// Creating the replacement consumer failed; no further restart follows
    ConsumerRestartFailed(AmqpError),
    /// The consumer failed after the given number of restarts
    RestartsExhausted(u32),
}

/// Keeps a dispatched consumer running across channel and connection
/// failures.
///
/// Cloning is not supported; share it behind an `Arc` when several tasks
/// need to stop it or inspect it.
pub struct ManagedConsumer {
    inner: Arc<Inner>,
}

/// The consumer of the current generation and whether its connection was
/// opened by the supervisor.
struct Live {
    consumer: Arc<QueueConsumer>,
    owns_connection: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler>,
    options: Mutex<ManagedConsumerOptions>,
    // lock order: `live` before `state`
    live: RwLock<Option<Live>>,
    state: RwLock<ManagedState>,
    generation: AtomicU64,
    restarts: AtomicU32,
    events: broadcast::Sender<ManagedEvent>,
}

impl ManagedConsumer {
    /// Creates an unstarted managed consumer.
    ///
    /// # Parameters
    /// * `connector` - Opens the connections needed by restarts, and by the
    ///   first start when `options` carries no connection
    /// * `options` - Restart behaviour and consumer settings
    /// * `handler` - Receives every delivery of every consumer generation
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ManagedConsumerOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        ManagedConsumer {
            inner: Arc::new(Inner {
                connector,
                handler,
                options: Mutex::new(options),
                live: RwLock::new(None),
                state: RwLock::new(ManagedState::Unstarted),
                generation: AtomicU64::new(0),
                restarts: AtomicU32::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagedEvent> {
        self.inner.events.subscribe()
    }

    /// Creates and starts the first consumer.
    ///
    /// # Returns
    /// The started consumer, or `AmqpError::InvalidState` when a consumer is
    /// already running, starting or restarting
    pub async fn start(&self) -> Result<Arc<QueueConsumer>, AmqpError> {
        let generation = {
            let mut state = self.inner.state.write().await;
            if !state.can_start() {
                return Err(AmqpError::InvalidState(state.to_string()));
            }
            *state = ManagedState::Starting;
            self.inner.restarts.store(0, Ordering::SeqCst);
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        match launch(&self.inner, generation).await {
            Ok(Some(consumer)) => Ok(consumer),
            Ok(None) => Err(AmqpError::InvalidState(ManagedState::Stopped.to_string())),
            Err(err) => {
                self.inner
                    .transition(generation, ManagedState::Stopped)
                    .await;
                Err(err)
            }
        }
    }

    /// Stops the live consumer and abandons any pending restart.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let live = {
            let mut live = self.inner.live.write().await;
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner.set_state(ManagedState::Stopped).await;
            live.take()
        };

        match live {
            Some(live) => release(live).await,
            None => Ok(()),
        }
    }

    /// The live consumer, if any.
    pub async fn consumer(&self) -> Option<Arc<QueueConsumer>> {
        self.inner
            .live
            .read()
            .await
            .as_ref()
            .map(|live| live.consumer.clone())
    }

    pub async fn state(&self) -> ManagedState {
        *self.inner.state.read().await
    }

    /// Number of restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.inner.restarts.load(Ordering::SeqCst)
    }
}

/// Creates a managed consumer and starts it.
pub async fn create_managed_consumer(
    connector: Arc<dyn Connector>,
    options: ManagedConsumerOptions,
    handler: Arc<dyn MessageHandler>,
) -> Result<ManagedConsumer, AmqpError> {
    let managed = ManagedConsumer::new(connector, options, handler);
    managed.start().await?;
    Ok(managed)
}

impl Inner {
    fn emit(&self, event: ManagedEvent) {
        if self.events.send(event).is_err() {
            debug!("managed consumer event not observed");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn set_state(&self, state: ManagedState) {
        *self.state.write().await = state;
    }

    /// Moves to `state` unless `generation` was superseded.
    async fn transition(&self, generation: u64, state: ManagedState) -> bool {
        let _live = self.live.write().await;
        if !self.is_current(generation) {
            return false;
        }
        self.set_state(state).await;
        true
    }
}

/// Stops a consumer that is no longer published and closes the connection
/// the supervisor opened for it.
async fn release(live: Live) -> Result<(), AmqpError> {
    let stopped = live.consumer.stop().await;

    if live.owns_connection {
        if let Err(err) = live.consumer.connection().close().await {
            warn!(error = err.to_string(), "failure to close connection");
        }
    }

    stopped
}

/// Creates a consumer for `generation` and publishes it.
///
/// Returns `Ok(None)` when `generation` was superseded while connecting; the
/// consumer created in the meantime is released again.
async fn launch(
    inner: &Arc<Inner>,
    generation: u64,
) -> Result<Option<Arc<QueueConsumer>>, AmqpError> {
    let options = {
        let options = inner.options.lock().await;
        CreateConsumerOptions {
            url: options.url.clone(),
            connection: options.connection.clone(),
            consumer: options.consumer.clone(),
            connect_retry: options.connect_retry.clone(),
        }
    };

    let running = create_consumer(inner.connector.as_ref(), options, inner.handler.clone()).await?;
    let live = Live {
        consumer: running.consumer.clone(),
        owns_connection: running.owns_connection,
    };

    {
        let mut current = inner.live.write().await;
        if inner.is_current(generation) {
            *current = Some(live);
            inner.set_state(ManagedState::Running).await;
            tokio::spawn(supervise(
                inner.clone(),
                generation,
                running.consumer.clone(),
                running.failure,
            ));
            return Ok(Some(running.consumer));
        }
    }

    debug!(tag = running.consumer.tag(), "consumer started after stop, releasing");
    if let Err(err) = release(live).await {
        warn!(error = err.to_string(), "failure to stop superseded consumer");
    }
    Ok(None)
}

fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    consumer: Arc<QueueConsumer>,
    failure: oneshot::Receiver<AmqpError>,
) -> BoxFuture<'static, ()> {
    async move {
        let Ok(err) = failure.await else {
            debug!("consumer ended without failure");
            return;
        };

        let failed = {
            let mut live = inner.live.write().await;
            if !inner.is_current(generation) {
                debug!(tag = consumer.tag(), "superseded consumer failed");
                return;
            }

            let owned = live
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(&live.consumer, &consumer));
            inner.set_state(ManagedState::Stopped).await;
            if owned {
                live.take()
            } else {
                None
            }
        };

        if let Some(failed) = failed {
            if let Err(stop_err) = release(failed).await {
                warn!(error = stop_err.to_string(), "failure to release failed consumer");
            }
        }

        inner.emit(ManagedEvent::ConsumerStopped(err));

        let (restart, max_restarts) = {
            let options = inner.options.lock().await;
            (options.restart, options.max_restarts)
        };

        if !restart {
            return;
        }

        if let Some(max) = max_restarts {
            if inner.restarts.load(Ordering::SeqCst) >= max {
                warn!(max_restarts = max, "giving up restarting consumer");
                if inner.transition(generation, ManagedState::GaveUp).await {
                    inner.emit(ManagedEvent::RestartsExhausted(max));
                }
                return;
            }
        }

        restart_consumer(inner, generation).await;
    }
    .boxed()
}

async fn restart_consumer(inner: Arc<Inner>, generation: u64) {
    if !inner.transition(generation, ManagedState::Restarting).await {
        return;
    }

    let reconnect_timeout = {
        let mut options = inner.options.lock().await;
        options.connection = None;
        options.reconnect_timeout
    };

    info!(
        delay_ms = reconnect_timeout.as_millis() as u64,
        "restarting consumer"
    );
    tokio::time::sleep(reconnect_timeout).await;

    if !inner.is_current(generation) {
        debug!("restart abandoned");
        return;
    }

    inner.restarts.fetch_add(1, Ordering::SeqCst);

    match launch(&inner, generation).await {
        Ok(Some(consumer)) => {
            info!(tag = consumer.tag(), "consumer restarted");
            inner.emit(ManagedEvent::ConsumerRestarted(consumer));
        }
        Ok(None) => debug!("restart abandoned"),
        Err(err) => {
            error!(error = err.to_string(), "failure to restart consumer");
            if inner.transition(generation, ManagedState::RestartFailed).await {
                inner.emit(ManagedEvent::ConsumerRestartFailed(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{AmqpChannel, Message, MockAmqpChannel, MockAmqpConnection, MockConnector},
        consumer::tests::expect_start,
        dispatcher::MockMessageHandler,
    };
    use async_trait::async_trait;
    use tokio::{
        sync::mpsc::{self, UnboundedSender},
        time::timeout,
    };

    type Senders = (
        UnboundedSender<Result<Message, AmqpError>>,
        UnboundedSender<AmqpError>,
    );

    fn stoppable_channel() -> (MockAmqpChannel, Senders) {
        let mut channel = MockAmqpChannel::new();
        let senders = expect_start(&mut channel);
        channel.expect_basic_cancel().returning(|_| Ok(()));
        channel.expect_close().returning(|| Ok(()));
        (channel, senders)
    }

    fn connection_with(channel: MockAmqpChannel) -> Arc<dyn AmqpConnection> {
        let mut connection = MockAmqpConnection::new();
        connection
            .expect_create_channel()
            .return_once(move || Ok(Arc::new(channel) as Arc<dyn AmqpChannel>));
        connection
            .expect_errors()
            .returning(|| mpsc::unbounded_channel().1);
        Arc::new(connection)
    }

    /// A connection opened by the supervisor itself; reports `close` on
    /// `closed`.
    fn owned_connection_with(
        channel: MockAmqpChannel,
        closed: UnboundedSender<()>,
    ) -> Arc<dyn AmqpConnection> {
        let mut connection = MockAmqpConnection::new();
        connection
            .expect_create_channel()
            .return_once(move || Ok(Arc::new(channel) as Arc<dyn AmqpChannel>));
        connection
            .expect_errors()
            .returning(|| mpsc::unbounded_channel().1);
        connection.expect_close().times(1).returning(move || {
            let _ = closed.send(());
            Ok(())
        });
        Arc::new(connection)
    }

    /// Hands out a single connection after `delay`.
    struct SlowConnector {
        delay: Duration,
        connection: std::sync::Mutex<Option<Arc<dyn AmqpConnection>>>,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(&self, _url: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
            tokio::time::sleep(self.delay).await;
            self.connection
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AmqpError::ConnectionError("refused".to_owned()))
        }
    }

    fn options(connection: Arc<dyn AmqpConnection>) -> ManagedConsumerOptions {
        ManagedConsumerOptions::new("amqp://localhost", ConsumerOptions::new("orders"))
            .connection(connection)
            .reconnect_timeout(Duration::from_millis(10))
            .connect_retry(RetryPolicy::connection().with_max_attempts(1))
    }

    fn fault() -> AmqpError {
        AmqpError::ChannelFault("PRECONDITION_FAILED".to_owned())
    }

    #[test]
    fn should_build_options_from_configs() {
        let cfg = AmqpConfigs {
            restart: false,
            max_restarts: Some(2),
            reconnect_timeout_ms: 100,
            prefetch_count: 4,
            ..Default::default()
        };

        let options = ManagedConsumerOptions::from_configs(&cfg, "orders");

        assert!(!options.restart);
        assert_eq!(options.max_restarts, Some(2));
        assert_eq!(options.reconnect_timeout, Duration::from_millis(100));
        assert_eq!(options.consumer.prefetch_count, 4);
        assert_eq!(options.url, cfg.url);
        assert!(options.connection.is_none());
    }

    #[tokio::test]
    async fn should_restart_with_a_fresh_connection() {
        let (first_channel, (_first_deliveries, first_faults)) = stoppable_channel();
        let (second_channel, _second_senders) = stoppable_channel();
        let second_connection = connection_with(second_channel);

        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(second_connection));

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            options(connection_with(first_channel)),
            Arc::new(MockMessageHandler::new()),
        );
        let mut events = managed.subscribe();

        let first = managed.start().await.unwrap();
        assert_eq!(managed.state().await, ManagedState::Running);

        first_faults.send(fault()).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::ConsumerStopped(AmqpError::ChannelFault(_))
        ));
        let ManagedEvent::ConsumerRestarted(second) = events.recv().await.unwrap() else {
            panic!("expected a restart");
        };

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&managed.consumer().await.unwrap(), &second));
        assert_eq!(managed.state().await, ManagedState::Running);
        assert_eq!(managed.restarts(), 1);
    }

    #[tokio::test]
    async fn should_not_restart_when_disabled() {
        let (channel, (_deliveries, faults)) = stoppable_channel();
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            options(connection_with(channel)).restart(false),
            Arc::new(MockMessageHandler::new()),
        );
        let mut events = managed.subscribe();
        managed.start().await.unwrap();

        faults.send(fault()).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::ConsumerStopped(_)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(managed.state().await, ManagedState::Stopped);
        assert!(managed.consumer().await.is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_report_a_failed_restart_once() {
        let (channel, (_deliveries, faults)) = stoppable_channel();
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(AmqpError::ConnectionError("refused".to_owned())));

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            options(connection_with(channel)),
            Arc::new(MockMessageHandler::new()),
        );
        let mut events = managed.subscribe();
        managed.start().await.unwrap();

        faults.send(fault()).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::ConsumerStopped(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::ConsumerRestartFailed(AmqpError::ConnectionError(_))
        ));
        assert_eq!(managed.state().await, ManagedState::RestartFailed);
    }

    #[tokio::test]
    async fn should_give_up_after_max_restarts() {
        let (channel, (_deliveries, faults)) = stoppable_channel();
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            options(connection_with(channel)).max_restarts(0),
            Arc::new(MockMessageHandler::new()),
        );
        let mut events = managed.subscribe();
        managed.start().await.unwrap();

        faults.send(fault()).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::ConsumerStopped(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::RestartsExhausted(0)
        ));
        assert_eq!(managed.state().await, ManagedState::GaveUp);
    }

    #[tokio::test]
    async fn should_stop_live_consumer() {
        let (channel, _senders) = stoppable_channel();

        let managed = ManagedConsumer::new(
            Arc::new(MockConnector::new()),
            options(connection_with(channel)),
            Arc::new(MockMessageHandler::new()),
        );
        let consumer = managed.start().await.unwrap();

        managed.stop().await.unwrap();

        assert_eq!(managed.state().await, ManagedState::Stopped);
        assert!(managed.consumer().await.is_none());
        assert_eq!(
            consumer.state().await,
            crate::consumer::ConsumerState::Stopped
        );
        assert_eq!(managed.stop().await, Ok(()));
    }

    #[tokio::test]
    async fn should_refuse_to_start_while_running() {
        let (channel, _senders) = stoppable_channel();
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            options(connection_with(channel)),
            Arc::new(MockMessageHandler::new()),
        );
        let first = managed.start().await.unwrap();

        assert_eq!(
            managed.start().await.unwrap_err(),
            AmqpError::InvalidState("running".to_owned())
        );
        assert!(Arc::ptr_eq(&managed.consumer().await.unwrap(), &first));
        assert_eq!(managed.state().await, ManagedState::Running);
        assert_eq!(
            first.state().await,
            crate::consumer::ConsumerState::Consuming
        );
    }

    #[tokio::test]
    async fn should_release_a_consumer_restarted_after_stop() {
        let (first_channel, (_first_deliveries, first_faults)) = stoppable_channel();

        let (cancelled_tx, mut cancelled_rx) = mpsc::unbounded_channel();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let mut second_channel = MockAmqpChannel::new();
        let _second_senders = expect_start(&mut second_channel);
        second_channel.expect_basic_cancel().returning(move |_| {
            let _ = cancelled_tx.send(());
            Ok(())
        });
        second_channel.expect_close().returning(|| Ok(()));

        let connector = SlowConnector {
            delay: Duration::from_millis(100),
            connection: std::sync::Mutex::new(Some(owned_connection_with(
                second_channel,
                closed_tx,
            ))),
        };

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            options(connection_with(first_channel)),
            Arc::new(MockMessageHandler::new()),
        );
        let mut events = managed.subscribe();
        managed.start().await.unwrap();

        first_faults.send(fault()).unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagedEvent::ConsumerStopped(_)
        ));

        // the restart is now waiting on the connector
        tokio::time::sleep(Duration::from_millis(40)).await;
        managed.stop().await.unwrap();

        let wait = Duration::from_secs(1);
        assert_eq!(timeout(wait, cancelled_rx.recv()).await, Ok(Some(())));
        assert_eq!(timeout(wait, closed_rx.recv()).await, Ok(Some(())));

        assert_eq!(managed.state().await, ManagedState::Stopped);
        assert!(managed.consumer().await.is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_close_owned_connection_on_stop() {
        let (channel, _senders) = stoppable_channel();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let connection = owned_connection_with(channel, closed_tx);

        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(connection));

        let managed = ManagedConsumer::new(
            Arc::new(connector),
            ManagedConsumerOptions::new("amqp://localhost", ConsumerOptions::new("orders"))
                .connect_retry(RetryPolicy::connection().with_max_attempts(1)),
            Arc::new(MockMessageHandler::new()),
        );
        managed.start().await.unwrap();

        managed.stop().await.unwrap();

        assert_eq!(closed_rx.try_recv(), Ok(()));
        assert_eq!(managed.state().await, ManagedState::Stopped);
    }
}
