// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch
//!
//! Connects a started `QueueConsumer` to a user supplied `MessageHandler`.
//! Each delivery is handled in its own task, so handling never blocks the
//! receipt of further deliveries beyond the prefetch limit. The outcome of
//! the handler decides what happens to the delivery:
//!
//! - success: ack
//! - terminal error (the payload can never be decoded): logged and acked
//! - any other error: rejected, which retries it through the dead-letter
//!   exchange until the rejection limit is reached
//!
//! `EventDispatcher` is a handler that decodes envelopes and routes them to
//! an `EventHandler` registered for their `type`.

use crate::{
    broker::{AmqpConnection, Connector, Message},
    channel,
    codec::{self, TypeRegistry},
    config::ConsumerOptions,
    consumer::{ConsumerEvent, QueueConsumer},
    errors::AmqpError,
    events::Event,
    otel,
    retry::RetryPolicy,
};
use async_trait::async_trait;
use opentelemetry::trace::{Span, Status};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tokio::sync::{
    mpsc::UnboundedReceiver,
    oneshot::{self, Sender},
};
use tracing::{debug, error, warn};

#[cfg(test)]
use mockall::automock;

/// Handles raw deliveries.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, message: &Message) -> Result<(), AmqpError>;
}

/// Handles decoded events of one `type`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn exec(&self, event: &Event, message: &Message) -> Result<(), AmqpError>;
}

/// `MessageHandler` decoding envelopes with a `TypeRegistry` and routing
/// the resulting events by `type`.
///
/// Events of a registered type without a handler are logged and acked.
pub struct EventDispatcher {
    registry: TypeRegistry,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        EventDispatcher::new(TypeRegistry::default())
    }
}

impl EventDispatcher {
    /// Creates a dispatcher without handlers.
    ///
    /// # Parameters
    /// * `registry` - Decides which envelope types can be decoded, and how strictly
    pub fn new(registry: TypeRegistry) -> Self {
        EventDispatcher {
            registry,
            handlers: HashMap::default(),
        }
    }

    /// Routes events of type `kind` to `handler`.
    pub fn register(mut self, kind: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind.to_owned(), handler);
        self
    }
}

#[async_trait]
impl MessageHandler for EventDispatcher {
    async fn exec(&self, message: &Message) -> Result<(), AmqpError> {
        let event = codec::decode_event(&message.content, &self.registry)?;

        let Some(handler) = self.handlers.get(event.kind()) else {
            warn!(
                kind = event.kind(),
                "removing message from queue - reason: unsupported msg type"
            );
            return Ok(());
        };

        handler.exec(&event, message).await
    }
}

/// Arguments of `create_consumer`.
pub struct CreateConsumerOptions {
    pub url: String,
    /// Reused as-is instead of opening a new connection
    pub connection: Option<Arc<dyn AmqpConnection>>,
    pub consumer: ConsumerOptions,
    pub connect_retry: RetryPolicy,
}

impl CreateConsumerOptions {
    pub fn new(url: &str, consumer: ConsumerOptions) -> Self {
        CreateConsumerOptions {
            url: url.to_owned(),
            connection: None,
            consumer,
            connect_retry: RetryPolicy::connection(),
        }
    }

    pub fn connection(mut self, connection: Arc<dyn AmqpConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }
}

/// A consumer whose deliveries are being dispatched.
pub struct RunningConsumer {
    pub consumer: Arc<QueueConsumer>,

    /// Resolves with the first channel or connection failure, after the
    /// consumer was stopped. Closed without a value when the broker cancels
    /// the consumer or it is stopped by the caller.
    pub failure: oneshot::Receiver<AmqpError>,

    /// Whether the connection was opened by `create_consumer` rather than
    /// injected. The caller is responsible for closing an owned connection.
    pub owns_connection: bool,
}

/// Acquires a connection, starts a consumer on it and dispatches its
/// deliveries to `handler`.
pub async fn create_consumer(
    connector: &dyn Connector,
    options: CreateConsumerOptions,
    handler: Arc<dyn MessageHandler>,
) -> Result<RunningConsumer, AmqpError> {
    if options.consumer.queue_name.is_empty() {
        return Err(AmqpError::MissingOption("queue_name"));
    }

    let owns_connection = options.connection.is_none();
    let connection = channel::acquire(
        connector,
        options.connection,
        &options.url,
        &options.connect_retry,
    )
    .await?;

    let consumer = Arc::new(QueueConsumer::new(connection.clone(), options.consumer));
    let events = match consumer.start().await {
        Ok(events) => events,
        Err(err) => {
            if owns_connection {
                if let Err(close_err) = connection.close().await {
                    warn!(error = close_err.to_string(), "failure to close connection");
                }
            }
            return Err(err);
        }
    };
    let faults = connection.errors();

    let (failure_tx, failure_rx) = oneshot::channel();
    tokio::spawn(dispatch(
        consumer.clone(),
        events,
        faults,
        handler,
        failure_tx,
    ));

    Ok(RunningConsumer {
        consumer,
        failure: failure_rx,
        owns_connection,
    })
}

async fn dispatch(
    consumer: Arc<QueueConsumer>,
    mut events: UnboundedReceiver<ConsumerEvent>,
    mut faults: UnboundedReceiver<AmqpError>,
    handler: Arc<dyn MessageHandler>,
    failure: Sender<AmqpError>,
) {
    let failed = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ConsumerEvent::Message(message)) => {
                    let consumer = consumer.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_message(&consumer, handler.as_ref(), &message).await {
                            debug!(error = err.to_string(), "message left unsettled");
                        }
                    });
                }
                Some(ConsumerEvent::Error(err)) => break Some(err),
                None => break None,
            },
            Some(err) = faults.recv() => break Some(err),
        }
    };

    let Some(err) = failed else {
        debug!(queue = consumer.queue_name(), "consumer cancelled");
        return;
    };

    error!(
        error = err.to_string(),
        queue = consumer.queue_name(),
        "consumer failed, stopping"
    );

    if let Err(stop_err) = consumer.stop().await {
        warn!(error = stop_err.to_string(), "failure to stop consumer");
    }

    if failure.send(err).is_err() {
        debug!("consumer failure not observed");
    }
}

/// Runs `handler` on `message` and settles the delivery according to its
/// outcome.
pub(crate) async fn handle_message(
    consumer: &QueueConsumer,
    handler: &dyn MessageHandler,
    message: &Message,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) =
        otel::new_span(&message.properties, &otel::tracer(), consumer.queue_name());

    debug!(
        delivery_tag = message.delivery_tag,
        queue = consumer.queue_name(),
        "received message"
    );

    let result = match handler.exec(message).await {
        Ok(()) => {
            debug!("message successfully processed");
            consumer.acknowledge_message(message).await
        }
        Err(err) if err.is_terminal() => {
            error!(
                error = err.to_string(),
                "removing message from queue - reason: undecodable payload"
            );
            span.record_error(&err);
            consumer.acknowledge_message(message).await
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                "error whiling handling msg, requeuing for latter"
            );
            span.record_error(&err);
            consumer.reject_message(message).await
        }
    };

    match &result {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            error!(
                error = err.to_string(),
                delivery_tag = message.delivery_tag,
                "error settling message"
            );
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    result
}
