// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Queue Producer
//!
//! Publishes envelope-encoded messages directly to a queue through the
//! default exchange, retrying transient publish failures such as broker flow
//! control.

use crate::{
    broker::{AmqpConnection, Connector},
    channel,
    codec::{self, ToCanonicalForm, CONTENT_TYPE},
    config::ProducerOptions,
    endpoint::{QueueEndpoint, Role},
    errors::AmqpError,
    otel,
    retry::RetryPolicy,
    topology::{QueueTopology, TopologyScope},
};
use lapin::{types::ShortString, BasicProperties};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};
use uuid::Uuid;

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Publishes envelopes to one queue through the default exchange.
///
/// The producer declares the main queue only; the dead-letter part of the
/// topology belongs to consumers.
pub struct QueueProducer {
    endpoint: QueueEndpoint,
    topology: QueueTopology,
    publish_retry: RetryPolicy,
}

impl fmt::Debug for QueueProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProducer")
            .field("tag", &self.endpoint.tag())
            .field("queue", &self.topology.queue_name())
            .finish()
    }
}

impl QueueProducer {
    /// Creates a producer. Nothing is sent to the broker before `start`.
    ///
    /// # Parameters
    /// * `connection` - The connection the producer's channel is created on
    /// * `options` - Queue name and publish retry policy
    pub fn new(connection: Arc<dyn AmqpConnection>, options: ProducerOptions) -> Self {
        QueueProducer {
            endpoint: QueueEndpoint::new(&options.queue_name, Role::Producer, connection),
            topology: QueueTopology::new(&options.queue_name),
            publish_retry: options.publish_retry,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.endpoint.queue_name()
    }

    pub fn tag(&self) -> &str {
        self.endpoint.tag()
    }

    /// Opens the channel and declares the main queue. Channel faults are
    /// reported on the returned receiver.
    pub async fn start(&self) -> Result<UnboundedReceiver<AmqpError>, AmqpError> {
        let channel = self.endpoint.open_channel().await?;

        if let Err(err) = self
            .topology
            .install(channel.clone(), TopologyScope::Producer)
            .await
        {
            error!(
                error = err.to_string(),
                queue = self.queue_name(),
                "failure to start producer"
            );
            self.endpoint.discard_channel().await;
            return Err(err);
        }

        debug!(tag = self.tag(), "producer started");
        Ok(channel.errors())
    }

    /// Encodes `value` and publishes it to the queue.
    ///
    /// Encoding failures are returned immediately; publish failures are
    /// retried and the last one is returned once attempts are exhausted.
    pub async fn send_message<T>(&self, value: &T) -> Result<(), AmqpError>
    where
        T: ToCanonicalForm + ?Sized,
    {
        let payload = codec::encode(value)?;
        let channel = self.endpoint.channel().await?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_headers(otel::context_headers());

        self.publish_retry
            .run("publish", || {
                channel.basic_publish("", self.queue_name(), &payload, properties.clone())
            })
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = self.queue_name(),
                    "error publishing message"
                );
                err
            })
    }

    /// Closes the channel. Safe to call again.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.endpoint.stop().await
    }
}

/// Arguments of `create_producer`.
pub struct CreateProducerOptions {
    pub url: String,
    /// Reused as-is instead of opening a new connection
    pub connection: Option<Arc<dyn AmqpConnection>>,
    pub producer: ProducerOptions,
    pub connect_retry: RetryPolicy,
}

impl CreateProducerOptions {
    pub fn new(url: &str, producer: ProducerOptions) -> Self {
        CreateProducerOptions {
            url: url.to_owned(),
            connection: None,
            producer,
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

/// A started producer with the receiver of its channel faults.
pub struct RunningProducer {
    pub producer: Arc<QueueProducer>,
    pub errors: UnboundedReceiver<AmqpError>,
}

/// Acquires a connection and starts a producer on it.
pub async fn create_producer(
    connector: &dyn Connector,
    options: CreateProducerOptions,
) -> Result<RunningProducer, AmqpError> {
    if options.producer.queue_name.is_empty() {
        return Err(AmqpError::MissingOption("queue_name"));
    }

    let connection = channel::acquire(
        connector,
        options.connection,
        &options.url,
        &options.connect_retry,
    )
    .await?;

    let producer = Arc::new(QueueProducer::new(connection, options.producer));
    let errors = producer.start().await?;

    Ok(RunningProducer { producer, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{AmqpChannel, MockAmqpChannel, MockAmqpConnection, MockConnector},
        errors::CodecError,
    };
    use serde::{Serialize, Serializer};
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };
    use tokio::sync::mpsc;

    #[derive(Serialize)]
    struct Ping {
        id: u32,
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not today"))
        }
    }

    fn started_channel() -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_queue_declare()
            .withf(|def| def.name == "orders" && def.dead_letter_exchange.is_some())
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_exchange_declare().never();
        channel.expect_queue_bind().never();
        channel
            .expect_errors()
            .returning(|| mpsc::unbounded_channel().1);
        channel
    }

    fn connection_with(channel: MockAmqpChannel) -> Arc<dyn AmqpConnection> {
        let mut connection = MockAmqpConnection::new();
        connection
            .expect_create_channel()
            .return_once(move || Ok(Arc::new(channel) as Arc<dyn AmqpChannel>));
        Arc::new(connection)
    }

    fn fast_options() -> ProducerOptions {
        ProducerOptions::new("orders").publish_retry(
            RetryPolicy::publish()
                .with_max_attempts(3)
                .with_delay(Duration::from_millis(1))
                .without_jitter(),
        )
    }

    #[tokio::test]
    async fn should_publish_to_queue_through_default_exchange() {
        let mut channel = started_channel();
        channel
            .expect_basic_publish()
            .withf(|exchange, key, payload, props| {
                exchange.is_empty()
                    && key == "orders"
                    && !payload.is_empty()
                    && props.content_type().as_ref().map(|c| c.as_str()) == Some(CONTENT_TYPE)
                    && props.delivery_mode() == &Some(DELIVERY_MODE_PERSISTENT)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let producer = QueueProducer::new(connection_with(channel), fast_options());
        producer.start().await.unwrap();

        producer.send_message(&Ping { id: 1 }).await.unwrap();
    }

    #[tokio::test]
    async fn should_not_retry_encoding_failures() {
        let mut channel = started_channel();
        channel.expect_basic_publish().never();

        let producer = QueueProducer::new(connection_with(channel), fast_options());
        producer.start().await.unwrap();

        assert!(matches!(
            producer.send_message(&Unserializable).await,
            Err(AmqpError::Codec(CodecError::EncodeError(_)))
        ));
    }

    #[tokio::test]
    async fn should_retry_transient_publish_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut channel = started_channel();
        channel
            .expect_basic_publish()
            .times(2)
            .returning(move |_, _, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AmqpError::PublishingError("flow control".to_owned()))
                } else {
                    Ok(())
                }
            });

        let producer = QueueProducer::new(connection_with(channel), fast_options());
        producer.start().await.unwrap();

        producer.send_message(&Ping { id: 1 }).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_surface_last_error_after_exhausting_retries() {
        let mut channel = started_channel();
        channel
            .expect_basic_publish()
            .times(3)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("blocked".to_owned())));

        let producer = QueueProducer::new(connection_with(channel), fast_options());
        producer.start().await.unwrap();

        assert_eq!(
            producer.send_message(&Ping { id: 1 }).await,
            Err(AmqpError::PublishingError("blocked".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_require_start_before_sending() {
        let producer = QueueProducer::new(Arc::new(MockAmqpConnection::new()), fast_options());

        assert_eq!(
            producer.send_message(&Ping { id: 1 }).await,
            Err(AmqpError::ChannelNotInitialized)
        );
    }

    #[tokio::test]
    async fn should_reject_empty_queue_name() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let result = create_producer(
            &connector,
            CreateProducerOptions::new("amqp://localhost", ProducerOptions::new("")),
        )
        .await;

        assert!(matches!(result, Err(AmqpError::MissingOption("queue_name"))));
    }

    #[tokio::test]
    async fn should_reuse_injected_connection() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let running = create_producer(
            &connector,
            CreateProducerOptions::new("amqp://localhost", fast_options())
                .connection(connection_with(started_channel())),
        )
        .await
        .unwrap();

        assert!(running.producer.tag().starts_with("orders-producer-"));
    }
}
