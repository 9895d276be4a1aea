// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Queue Consumer
//!
//! `QueueConsumer` owns one channel on a shared connection, limits the number
//! of unacknowledged deliveries with a prefetch count and implements bounded
//! retries on top of the broker's dead-lettering:
//!
//! - a rejected message is nacked without requeue, so the broker routes it
//!   through `<queue>-dead-letter-exchange` back to the main queue and
//!   increments the `count` of the matching `x-death` record
//! - once that count reaches the configured maximum the content is published
//!   to the terminal dead-letter queue and the original delivery is acked

use crate::{
    broker::{AmqpConnection, Message},
    config::ConsumerOptions,
    endpoint::{QueueEndpoint, Role},
    errors::AmqpError,
    topology::{QueueTopology, TopologyScope},
};
use futures_util::StreamExt;
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use std::{fmt, sync::Arc};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver},
    RwLock,
};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Queue the x-death record was produced for
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Why the broker dead-lettered the message
pub const AMQP_HEADERS_REASON: &str = "reason";

/// Dead-letter reason set by the broker for nacked messages
pub const REJECTED_REASON: &str = "rejected";

/// Lifecycle of a `QueueConsumer`. Transitions only move forward; a
/// stopped consumer is never restarted, a new one is created instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Starting,
    Consuming,
    Stopping,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Starting => "starting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// What a started consumer reports.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Message(Message),
    /// The channel failed; the consumer will not deliver anything else
    Error(AmqpError),
}

/// One entry of the `x-death` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionRecord {
    pub queue: String,
    pub reason: String,
    pub count: i64,
}

/// Finds the first `x-death` record for `queue` with reason `rejected`.
pub fn rejection_record(props: &AMQPProperties, queue: &str) -> Option<RejectionRecord> {
    let headers = props.headers().as_ref()?;

    let AMQPValue::FieldArray(records) = headers.inner().get(AMQP_HEADERS_X_DEATH)? else {
        return None;
    };

    records.as_slice().iter().find_map(|record| {
        let AMQPValue::FieldTable(table) = record else {
            return None;
        };
        let fields = table.inner();

        let record_queue = fields.get(AMQP_HEADERS_QUEUE).and_then(as_text)?;
        let reason = fields.get(AMQP_HEADERS_REASON).and_then(as_text)?;
        if record_queue != queue || reason != REJECTED_REASON {
            return None;
        }

        Some(RejectionRecord {
            queue: record_queue.to_owned(),
            reason: reason.to_owned(),
            count: fields
                .get(AMQP_HEADERS_COUNT)
                .and_then(as_count)
                .unwrap_or_default(),
        })
    })
}

fn as_text(value: &AMQPValue) -> Option<&str> {
    match value {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
        AMQPValue::ShortString(value) => Some(value.as_str()),
        _ => None,
    }
}

fn as_count(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Consumes one queue over a dedicated channel.
///
/// Deliveries must be settled through `acknowledge_message` or
/// `reject_message` on the same consumer, as delivery tags are only valid on
/// the channel that received them.
pub struct QueueConsumer {
    endpoint: QueueEndpoint,
    topology: QueueTopology,
    options: ConsumerOptions,
    state: RwLock<ConsumerState>,
}

impl fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("tag", &self.endpoint.tag())
            .field("topology", &self.topology)
            .field("options", &self.options)
            .finish()
    }
}

impl QueueConsumer {
    /// Creates an idle consumer. Nothing is sent to the broker before `start`.
    ///
    /// # Parameters
    /// * `connection` - The connection the consumer's channel is created on
    /// * `options` - Queue name, prefetch count and rejection limit
    pub fn new(connection: Arc<dyn AmqpConnection>, options: ConsumerOptions) -> Self {
        let mut topology = QueueTopology::new(&options.queue_name);
        if let Some(name) = &options.dead_letter_queue_name {
            topology = topology.with_dead_letter_queue(name);
        }

        QueueConsumer {
            endpoint: QueueEndpoint::new(&options.queue_name, Role::Consumer, connection),
            topology,
            options,
            state: RwLock::new(ConsumerState::Idle),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.endpoint.queue_name()
    }

    pub fn tag(&self) -> &str {
        self.endpoint.tag()
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// The connection the consumer was created on.
    pub fn connection(&self) -> Arc<dyn AmqpConnection> {
        self.endpoint.connection()
    }

    pub async fn state(&self) -> ConsumerState {
        *self.state.read().await
    }

    /// Opens the channel, applies the prefetch limit, installs the retry
    /// topology and starts consuming.
    ///
    /// Deliveries and channel faults are reported on the returned receiver.
    /// A consumer can be started once; a failed start leaves it `Stopped`.
    pub async fn start(&self) -> Result<UnboundedReceiver<ConsumerEvent>, AmqpError> {
        {
            let mut state = self.state.write().await;
            if *state != ConsumerState::Idle {
                return Err(AmqpError::InvalidState(state.to_string()));
            }
            *state = ConsumerState::Starting;
        }

        match self.consume().await {
            Ok(events) => {
                *self.state.write().await = ConsumerState::Consuming;
                debug!(tag = self.tag(), "consumer started");
                Ok(events)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue_name(),
                    "failure to start consumer"
                );

                if let Some(channel) = self.endpoint.discard_channel().await {
                    if let Err(close_err) = channel.close().await {
                        warn!(error = close_err.to_string(), "failure to close channel");
                    }
                }

                *self.state.write().await = ConsumerState::Stopped;
                Err(err)
            }
        }
    }

    async fn consume(&self) -> Result<UnboundedReceiver<ConsumerEvent>, AmqpError> {
        let channel = self.endpoint.open_channel().await?;

        channel.basic_qos(self.options.prefetch_count).await?;
        self.topology
            .install(channel.clone(), TopologyScope::Consumer)
            .await?;

        let mut faults = channel.errors();
        let mut deliveries = channel
            .basic_consume(self.queue_name(), self.tag())
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = self.tag().to_owned();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    delivery = deliveries.next() => match delivery {
                        Some(Ok(message)) => ConsumerEvent::Message(message),
                        Some(Err(err)) => ConsumerEvent::Error(err),
                        None => {
                            debug!(tag = tag.as_str(), "consumer cancelled");
                            break;
                        }
                    },
                    Some(err) = faults.recv() => ConsumerEvent::Error(err),
                    _ = tx.closed() => break,
                };

                // a closing channel fails both the stream and the listener
                let failed = matches!(event, ConsumerEvent::Error(_));
                if tx.send(event).is_err() || failed {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Acknowledges a single delivery.
    ///
    /// # Returns
    /// `AmqpError::ChannelNotInitialized` before `start` or after `stop`
    pub async fn acknowledge_message(&self, message: &Message) -> Result<(), AmqpError> {
        let channel = self.endpoint.channel().await?;
        channel.basic_ack(message.delivery_tag).await
    }

    /// Sends `message` around the retry cycle once more, or to the terminal
    /// dead-letter queue when it was already rejected too often.
    pub async fn reject_message(&self, message: &Message) -> Result<(), AmqpError> {
        let channel = self.endpoint.channel().await?;

        let count = rejection_record(&message.properties, self.queue_name())
            .map(|record| record.count)
            .unwrap_or_default();

        if count < self.options.max_message_rejections {
            debug!(
                delivery_tag = message.delivery_tag,
                count, "rejecting message for redelivery"
            );
            return channel.basic_nack(message.delivery_tag, false).await;
        }

        warn!(
            delivery_tag = message.delivery_tag,
            count,
            dead_letter_queue = self.topology.dead_letter_queue(),
            "too many rejections, sending to dlq"
        );

        channel
            .basic_publish(
                "",
                self.topology.dead_letter_queue(),
                &message.content,
                message.properties.clone(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling sending to dlq");
                AmqpError::PublishingToDLQError(err.to_string())
            })?;

        channel.basic_ack(message.delivery_tag).await
    }

    /// Cancels the consumer tag and closes the channel. Safe to call again.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        {
            let mut state = self.state.write().await;
            if *state == ConsumerState::Stopped {
                return Ok(());
            }
            *state = ConsumerState::Stopping;
        }

        let result = self.endpoint.stop().await;
        *self.state.write().await = ConsumerState::Stopped;
        result
    }
}
