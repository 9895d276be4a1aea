// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module acquires broker connections and implements the broker traits
//! on top of lapin. `acquire` reuses an injected connection as-is, or
//! connects with a bounded retry policy.

use crate::{
    broker::{AmqpChannel, AmqpConnection, Connector, DeliveryStream, Message},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    retry::RetryPolicy,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info};

/// Returns `existing` unchanged when given, otherwise connects to `url`
/// retrying according to `policy`.
///
/// Exhausting the policy fails with `AmqpError::ConnectionError` carrying
/// the last underlying cause. No error listeners are installed here; callers
/// subscribe to `AmqpConnection::errors` themselves.
pub async fn acquire(
    connector: &dyn Connector,
    existing: Option<Arc<dyn AmqpConnection>>,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
    if let Some(connection) = existing {
        debug!("reusing the provided amqp connection");
        return Ok(connection);
    }

    info!("attempting to connect to amqp");

    match policy.run("connect", || connector.connect(url)).await {
        Ok(connection) => {
            debug!("amqp connected");
            Ok(connection)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            let cause = match err {
                AmqpError::ConnectionError(cause) => cause,
                other => other.to_string(),
            };
            Err(AmqpError::ConnectionError(cause))
        }
    }
}

/// Fans a single lapin error hook out to any number of channel listeners.
#[derive(Clone, Default)]
struct ErrorListeners {
    senders: Arc<Mutex<Vec<UnboundedSender<AmqpError>>>>,
}

impl ErrorListeners {
    fn subscribe(&self) -> UnboundedReceiver<AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|s| !s.is_closed());
        senders.push(sender);
        receiver
    }

    fn emit(&self, err: AmqpError) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.send(err.clone()).is_ok());
    }
}

/// Opens lapin connections identified by a connection name.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> Self {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(url, options).await {
            Ok(conn) => Ok(Arc::new(LapinConnection::new(conn))),
            Err(err) => {
                debug!(error = err.to_string(), "connection attempt failed");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// `AmqpConnection` backed by a lapin connection.
pub struct LapinConnection {
    connection: Connection,
    listeners: ErrorListeners,
}

impl LapinConnection {
    pub fn new(connection: Connection) -> Self {
        let listeners = ErrorListeners::default();
        let hook = listeners.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            hook.emit(AmqpError::ConnectionLost(err.to_string()));
        });

        LapinConnection {
            connection,
            listeners,
        }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp connection...");
        self.connection.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing connection");
            AmqpError::ConnectionCloseError(err.to_string())
        })
    }

    fn errors(&self) -> UnboundedReceiver<AmqpError> {
        self.listeners.subscribe()
    }
}

/// `AmqpChannel` backed by a lapin channel.
pub struct LapinChannel {
    channel: Channel,
    listeners: ErrorListeners,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        let listeners = ErrorListeners::default();
        let hook = listeners.clone();
        channel.on_error(move |err| {
            error!(error = err.to_string(), "amqp channel error");
            hook.emit(AmqpError::ChannelFault(err.to_string()));
        });

        LapinChannel { channel, listeners }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    ..Default::default()
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Message::from)
                    .map_err(|err| AmqpError::ChannelFault(err.to_string()))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError(err.to_string())
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error cancelling consumer");
                AmqpError::CancelError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing channel");
            AmqpError::CloseError(err.to_string())
        })
    }

    fn errors(&self) -> UnboundedReceiver<AmqpError> {
        self.listeners.subscribe()
    }
}
