// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The queue layer talks to RabbitMQ only through the traits in this module.
//! `channel.rs` implements them on top of lapin; tests implement them with
//! mockall.
//!
//! Asynchronous failures are exposed as channels instead of callbacks: every
//! call to `errors()` registers a new listener, and dropping the returned
//! receiver removes it again.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{message::Delivery, BasicProperties};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[cfg(test)]
use mockall::automock;

/// Stream of messages delivered to a consumer tag. The stream ends when the
/// broker cancels the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// A message delivered by the broker.
///
/// The broker keeps ownership of the delivery until it is acknowledged or
/// rejected through the channel that received it.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub content: Vec<u8>,
}

impl Message {
    /// Creates a message with default properties.
    pub fn new(delivery_tag: u64, content: Vec<u8>) -> Self {
        Message {
            delivery_tag,
            content,
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Message {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            content: delivery.data,
        }
    }
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live broker connection, shared by every channel created from it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closes the connection and every channel created from it.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Registers a listener for connection failures.
    fn errors(&self) -> UnboundedReceiver<AmqpError>;
}

/// A channel multiplexed over a connection. Each consumer and producer owns
/// exactly one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Registers a listener for channel faults (failed preconditions or an
    /// administrative close).
    fn errors(&self) -> UnboundedReceiver<AmqpError>;
}
