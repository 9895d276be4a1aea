// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Every queue handled by this crate comes with a fixed retry topology:
//!
//! - the main queue, durable, dead-lettering to `<queue>-dead-letter-exchange`
//! - a durable fanout exchange `<queue>-dead-letter-exchange`, bound back to
//!   the main queue so a rejected message is redelivered to it
//! - a durable terminal queue `<queue>-dead-letter-queue` that receives
//!   messages once they exhausted their rejections
//!
//! Declarations are idempotent at the broker, so installing the topology
//! repeatedly is safe. A conflicting existing declaration is an error.

use crate::{
    broker::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Routing key used to bind the main queue to its dead-letter exchange
pub const DEAD_LETTER_ROUTING_KEY: &str = "key";

/// Exchange rejected messages of `queue_name` are routed through.
pub fn dead_letter_exchange_name(queue_name: &str) -> String {
    format!("{queue_name}-dead-letter-exchange")
}

/// Queue holding messages of `queue_name` that exhausted their rejections.
pub fn dead_letter_queue_name(queue_name: &str) -> String {
    format!("{queue_name}-dead-letter-queue")
}

/// Which part of the topology an endpoint owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyScope {
    /// Main queue only
    Producer,
    /// Main queue, dead-letter exchange, dead-letter queue and the binding
    Consumer,
}

/// Names derived from a main queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    queue_name: String,
    dead_letter_exchange: String,
    dead_letter_queue: String,
}

impl QueueTopology {
    pub fn new(queue_name: &str) -> Self {
        QueueTopology {
            queue_name: queue_name.to_owned(),
            dead_letter_exchange: dead_letter_exchange_name(queue_name),
            dead_letter_queue: dead_letter_queue_name(queue_name),
        }
    }

    /// Overrides the terminal dead-letter queue name.
    pub fn with_dead_letter_queue(mut self, name: &str) -> Self {
        self.dead_letter_queue = name.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    /// Durable main queue dead-lettering to the dead-letter exchange. Producers
    /// and consumers declare it identically.
    pub fn main_queue(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue_name)
            .durable()
            .with_dead_letter_exchange(&self.dead_letter_exchange)
    }

    /// Declares the part of the topology `scope` requires.
    pub async fn install(
        &self,
        channel: Arc<dyn AmqpChannel>,
        scope: TopologyScope,
    ) -> Result<(), AmqpError> {
        let topology = AmqpTopology::new(channel).queue(self.main_queue());

        let topology = match scope {
            TopologyScope::Producer => topology,
            TopologyScope::Consumer => topology
                .exchange(
                    ExchangeDefinition::new(&self.dead_letter_exchange)
                        .fanout()
                        .durable(),
                )
                .queue(QueueDefinition::new(&self.dead_letter_queue).durable())
                .queue_binding(
                    QueueBinding::new(&self.queue_name)
                        .exchange(&self.dead_letter_exchange)
                        .routing_key(DEAD_LETTER_ROUTING_KEY),
                ),
        };

        topology.install().await
    }
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares exchanges, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Collects definitions and installs them through a channel.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    /// Creates an empty topology declared on `channel`.
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.queue_declare(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}
