// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Endpoint
//!
//! State shared by consumers and producers: the queue name, a unique tag, the
//! connection and the channel the endpoint exclusively owns.

use crate::{
    broker::{AmqpChannel, AmqpConnection},
    errors::AmqpError,
};
use std::{fmt, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

/// Role of an endpoint, embedded in its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Consumer,
    Producer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Consumer => f.write_str("consumer"),
            Role::Producer => f.write_str("producer"),
        }
    }
}

/// Generates `<queue>-<role>-<uuid>`, unique per endpoint instance.
pub fn generate_tag(queue_name: &str, role: Role) -> String {
    format!("{}-{}-{}", queue_name, role, Uuid::new_v4())
}

pub(crate) struct QueueEndpoint {
    queue_name: String,
    tag: String,
    connection: Arc<dyn AmqpConnection>,
    channel: RwLock<Option<Arc<dyn AmqpChannel>>>,
}

impl QueueEndpoint {
    pub(crate) fn new(queue_name: &str, role: Role, connection: Arc<dyn AmqpConnection>) -> Self {
        QueueEndpoint {
            queue_name: queue_name.to_owned(),
            tag: generate_tag(queue_name, role),
            connection,
            channel: RwLock::new(None),
        }
    }

    pub(crate) fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn connection(&self) -> Arc<dyn AmqpConnection> {
        self.connection.clone()
    }

    /// Creates the endpoint's channel and keeps a reference to it.
    pub(crate) async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = self.connection.create_channel().await?;
        *self.channel.write().await = Some(channel.clone());
        Ok(channel)
    }

    pub(crate) async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or(AmqpError::ChannelNotInitialized)
    }

    /// Drops the channel reference without talking to the broker.
    pub(crate) async fn discard_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.channel.write().await.take()
    }

    /// Cancels the tag and closes the channel.
    ///
    /// The channel reference is taken out before the broker calls, so it is
    /// cleared whether they succeed or not and a second call is a no-op.
    pub(crate) async fn stop(&self) -> Result<(), AmqpError> {
        let Some(channel) = self.discard_channel().await else {
            return Ok(());
        };

        debug!(tag = self.tag.as_str(), "stopping");

        let result = match channel.basic_cancel(&self.tag).await {
            Ok(()) => channel.close().await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                tag = self.tag.as_str(),
                "error closing channel"
            );
        }

        result
    }
}
