// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers every failure the queue layer can surface: connection
//! acquisition, topology declaration, channel faults, acknowledgement and
//! publishing. `CodecError` covers the envelope codec and is wrapped by
//! `AmqpError::Codec` when it crosses into the queue layer.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carry the stringified cause so the enum stays `Clone`, which the
/// managed consumer relies on to broadcast failures to several listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// A required option was not provided
    #[error("expecting a `{0}` option")]
    MissingOption(&'static str),

    /// Every connection attempt failed; carries the last underlying cause
    #[error("unable to connect to the broker: {0}")]
    ConnectionError(String),

    /// The connection reported an error after it was established
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// An operation needing a channel was called before `start` or after `stop`
    #[error("channel not initialized")]
    ChannelNotInitialized,

    /// The broker closed the channel or a precondition failed
    #[error("channel fault: {0}")]
    ChannelFault(String),

    /// `start` was called on an instance that already left the idle state
    #[error("cannot start from state `{0}`")]
    InvalidState(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error publishing a message to the dead-letter queue
    #[error("failure to publish to dlq: {0}")]
    PublishingToDLQError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error cancelling a consumer tag
    #[error("failure to cancel consumer `{0}`")]
    CancelError(String),

    /// Error closing a channel
    #[error("failure to close channel: {0}")]
    CloseError(String),

    /// Error closing a connection
    #[error("failure to close connection: {0}")]
    ConnectionCloseError(String),

    /// A user supplied message handler failed
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// Envelope encoding or decoding failed
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AmqpError {
    /// Whether redelivering the message that produced this error can never
    /// succeed. Terminal messages are dropped instead of rejected.
    pub fn is_terminal(&self) -> bool {
        match self {
            AmqpError::Codec(err) => err.is_terminal(),
            _ => false,
        }
    }
}

/// Errors produced by the message envelope codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("message could not be encoded: {0}")]
    EncodeError(String),

    /// The bytes are not a `{type, data}` envelope
    #[error("error decoding event: {0}")]
    DecodeError(String),

    #[error("converting data requires a registered \"type\", got `{0}`")]
    TypeRequired(String),

    #[error("could not parse data `{0}`")]
    ParseDataError(String),

    #[error("error converting data: {}", .0.join(","))]
    ValidationError(Vec<String>),
}

impl CodecError {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CodecError::EncodeError(_))
    }
}
