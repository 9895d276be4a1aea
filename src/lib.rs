// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Queues
//!
//! Reliable queue consumers and producers on top of lapin:
//!
//! - connections acquired with bounded, jittered retries
//! - MessagePack `{type, data}` envelopes validated against registered types
//! - a per-queue retry topology: rejected messages come back through a
//!   dead-letter exchange until a rejection limit, then land in a terminal
//!   dead-letter queue
//! - a managed consumer that restarts after channel or connection failures

mod endpoint;
mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod logging;
pub mod managed;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod topology;
