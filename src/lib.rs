// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Messaging
//!
//! Declares exchange/queue topologies with dead-letter and delayed-retry wiring, publishes
//! JSON messages carrying trace context, and dispatches consumed deliveries to typed
//! handlers with a bounded retry policy.
//!
//! ```no_run
//! # async fn run() -> Result<(), rabbitmq_messaging::errors::AmqpError> {
//! use rabbitmq_messaging::{
//!     channel::{new_amqp_channel, LapinChannel},
//!     configs::Configs,
//!     dispatcher::RabbitMQDispatcher,
//!     queue::QueueDefinition,
//!     topology::{AmqpTopology, Topology},
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let cfg = Configs::from_env()?;
//! let (_conn, channel) = new_amqp_channel(&cfg).await?;
//! let channel = LapinChannel::new(channel);
//!
//! let topology = AmqpTopology::new(channel.clone())
//!     .queue(QueueDefinition::new("orders").with_retry(2, Duration::from_millis(500)));
//! topology.install().await?;
//!
//! let dispatcher = RabbitMQDispatcher::new(channel, &topology);
//! dispatcher.consume_blocking(CancellationToken::new()).await
//! # }
//! ```

mod consumer;
mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;
