// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! It includes support for Dead Letter Queues (DLQ) and retry queues, which together
//! implement delayed redelivery with a bounded number of attempts using only the
//! broker's TTL and dead-letter features.

use std::time::Duration;

/// Suffix appended to a queue name to build its dead letter queue name
pub const DLQ_SUFFIX: &str = "-dlq";
/// Suffix appended to a queue name to build its retry queue name
pub const RETRY_SUFFIX: &str = "-retry";

/// Bounded retry policy attached to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Retries allowed after the first attempt. A message whose retry count exceeds this
    /// value is dead-lettered without reaching its handler.
    pub max_attempts: u32,
    /// How long a failed message waits in the retry queue before being redelivered.
    pub delay: Duration,
}

impl Retry {
    /// Returns true when a delivery carrying `retry_count` has used up its budget.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_attempts
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Queues are durable, non-exclusive and never auto-deleted unless the builder says
/// otherwise. A queue built `with_retry` always gets a DLQ as well, because exhausted
/// messages need somewhere to land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq: bool,
    pub(crate) retry: Option<Retry>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            delete: false,
            exclusive: false,
            passive: false,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            dlq: false,
            retry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue transient, dropped on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the queue passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// Messages that exceed this TTL are dead-lettered when a DLQ or retry queue is
    /// configured, and dropped otherwise.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue named `<name>-dlq`.
    pub fn with_dlq(mut self) -> Self {
        self.dlq = true;
        self
    }

    /// Adds a retry queue named `<name>-retry` holding failed messages for `delay` before
    /// they flow back to this queue. Implies a DLQ.
    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = Some(Retry {
            max_attempts,
            delay,
        });
        self.dlq = true;
        self
    }

    pub fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    pub fn dlq_name(&self) -> Option<String> {
        self.dlq.then(|| format!("{}{}", self.name, DLQ_SUFFIX))
    }

    pub fn retry_name(&self) -> Option<String> {
        self.retry.map(|_| format!("{}{}", self.name, RETRY_SUFFIX))
    }
}

/// Configuration for binding a queue to an exchange.
///
/// The routing key is left empty for fanout exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with `exchange` and
    /// `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
