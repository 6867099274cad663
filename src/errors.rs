// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! `AmqpError` groups every failure the crate can surface: configuration errors raised
//! while building the topology or registering handlers, transport errors raised by the
//! broker channel, and the per-message errors that the consume loop resolves through
//! ack/nack and never hands back to the caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The process configuration could not be loaded
    #[error("invalid configs `{0}`")]
    InvalidConfigs(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The topology was installed without a bound channel
    #[error("a channel is required to install the topology")]
    ChannelRequired,

    /// A handler registration received an empty queue name or message type
    #[error("invalid parameters `{0}`")]
    InvalidParameters(String),

    /// A handler was registered for a queue missing from the topology
    #[error("queue `{0}` was not declared in the topology")]
    QueueNotDeclared(String),

    /// A handler is already registered for the queue and message type
    #[error("a handler for `{1}` is already registered on queue `{0}`")]
    DuplicateHandler(String, String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to binding exchange `{0}` to exchange `{1}`")]
    BindingExchangeToExchangeError(String, String),

    /// Error serializing an outbound message
    #[error("failure to encode message `{0}`")]
    EncodingError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// A delivery arrived without one of the required properties
    #[error("missing message property `{0}`")]
    MissingHeader(&'static str),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error republishing a message to its retry queue
    #[error("failure to requeuing message `{0}`")]
    RequeuingMessageError(String),

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDQLError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
