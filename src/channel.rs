// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels, and defines the
//! `AmqpChannel` capability the rest of the crate talks to. Topology installation,
//! publishing and consuming all go through this trait so that the broker driver stays
//! behind a single seam.

use crate::{configs::Configs, errors::AmqpError};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::{debug, error};

/// A message received from a queue.
///
/// The delivery is settled through [`AmqpChannel::ack`] or [`AmqpChannel::nack`] using its
/// `delivery_tag`.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: AMQPProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Stream of deliveries for a single consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Broker operations used by the topology, publisher and dispatcher.
///
/// Implementations must be safe to share between the per-queue consume loops.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// [`AmqpChannel`] backed by a lapin channel.
pub struct LapinChannel {
    channel: Arc<Channel>,
}

impl LapinChannel {
    pub fn new(channel: Arc<Channel>) -> Arc<LapinChannel> {
        Arc::new(LapinChannel { channel })
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind, options, args)
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(format!("{}: {}", name, err)))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(name, options, args)
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(format!("{}: {}", name, err)))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                AmqpError::BindingExchangeToExchangeError(source.to_owned(), destination.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
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
            .map_err(|err| AmqpError::ConsumerDeclarationError(err.to_string()))?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// This function establishes a connection to RabbitMQ using the `rabbitmq` section of
/// `cfg`, names the connection after the application, creates a channel on it and
/// applies the configured prefetch.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), rabbitmq_messaging::errors::AmqpError> {
/// use rabbitmq_messaging::{channel::new_amqp_channel, configs::Configs};
///
/// let cfg = Configs::from_env()?;
/// let (_conn, channel) = new_amqp_channel(&cfg).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(cfg: &Configs) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;

    if let Err(err) = channel
        .basic_qos(cfg.rabbitmq.prefetch, BasicQosOptions { global: false })
        .await
    {
        error!(error = err.to_string(), "error to configure the channel qos");
        return Err(AmqpError::QoSDeclarationError(err.to_string()));
    }

    debug!("channel created");
    Ok((Arc::new(conn), Arc::new(channel)))
}
