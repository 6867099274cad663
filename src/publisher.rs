// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to RabbitMQ exchanges. Every message is stamped with a
//! fresh message id, the application identity, its `type` tag, a zero retry count and the
//! trace context of the caller. Publishing is not retried here: retries only happen on the
//! consumer side, through the retry queue.

use crate::{
    channel::AmqpChannel,
    configs::Configs,
    errors::AmqpError,
    message::{initial_headers, HeaderValues, Message, JSON_CONTENT_TYPE},
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

/// A message ready to be published, with an already encoded payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    /// Exchange to publish to. Empty for the default exchange.
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    /// Extra headers added next to the ones stamped by the publisher.
    pub headers: Option<HashMap<String, HeaderValues>>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes an encoded message.
    async fn publish_raw(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
    app_id: String,
    user_id: String,
}

impl RabbitMQPublisher {
    /// Creates a publisher stamping `app-id` and `user-id` from `cfg`.
    pub fn new(channel: Arc<dyn AmqpChannel>, cfg: &Configs) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            channel,
            app_id: cfg.app.name.clone(),
            user_id: cfg.rabbitmq.user.clone(),
        })
    }

    /// Encodes `msg` as JSON and publishes it to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `ctx` - Context whose trace is injected into the message headers
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `msg` - Message to encode
    ///
    /// # Returns
    /// Ok(()) once published, EncodingError when `msg` cannot be encoded or the channel's
    /// error when publishing fails
    pub async fn publish<M: Message>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        msg: &M,
    ) -> Result<(), AmqpError> {
        let data = serde_json::to_vec(msg).map_err(|err| {
            error!(error = err.to_string(), "error encoding message");
            AmqpError::EncodingError(err.to_string())
        })?;

        self.publish_raw(
            ctx,
            &PublishMessage {
                to: exchange.to_owned(),
                key: Some(routing_key.to_owned()),
                msg_type: Some(M::MESSAGE_TYPE.to_owned()),
                data,
                headers: None,
            },
        )
        .await
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish_raw(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        if let Some(headers) = &infos.headers {
            for (key, value) in headers {
                btree.insert(ShortString::from(key.as_str()), value.clone().into());
            }
        }

        btree.extend(initial_headers().inner().clone());
        otel::inject(ctx, &mut btree);

        let msg_id = Uuid::new_v4().to_string();
        let msg_type = infos.msg_type.clone().unwrap_or_default();

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(msg_type.clone()))
            .with_message_id(ShortString::from(msg_id.clone()))
            .with_app_id(ShortString::from(self.app_id.clone()))
            .with_user_id(ShortString::from(self.user_id.clone()))
            .with_headers(FieldTable::from(btree));

        match self
            .channel
            .publish(
                &infos.to,
                &infos.key.clone().unwrap_or_default(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &infos.data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    msg_id, msg_type, "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(msg_id, msg_type, exchange = infos.to, "message published");
                Ok(())
            }
        }
    }
}
