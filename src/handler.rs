// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Handlers are written against a concrete [`Message`] type. The dispatcher keeps them
//! behind a type-erased entry created at registration time, which decodes the JSON body
//! into the registered type before the handler is invoked.

use crate::{
    errors::AmqpError,
    message::{DeliveryMetadata, Message},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use std::{marker::PhantomData, sync::Arc};
use thiserror::Error;

/// Outcome of a failed handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing might succeed later. The message goes through the retry queue of its
    /// queue when one is configured, and is dead-lettered otherwise.
    #[error("retryable failure `{0}`")]
    Retryable(String),

    /// Processing will never succeed. The message is dead-lettered.
    #[error("failure `{0}`")]
    Failed(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// Handles messages of type `M` consumed from a queue.
#[async_trait]
pub trait ConsumerHandler<M: Message>: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        msg: M,
        metadata: &DeliveryMetadata,
    ) -> Result<(), HandlerError>;
}

pub(crate) type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Type-erased handler entry kept by the dispatcher.
pub(crate) trait Dispatch: Send + Sync {
    /// Decodes `data` into the registered message type and returns the handler call,
    /// ready to be awaited.
    fn prepare(
        &self,
        data: &[u8],
        ctx: Context,
        metadata: DeliveryMetadata,
    ) -> Result<HandlerFuture, AmqpError>;
}

pub(crate) struct TypedHandler<M, H> {
    handler: Arc<H>,
    _msg: PhantomData<fn() -> M>,
}

impl<M, H> TypedHandler<M, H> {
    pub(crate) fn new(handler: Arc<H>) -> Self {
        TypedHandler {
            handler,
            _msg: PhantomData,
        }
    }
}

impl<M, H> Dispatch for TypedHandler<M, H>
where
    M: Message,
    H: ConsumerHandler<M> + 'static,
{
    fn prepare(
        &self,
        data: &[u8],
        ctx: Context,
        metadata: DeliveryMetadata,
    ) -> Result<HandlerFuture, AmqpError> {
        let msg = serde_json::from_slice::<M>(data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        let handler = self.handler.clone();
        Ok(Box::pin(async move {
            handler.exec(&ctx, msg, &metadata).await
        }))
    }
}
