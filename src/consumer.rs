// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Settles a single delivery: validate its properties, route it by type, decode it, check
//! the retry budget, call the handler and finally ack, retry or dead-letter it.
//!
//! Dead-lettering depends on the queue wiring. A queue with a retry queue dead-letters to
//! `<name>-retry`, so terminal rejections are published straight to `<name>-dlq` and the
//! original is acked; any other queue is nacked without requeue and the broker applies
//! its own dead-letter configuration, if any.

use crate::{
    channel::{AmqpChannel, Delivery},
    dispatcher::QueueConsumers,
    errors::AmqpError,
    message::{with_count, DeliveryMetadata},
    otel,
    queue::QueueDefinition,
};
use lapin::options::BasicPublishOptions;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use tracing::{debug, error, warn};

/// Consumes and settles a delivery received on the queue of `consumers`.
///
/// Every delivery is settled exactly once: acked, republished to the retry queue and then
/// acked, or dead-lettered. Per-message failures are resolved here and only transport
/// failures while settling are returned.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for the consumer span
/// * `delivery` - The delivery to settle
/// * `consumers` - Definition of the queue the delivery came from and its handlers
/// * `channel` - Channel used to ack, nack and republish
///
/// # Returns
/// Ok(()) once the delivery is settled, or the AmqpError raised while settling it
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    consumers: &QueueConsumers,
    channel: &dyn AmqpChannel,
) -> Result<(), AmqpError> {
    let queue_def = &consumers.queue_def;

    let metadata = match DeliveryMetadata::extract(&delivery.properties) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = queue_def.name,
                "rejecting delivery with missing properties"
            );
            return dead_letter(channel, delivery, queue_def).await;
        }
    };

    let msg_id = metadata.message_id.as_str();
    let msg_type = metadata.msg_type.clone();
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &msg_type);

    debug!(
        msg_id,
        msg_type,
        retry_count = metadata.retry_count,
        exchange = delivery.exchange,
        "received"
    );

    let Some(handler) = consumers.handlers.get(&msg_type) else {
        debug!(msg_id, msg_type, "removing message from queue - reason: unsupported msg type");
        otel::fail(&mut span, "unsupported msg type");
        return ack(channel, delivery, &mut span).await;
    };

    let call = match handler.prepare(&delivery.data, ctx, metadata.clone()) {
        Ok(call) => call,
        Err(err) => {
            error!(error = err.to_string(), msg_id, msg_type, "failure to decode message");
            span.record_error(&err);
            otel::fail(&mut span, "failure to decode message");
            return dead_letter(channel, delivery, queue_def).await;
        }
    };

    let retry = queue_def.retry();

    if let Some(retry) = retry {
        if retry.exhausted(metadata.retry_count) {
            error!(
                msg_id,
                msg_type,
                retry_count = metadata.retry_count,
                "too many attempts, sending to dlq"
            );
            otel::fail(&mut span, "too many attempts");
            return dead_letter(channel, delivery, queue_def).await;
        }
    }

    match call.await {
        Ok(()) => {
            debug!(msg_id, msg_type, "message successfully processed");
            let result = ack(channel, delivery, &mut span).await;
            if result.is_ok() {
                span.set_status(Status::Ok);
            }
            result
        }
        Err(err) if err.is_retryable() && retry.is_some() => {
            warn!(
                error = err.to_string(),
                msg_id,
                msg_type,
                retry_count = metadata.retry_count,
                "error whiling handling msg, requeuing for latter"
            );
            span.record_error(&err);
            otel::fail(&mut span, "handler failure, retrying");
            republish(
                channel,
                delivery,
                queue_def,
                metadata.retry_count.saturating_add(1),
            )
            .await
        }
        Err(err) => {
            error!(error = err.to_string(), msg_id, msg_type, "error whiling handling msg");
            span.record_error(&err);
            otel::fail(&mut span, "handler failure");
            dead_letter(channel, delivery, queue_def).await
        }
    }
}

async fn ack(
    channel: &dyn AmqpChannel,
    delivery: &Delivery,
    span: &mut impl Span,
) -> Result<(), AmqpError> {
    channel.ack(delivery.delivery_tag).await.inspect_err(|err| {
        error!(error = err.to_string(), "error whiling ack msg");
        span.record_error(err);
        span.set_status(Status::Error {
            description: "error to ack msg".into(),
        });
    })
}

/// Sends the delivery to the retry queue carrying `count` as its retry count, then acks the
/// original. When the republish fails the delivery is requeued so that it is not lost.
async fn republish(
    channel: &dyn AmqpChannel,
    delivery: &Delivery,
    queue_def: &QueueDefinition,
    count: u32,
) -> Result<(), AmqpError> {
    let Some(retry_queue) = queue_def.retry_name() else {
        return dead_letter(channel, delivery, queue_def).await;
    };

    if let Err(err) = channel
        .publish(
            "",
            &retry_queue,
            BasicPublishOptions::default(),
            &delivery.data,
            with_count(&delivery.properties, count),
        )
        .await
    {
        error!(error = err.to_string(), queue = retry_queue, "error whiling requeuing");
        channel.nack(delivery.delivery_tag, true).await?;
        return Err(AmqpError::RequeuingMessageError(err.to_string()));
    }

    channel.ack(delivery.delivery_tag).await
}

async fn dead_letter(
    channel: &dyn AmqpChannel,
    delivery: &Delivery,
    queue_def: &QueueDefinition,
) -> Result<(), AmqpError> {
    let dlq = match (queue_def.retry(), queue_def.dlq_name()) {
        (Some(_), Some(dlq)) => dlq,
        _ => return channel.nack(delivery.delivery_tag, false).await,
    };

    if let Err(err) = channel
        .publish(
            "",
            &dlq,
            BasicPublishOptions::default(),
            &delivery.data,
            delivery.properties.clone(),
        )
        .await
    {
        error!(error = err.to_string(), queue = dlq, "error whiling sending to dlq");
        channel.nack(delivery.delivery_tag, true).await?;
        return Err(AmqpError::PublishingToDQLError(err.to_string()));
    }

    channel.ack(delivery.delivery_tag).await
}
