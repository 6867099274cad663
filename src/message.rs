// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types and Delivery Metadata
//!
//! Messages travel as JSON bodies tagged with a `type` property. This module defines the
//! [`Message`] trait binding a Rust type to its wire tag, and [`DeliveryMetadata`], the
//! typed view of the properties of an inbound delivery handed to handlers.

use crate::errors::AmqpError;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
};
use serde::{de::DeserializeOwned, Serialize};

/// Header carrying the number of retries a message went through
pub const AMQP_HEADERS_COUNT: &str = "x-count";
/// Header carrying the W3C trace context of the publisher
pub const AMQP_HEADERS_TRACEPARENT: &str = "traceparent";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message type that can be published and consumed.
///
/// ```
/// use rabbitmq_messaging::message::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated {
///     id: u64,
/// }
///
/// impl Message for OrderCreated {
///     const MESSAGE_TYPE: &'static str = "OrderCreated";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Wire `type` tag used to route deliveries to handlers.
    const MESSAGE_TYPE: &'static str;
}

/// Properties of a delivery relevant to its handler.
///
/// Built once per delivery by [`DeliveryMetadata::extract`] and dropped when the delivery
/// is settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub message_id: String,
    pub msg_type: String,
    /// Retries this message went through before the current delivery.
    pub retry_count: u32,
    pub trace_carrier: Option<String>,
}

impl DeliveryMetadata {
    /// Reads the metadata out of the delivery properties.
    ///
    /// A missing or empty message id or type is rejected. A missing, negative or
    /// non-integer `x-count` reads as zero, and one beyond `u32::MAX` saturates.
    pub fn extract(props: &AMQPProperties) -> Result<DeliveryMetadata, AmqpError> {
        let message_id = match props.message_id() {
            Some(id) if !id.as_str().is_empty() => id.to_string(),
            _ => return Err(AmqpError::MissingHeader("message_id")),
        };

        let msg_type = match props.kind() {
            Some(kind) if !kind.as_str().is_empty() => kind.to_string(),
            _ => return Err(AmqpError::MissingHeader("type")),
        };

        let headers = props.headers().as_ref();

        let retry_count = headers
            .and_then(|h| h.inner().get(AMQP_HEADERS_COUNT))
            .and_then(as_count)
            .unwrap_or_default();

        let trace_carrier = headers
            .and_then(|h| h.inner().get(AMQP_HEADERS_TRACEPARENT))
            .and_then(as_text);

        Ok(DeliveryMetadata {
            message_id,
            msg_type,
            retry_count,
            trace_carrier,
        })
    }
}

/// Returns `props` with `x-count` set to `count`, keeping every other property and header.
pub(crate) fn with_count(props: &AMQPProperties, count: u32) -> AMQPProperties {
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(AMQP_HEADERS_COUNT.into(), AMQPValue::LongLongInt(count.into()));
    props.clone().with_headers(headers)
}

pub(crate) fn initial_headers() -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(AMQP_HEADERS_COUNT.into(), AMQPValue::LongLongInt(0));
    headers
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    if count < 0 {
        return None;
    }

    Some(u32::try_from(count).unwrap_or(u32::MAX))
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Header values accepted by [`crate::publisher::PublishMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> AMQPValue {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(v.into()),
            HeaderValues::LongString(v) => AMQPValue::LongString(v.into()),
            HeaderValues::Int(v) => AMQPValue::ShortInt(v),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(v),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(v),
            HeaderValues::Uint(v) => AMQPValue::ShortUInt(v),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(v),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}
