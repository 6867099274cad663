// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory [`AmqpChannel`] used by the dispatcher tests.
//!
//! Publishing to the default exchange routes by queue name, named exchanges route through
//! exact routing key bindings. Queues honour `x-dead-letter-routing-key` on nack without
//! requeue, and a queue with both `x-message-ttl` and a dead-letter target forwards every
//! message immediately: TTLs collapse to zero.
//!
//! [`install_trace_propagator`] installs a W3C `traceparent` propagator as the global text
//! map propagator for the tests exercising trace propagation.

use crate::{
    channel::{AmqpChannel, Delivery, DeliveryStream},
    errors::AmqpError,
    message::AMQP_HEADERS_TRACEPARENT,
    topology::{AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MESSAGE_TTL},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use opentelemetry::{
    global,
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    ExchangeKind,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Once},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct BrokerQueue {
    args: FieldTable,
    tx: Option<UnboundedSender<Delivery>>,
    rx: Option<UnboundedReceiver<Delivery>>,
    history: Vec<Delivery>,
}

impl BrokerQueue {
    fn new(args: FieldTable) -> BrokerQueue {
        let (tx, rx) = unbounded_channel();
        BrokerQueue {
            args,
            tx: Some(tx),
            rx: Some(rx),
            history: vec![],
        }
    }

    fn dead_letter_target(&self) -> Option<String> {
        match self.args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY) {
            Some(AMQPValue::LongString(key)) => Some(key.to_string()),
            _ => None,
        }
    }

    fn expires_immediately(&self) -> bool {
        self.args.inner().contains_key(AMQP_HEADERS_MESSAGE_TTL)
    }
}

#[derive(Default)]
struct State {
    next_tag: u64,
    queues: HashMap<String, BrokerQueue>,
    bindings: Vec<(String, String, String)>,
    failing_consumers: HashSet<String>,
    unacked: HashMap<u64, (String, Delivery)>,
    acked: Vec<Delivery>,
    nacked: Vec<(Delivery, bool)>,
}

impl State {
    fn route(&mut self, queue: &str, data: &[u8], properties: AMQPProperties) {
        let Some(target) = self.queues.get_mut(queue) else {
            return;
        };

        self.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: self.next_tag,
            routing_key: queue.to_owned(),
            properties,
            data: data.to_vec(),
            ..Delivery::default()
        };
        target.history.push(delivery.clone());

        if target.expires_immediately() {
            if let Some(next) = target.dead_letter_target() {
                self.route(&next, &delivery.data, delivery.properties);
            }
            return;
        }

        if let Some(tx) = &target.tx {
            if tx.send(delivery.clone()).is_ok() {
                self.unacked
                    .insert(delivery.delivery_tag, (queue.to_owned(), delivery));
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub(crate) fn new() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::default())
    }

    /// Every message routed to `queue` so far, consumed or not.
    pub(crate) fn received(&self, queue: &str) -> Vec<Delivery> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|q| q.history.clone())
            .unwrap_or_default()
    }

    pub(crate) fn acked(&self) -> Vec<Delivery> {
        self.state.lock().unwrap().acked.clone()
    }

    pub(crate) fn nacked(&self) -> Vec<(Delivery, bool)> {
        self.state.lock().unwrap().nacked.clone()
    }

    /// Deliveries sitting on consumed queues that were not settled yet.
    pub(crate) fn unsettled(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .unacked
            .values()
            .filter(|(queue, _)| state.queues.get(queue).is_some_and(|q| q.rx.is_none()))
            .count()
    }

    /// Makes the next `consume` call on `queue` fail.
    pub(crate) fn fail_consume(&self, queue: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_consumers
            .insert(queue.to_owned());
    }

    /// Ends the delivery stream of `queue`.
    pub(crate) fn close(&self, queue: &str) {
        if let Some(q) = self.state.lock().unwrap().queues.get_mut(queue) {
            q.tx = None;
        }
    }
}

#[async_trait]
impl AmqpChannel for InMemoryBroker {
    async fn declare_exchange(
        &self,
        _name: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(name.to_owned())
            .or_insert_with(|| BrokerQueue::new(args));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.state.lock().unwrap().bindings.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ));
        Ok(())
    }

    async fn bind_exchange(
        &self,
        _destination: &str,
        _source: &str,
        _routing_key: &str,
    ) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();

        if exchange.is_empty() {
            state.route(routing_key, payload, properties);
            return Ok(());
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, key, _)| ex == exchange && key == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();
        for queue in targets {
            state.route(&queue, payload, properties.clone());
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().unwrap();

        if state.failing_consumers.contains(queue) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let rx = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.rx.take())
            .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();

        let (_, delivery) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| AmqpError::AckMessageError(format!("unknown tag {}", delivery_tag)))?;
        state.acked.push(delivery);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();

        let (queue, delivery) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| AmqpError::NackMessageError(format!("unknown tag {}", delivery_tag)))?;

        let target = if requeue {
            Some(queue)
        } else {
            state.queues.get(&queue).and_then(BrokerQueue::dead_letter_target)
        };
        if let Some(target) = target {
            state.route(&target, &delivery.data, delivery.properties.clone());
        }

        state.nacked.push((delivery, requeue));
        Ok(())
    }
}

/// Propagates the span context as a W3C `traceparent` header. Contexts without a valid
/// span context inject nothing.
#[derive(Debug)]
struct TraceParentPropagator {
    fields: Vec<String>,
}

impl TextMapPropagator for TraceParentPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let sc = span.span_context();
        if sc.is_valid() {
            injector.set(AMQP_HEADERS_TRACEPARENT, traceparent(sc));
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let Some(value) = extractor.get(AMQP_HEADERS_TRACEPARENT) else {
            return cx.clone();
        };

        let parts: Vec<&str> = value.split('-').collect();
        let [_, trace_id, span_id, flags] = parts[..] else {
            return cx.clone();
        };

        match (
            TraceId::from_hex(trace_id),
            SpanId::from_hex(span_id),
            u8::from_str_radix(flags, 16),
        ) {
            (Ok(trace_id), Ok(span_id), Ok(flags)) => {
                cx.with_remote_span_context(SpanContext::new(
                    trace_id,
                    span_id,
                    TraceFlags::new(flags),
                    true,
                    TraceState::default(),
                ))
            }
            _ => cx.clone(),
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}

/// Encodes `sc` as a `traceparent` header value.
pub(crate) fn traceparent(sc: &SpanContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        sc.trace_id(),
        sc.span_id(),
        sc.trace_flags().to_u8()
    )
}

/// A context carrying a sampled remote span, as a publisher inside a trace would have.
pub(crate) fn traced_context() -> Context {
    Context::new().with_remote_span_context(SpanContext::new(
        TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap_or(TraceId::INVALID),
        SpanId::from_hex("b7ad6b7169203331").unwrap_or(SpanId::INVALID),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ))
}

/// Installs the `traceparent` propagator globally, once per test binary.
pub(crate) fn install_trace_propagator() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        global::set_text_map_propagator(TraceParentPropagator {
            fields: vec![AMQP_HEADERS_TRACEPARENT.to_owned()],
        })
    });
}
