// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module turns exchange, queue and binding definitions into broker state. Queues
//! configured with a retry policy get two auxiliary queues:
//!
//! - `<name>-retry`: holds failed messages for the retry delay (`x-message-ttl`) and then
//!   dead-letters them back to `<name>` through the default exchange.
//! - `<name>-dlq`: terminal queue for messages that are rejected or out of attempts.
//!
//! Installing is idempotent on the broker side but not transactional: the first failing
//! declare or bind aborts the install and leaves whatever was already declared in place.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortString},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Trait defining the interface for topology management.
///
/// The builder methods only record definitions; nothing reaches the broker until
/// [`Topology::install`] is called.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology, replacing any previous one with the
    /// same name.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds an exchange-to-exchange binding to the topology.
    fn exchange_binding(self, binding: ExchangeBinding) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Looks up a queue definition by name.
    fn queue_definition(&self, name: &str) -> Option<&QueueDefinition>;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
#[derive(Default)]
pub struct AmqpTopology {
    channel: Option<Arc<dyn AmqpChannel>>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) exchanges_binding: Vec<ExchangeBinding>,
}

impl AmqpTopology {
    /// Creates a new topology bound to `channel`.
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel: Some(channel),
            ..AmqpTopology::default()
        }
    }

    /// Binds the channel used by [`Topology::install`].
    pub fn channel(mut self, channel: Arc<dyn AmqpChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Queue definitions in declaration order.
    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        match self.queues.iter_mut().find(|q| q.name == def.name) {
            Some(existing) => *existing = def,
            None => self.queues.push(def),
        }
        self
    }

    fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    fn queue_definition(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares every queue, preceded by its retry queue and DLQ when configured
    /// 3. Binds queues to exchanges
    /// 4. Binds exchanges to exchanges
    async fn install(&self) -> Result<(), AmqpError> {
        let Some(channel) = self.channel.as_deref() else {
            error!("topology installed without a channel");
            return Err(AmqpError::ChannelRequired);
        };

        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await?;
        self.binding_exchanges(channel).await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            channel
                .declare_exchange(
                    &exch.name,
                    (&exch.kind).into(),
                    ExchangeDeclareOptions {
                        passive: exch.passive,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    FieldTable::from(exch.params.clone()),
                )
                .await
                .inspect_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    )
                })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Some(retry_name) = def.retry_name() {
                declare(channel, &retry_name, auxiliary_options(def), retry_queue_args(def)).await?;
            }

            if let Some(dlq_name) = def.dlq_name() {
                declare(channel, &dlq_name, auxiliary_options(def), FieldTable::default()).await?;
            }

            let options = QueueDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.delete,
                nowait: false,
            };

            declare(channel, &def.name, options, queue_args(def)).await?;
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            channel
                .bind_queue(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                )
                .await?;
        }

        Ok(())
    }

    async fn binding_exchanges(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for binding in &self.exchanges_binding {
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.routing_key
            );

            channel
                .bind_exchange(&binding.destination, &binding.source, &binding.routing_key)
                .await?;
        }

        Ok(())
    }
}

async fn declare(
    channel: &dyn AmqpChannel,
    name: &str,
    options: QueueDeclareOptions,
    args: FieldTable,
) -> Result<(), AmqpError> {
    match channel.declare_queue(name, options, args).await {
        Err(err) => {
            error!(error = err.to_string(), queue = name, "failure to declare queue");
            Err(err)
        }
        _ => {
            debug!("queue: {} was created", name);
            Ok(())
        }
    }
}

/// Retry queues and DLQs follow the primary queue's durability but are never exclusive
/// or auto-deleted: they must outlive the consumers of the primary queue.
fn auxiliary_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: def.passive,
        durable: def.durable,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

/// Arguments of `<name>-retry`: expire after the retry delay and dead-letter back to the
/// primary queue through the default exchange.
pub(crate) fn retry_queue_args(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(retry) = def.retry() {
        dead_letter_to(&mut args, &def.name);
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            millis(retry.delay),
        );
    }

    FieldTable::from(args)
}

/// Arguments of the primary queue. Rejected messages go to the retry queue when there is
/// one, else to the DLQ.
pub(crate) fn queue_args(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(target) = def.retry_name().or_else(|| def.dlq_name()) {
        dead_letter_to(&mut args, &target);
    }

    if let Some(ttl) = def.ttl {
        args.insert(ShortString::from(AMQP_HEADERS_MESSAGE_TTL), millis(ttl));
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max) = def.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    FieldTable::from(args)
}

fn dead_letter_to(args: &mut BTreeMap<ShortString, AMQPValue>, routing_key: &str) {
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(routing_key)),
    );
}

fn millis(duration: Duration) -> AMQPValue {
    let ms = LongLongInt::try_from(duration.as_millis()).unwrap_or(LongLongInt::MAX);
    AMQPValue::LongLongInt(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::Sequence;
    use std::sync::Mutex;

    fn string_arg(args: &FieldTable, key: &str) -> Option<String> {
        match args.inner().get(key) {
            Some(AMQPValue::LongString(value)) => Some(value.to_string()),
            _ => None,
        }
    }

    #[test]
    fn retry_queue_dead_letters_back_to_primary() {
        let def = QueueDefinition::new("orders").with_retry(2, Duration::from_millis(500));
        let args = retry_queue_args(&def);

        assert_eq!(
            string_arg(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE).as_deref(),
            Some("")
        );
        assert_eq!(
            string_arg(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders")
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(500))
        );
    }

    #[test]
    fn primary_queue_prefers_retry_over_dlq() {
        let with_retry = QueueDefinition::new("orders").with_retry(1, Duration::from_secs(1));
        let with_dlq = QueueDefinition::new("orders").with_dlq();
        let plain = QueueDefinition::new("orders").max_length(10);

        assert_eq!(
            string_arg(&queue_args(&with_retry), AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders-retry")
        );
        assert_eq!(
            string_arg(&queue_args(&with_dlq), AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders-dlq")
        );

        let plain_args = queue_args(&plain);
        assert!(plain_args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).is_none());
        assert_eq!(
            plain_args.inner().get(AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(10))
        );
    }

    #[tokio::test]
    async fn install_without_channel_fails() {
        let topology = AmqpTopology::default().queue(QueueDefinition::new("orders"));

        assert_eq!(topology.install().await, Err(AmqpError::ChannelRequired));
    }

    #[tokio::test]
    async fn install_declares_in_dependency_order() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_exchange()
            .withf(|name, _, opts, _| name == "shop" && opts.durable && !opts.auto_delete)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        for queue in ["orders-retry", "orders-dlq", "orders"] {
            channel
                .expect_declare_queue()
                .withf(move |name, opts, _| {
                    name == queue && opts.durable && !opts.auto_delete && !opts.exclusive
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(()));
        }
        channel
            .expect_bind_queue()
            .withf(|queue, exchange, key| {
                queue == "orders" && exchange == "shop" && key == "order.created"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_bind_exchange()
            .withf(|destination, source, key| {
                destination == "audit" && source == "shop" && key.is_empty()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let topology = AmqpTopology::new(Arc::new(channel))
            .exchange(ExchangeDefinition::new("shop").topic())
            .queue(QueueDefinition::new("orders").with_retry(2, Duration::from_millis(500)))
            .queue_binding(
                QueueBinding::new("orders")
                    .exchange("shop")
                    .routing_key("order.created"),
            )
            .exchange_binding(ExchangeBinding::new("shop", "audit"));

        topology.install().await.unwrap();
    }

    #[tokio::test]
    async fn install_twice_declares_the_same_set() {
        let declared = Arc::new(Mutex::new(vec![]));
        let mut channel = MockAmqpChannel::new();

        let names = declared.clone();
        channel.expect_declare_queue().returning(move |name, _, _| {
            names.lock().unwrap().push(name.to_owned());
            Ok(())
        });
        channel.expect_declare_exchange().returning(|_, _, _, _| Ok(()));

        let topology = AmqpTopology::new(Arc::new(channel))
            .exchange(ExchangeDefinition::new("shop"))
            .queue(QueueDefinition::new("orders").with_dlq());

        topology.install().await.unwrap();
        let first = declared.lock().unwrap().clone();
        topology.install().await.unwrap();
        let all = declared.lock().unwrap().clone();

        assert_eq!(first, vec!["orders-dlq", "orders"]);
        assert_eq!(all[first.len()..], first[..]);
    }

    #[tokio::test]
    async fn install_stops_at_the_first_failure() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_declare_queue()
            .withf(|name, _, _| name == "orders-dlq")
            .times(1)
            .returning(|name, _, _| Err(AmqpError::DeclareQueueError(name.to_owned())));
        channel.expect_bind_queue().never();

        let topology = AmqpTopology::new(Arc::new(channel))
            .queue(QueueDefinition::new("orders").with_dlq())
            .queue(QueueDefinition::new("payments"))
            .queue_binding(QueueBinding::new("orders").exchange("shop"));

        assert_eq!(
            topology.install().await,
            Err(AmqpError::DeclareQueueError("orders-dlq".to_owned()))
        );
    }

    #[test]
    fn queue_definitions_are_looked_up_by_name() {
        let topology = AmqpTopology::default()
            .queue(QueueDefinition::new("orders"))
            .queue(QueueDefinition::new("orders").with_retry(3, Duration::from_secs(1)));

        assert_eq!(topology.queues().len(), 1);
        assert_eq!(
            topology
                .queue_definition("orders")
                .and_then(|q| q.retry())
                .map(|r| r.max_attempts),
            Some(3)
        );
        assert!(topology.queue_definition("payments").is_none());
    }
}
