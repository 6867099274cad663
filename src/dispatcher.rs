// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module consumes messages from RabbitMQ queues and routes them to the handlers
//! registered for their `type`. Routing is strictly by queue and message type: the same
//! type can be handled differently on two queues.
//!
//! Each queue with at least one handler gets its own consume loop. Deliveries of a queue
//! are settled one at a time in broker order, while different queues run in parallel.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    handler::{ConsumerHandler, Dispatch, TypedHandler},
    message::Message,
    otel::CONSUMER_TRACER,
    queue::QueueDefinition,
    topology::AmqpTopology,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handlers registered for a single queue, keyed by message type.
#[derive(Clone)]
pub(crate) struct QueueConsumers {
    pub(crate) queue_def: QueueDefinition,
    pub(crate) handlers: HashMap<String, Arc<dyn Dispatch>>,
}

/// Dispatches deliveries from the queues of a topology to typed handlers.
pub struct RabbitMQDispatcher {
    channel: Arc<dyn AmqpChannel>,
    queues_def: Vec<QueueDefinition>,
    pub(crate) dispatchers_def: BTreeMap<String, QueueConsumers>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher for the queues declared in `topology`.
    ///
    /// # Parameters
    /// * `channel` - Channel used to consume, ack, nack and republish
    /// * `topology` - Topology whose queue definitions bound registration and retries
    ///
    /// # Returns
    /// A dispatcher with no handlers registered
    pub fn new(channel: Arc<dyn AmqpChannel>, topology: &AmqpTopology) -> Self {
        RabbitMQDispatcher {
            channel,
            queues_def: topology.queues().to_vec(),
            dispatchers_def: BTreeMap::default(),
        }
    }

    /// Registers `handler` for messages of type `M` arriving on `queue`.
    ///
    /// # Parameters
    /// * `queue` - Name of a queue declared in the topology
    /// * `handler` - Handler invoked with every decoded `M` received on `queue`
    ///
    /// # Returns
    /// Ok(()) when the handler was registered
    ///
    /// # Errors
    /// - `InvalidParameters` when the queue name or the message type is empty
    /// - `QueueNotDeclared` when `queue` is not part of the topology
    /// - `DuplicateHandler` when `M` already has a handler on `queue`
    pub fn register<M, H>(&mut self, queue: &str, handler: Arc<H>) -> Result<(), AmqpError>
    where
        M: Message,
        H: ConsumerHandler<M> + 'static,
    {
        if queue.is_empty() || M::MESSAGE_TYPE.is_empty() {
            error!(queue, msg_type = M::MESSAGE_TYPE, "invalid handler registration");
            return Err(AmqpError::InvalidParameters(format!(
                "queue: `{}`, message type: `{}`",
                queue,
                M::MESSAGE_TYPE
            )));
        }

        let Some(queue_def) = self.queues_def.iter().find(|q| q.name == queue) else {
            error!(queue, "registering a handler for an undeclared queue");
            return Err(AmqpError::QueueNotDeclared(queue.to_owned()));
        };

        let consumers = self
            .dispatchers_def
            .entry(queue.to_owned())
            .or_insert_with(|| QueueConsumers {
                queue_def: queue_def.clone(),
                handlers: HashMap::default(),
            });

        if consumers.handlers.contains_key(M::MESSAGE_TYPE) {
            error!(queue, msg_type = M::MESSAGE_TYPE, "handler already registered");
            return Err(AmqpError::DuplicateHandler(
                queue.to_owned(),
                M::MESSAGE_TYPE.to_owned(),
            ));
        }

        consumers.handlers.insert(
            M::MESSAGE_TYPE.to_owned(),
            Arc::new(TypedHandler::<M, H>::new(handler)),
        );

        debug!(queue, msg_type = M::MESSAGE_TYPE, "handler registered");
        Ok(())
    }

    /// Consumes every queue with registered handlers until `shutdown` is cancelled.
    ///
    /// On cancellation each loop stops pulling deliveries, settles the one in flight and
    /// exits; this method returns once all of them are done. A queue whose consumer cannot
    /// be created is logged and skipped, the others keep running.
    ///
    /// # Parameters
    /// * `shutdown` - Token stopping every consume loop once cancelled
    ///
    /// # Returns
    /// Ok(()) once every loop has stopped, or InternalError when a loop panicked
    pub async fn consume_blocking(&self, shutdown: CancellationToken) -> Result<(), AmqpError> {
        if self.dispatchers_def.is_empty() {
            warn!("no handlers registered, nothing to consume");
        }

        let mut handles: Vec<(String, JoinHandle<()>)> = vec![];

        for (queue, consumers) in &self.dispatchers_def {
            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

            let stream = match self.channel.consume(queue, &consumer_tag).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = err.to_string(), queue, "failure to create the consumer");
                    continue;
                }
            };

            info!(queue, consumer_tag, "consuming queue");

            handles.push((
                queue.clone(),
                tokio::spawn(consume_loop(
                    stream,
                    Arc::new(consumers.clone()),
                    self.channel.clone(),
                    shutdown.clone(),
                )),
            ));
        }

        shutdown.cancelled().await;
        info!("shutdown requested, waiting for consumers");

        let mut result = Ok(());
        for (queue, handle) in handles {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), queue, "consumer task failure");
                result = Err(AmqpError::InternalError);
            }
        }

        result
    }
}

async fn consume_loop(
    mut stream: DeliveryStream,
    consumers: Arc<QueueConsumers>,
    channel: Arc<dyn AmqpChannel>,
    shutdown: CancellationToken,
) {
    let tracer = global::tracer(CONSUMER_TRACER);
    let queue = consumers.queue_def.name.as_str();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(queue, "consumer stopped");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) = consume(&tracer, &delivery, &consumers, channel.as_ref()).await {
                    error!(error = err.to_string(), queue, "error consume msg");
                }
            }
            Some(Err(err)) => error!(error = err.to_string(), queue, "errors consume msg"),
            None => {
                warn!(queue, "delivery stream closed, consumer exiting");
                return;
            }
        }
    }
}
