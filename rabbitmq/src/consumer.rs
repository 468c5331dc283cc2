use crate::{
    connection::RabbitMQConnection,
    otel,
    registry::{ChannelRegistry, QueueChannel},
    transport::{DeliveryStream, WireDelivery},
    wire,
};
use futures_util::{FutureExt, StreamExt};
use messaging::{
    errors::MessagingError,
    handler::ConsumerHandler,
    message::{DeliveryTag, Message},
};
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Who acknowledges deliveries of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The caller acknowledges through `RabbitMQConsumer::acknowledge`.
    #[default]
    Manual,
    /// Acked when the handler succeeds, rejected without requeue when it fails.
    OnHandlerSuccess,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub ack_mode: AckMode,
    /// Overrides the connection prefetch for this subscription.
    pub prefetch_count: Option<u16>,
    pub consumer_tag: Option<String>,
    /// Failures beyond this many unread ones are only logged.
    pub failure_buffer: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            ack_mode: AckMode::Manual,
            prefetch_count: None,
            consumer_tag: None,
            failure_buffer: 64,
        }
    }
}

impl SubscribeOptions {
    pub fn ack_on_success(mut self) -> Self {
        self.ack_mode = AckMode::OnHandlerSuccess;
        self
    }

    pub fn prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn consumer_tag<T: Into<String>>(mut self, tag: T) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Consuming,
    Cancelled,
    ChannelClosed,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Cancelled | SubscriptionState::ChannelClosed
        )
    }
}

/// A handler error, handler panic or acknowledgment failure of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerFailure {
    pub queue: String,
    pub delivery_tag: Option<DeliveryTag>,
    pub error: MessagingError,
}

/// Handle of an active consumer. Dropping it cancels the consumer.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<SubscriptionState>,
    failures: mpsc::Receiver<ConsumerFailure>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Next reported failure, `None` once the consumer stopped and every
    /// failure was read.
    pub async fn next_failure(&mut self) -> Option<ConsumerFailure> {
        self.failures.recv().await
    }

    pub fn try_next_failure(&mut self) -> Option<ConsumerFailure> {
        self.failures.try_recv().ok()
    }

    /// Waits until the consumer stops on its own (channel or connection loss).
    pub async fn closed(&mut self) -> SubscriptionState {
        while !self.state().is_terminal() {
            if self.state.changed().await.is_err() {
                break;
            }
        }
        self.state()
    }

    /// Stops requesting deliveries, waits for the in-flight handler and closes
    /// the consumer channel. Unacknowledged deliveries go back to the queue.
    pub async fn cancel(mut self) -> SubscriptionState {
        let _ = self.cancel.send(true);

        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(
                    error = err.to_string(),
                    queue = self.queue.as_str(),
                    "consumer task failed"
                );
            }
        }

        self.state()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

pub struct RabbitMQConsumer {
    connection: Arc<RabbitMQConnection>,
}

impl RabbitMQConsumer {
    pub fn new(connection: Arc<RabbitMQConnection>) -> Arc<RabbitMQConsumer> {
        Arc::new(RabbitMQConsumer { connection })
    }

    /// Starts consuming `queue` on a dedicated channel. Deliveries are handled
    /// one at a time, in the order the broker hands them out.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: SubscribeOptions,
    ) -> Result<Subscription, MessagingError> {
        let registry = self.connection.registry().await?;
        registry.ensure_channel(queue).await?;

        let channel = registry.dedicated_channel(queue).await.map_err(|err| {
            error!(error = err.to_string(), queue = queue, "failure to open consumer channel");
            consumer_error(err)
        })?;

        let tag = opts
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4()));

        let deliveries = match start_consuming(&channel, &registry, &tag, &opts).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "failure to start consumer");
                registry.release(channel.serial());
                channel.close().await;
                return Err(consumer_error(err));
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Consuming);
        let (failures_tx, failures_rx) = mpsc::channel(opts.failure_buffer.max(1));

        let consumer = ConsumerLoop {
            queue: queue.to_owned(),
            consumer_tag: tag.clone(),
            channel,
            registry,
            handler,
            ack_mode: opts.ack_mode,
            failures: failures_tx,
        };

        let task = tokio::spawn(consumer.run(deliveries, cancel_rx, state_tx));

        debug!(queue = queue, consumer_tag = tag.as_str(), "consumer started");

        Ok(Subscription {
            queue: queue.to_owned(),
            consumer_tag: tag,
            cancel: cancel_tx,
            state: state_rx,
            failures: failures_rx,
            task: Some(task),
        })
    }

    /// Fetches one message without removing it from the queue. The message
    /// keeps its delivery tag and is redelivered unless acknowledged.
    pub async fn peek(&self, queue: &str) -> Result<Option<Message>, MessagingError> {
        let registry = self.connection.registry().await?;
        let channel = registry.ensure_channel(queue).await?;

        let delivery = channel.get().await?;

        Ok(delivery.map(|delivery| {
            let tag = DeliveryTag {
                channel_serial: channel.serial(),
                tag: delivery.delivery_tag,
            };
            wire::from_wire(queue, &delivery, Some(tag))
        }))
    }

    /// Acknowledges `msg` on the channel that delivered it.
    pub async fn acknowledge(&self, msg: &Message) -> Result<(), MessagingError> {
        let (channel, tag) = self.delivering_channel(msg).await?;
        channel.ack(tag).await
    }

    /// Rejects `msg`, putting it back in the queue when `requeue` is set.
    pub async fn reject(&self, msg: &Message, requeue: bool) -> Result<(), MessagingError> {
        let (channel, tag) = self.delivering_channel(msg).await?;
        channel.nack(tag, requeue).await
    }

    /// Acknowledges the delivery `tag` of `queue`, as reported by a
    /// [`ConsumerFailure`].
    pub async fn acknowledge_tag(
        &self,
        queue: &str,
        tag: DeliveryTag,
    ) -> Result<(), MessagingError> {
        let channel = self.tag_channel(queue, tag).await?;
        channel.ack(tag.tag).await
    }

    /// Rejects the delivery `tag` of `queue`, putting the message back in the
    /// queue when `requeue` is set.
    pub async fn reject_tag(
        &self,
        queue: &str,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), MessagingError> {
        let channel = self.tag_channel(queue, tag).await?;
        channel.nack(tag.tag, requeue).await
    }

    async fn delivering_channel(
        &self,
        msg: &Message,
    ) -> Result<(Arc<QueueChannel>, u64), MessagingError> {
        let Some(delivery) = msg.delivery else {
            return Err(MessagingError::ack(
                &msg.entity_name,
                "message carries no delivery tag",
            ));
        };

        let channel = self.tag_channel(&msg.entity_name, delivery).await?;
        Ok((channel, delivery.tag))
    }

    async fn tag_channel(
        &self,
        queue: &str,
        tag: DeliveryTag,
    ) -> Result<Arc<QueueChannel>, MessagingError> {
        let registry = self.connection.registry().await?;

        registry
            .channel(tag.channel_serial)
            .ok_or_else(|| MessagingError::ack(queue, "the delivering channel is closed"))
    }
}

fn consumer_error(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::ConnectionError(_) | MessagingError::QueueNotFound(_) => err,
        err => MessagingError::CreatingConsumerError(err.to_string()),
    }
}

async fn start_consuming(
    channel: &QueueChannel,
    registry: &ChannelRegistry,
    tag: &str,
    opts: &SubscribeOptions,
) -> Result<DeliveryStream, MessagingError> {
    let prefetch = opts
        .prefetch_count
        .unwrap_or(registry.settings().prefetch_count);

    if prefetch > 0 {
        channel.qos(prefetch).await?;
    }

    channel.consume(tag).await
}

struct ConsumerLoop {
    queue: String,
    consumer_tag: String,
    channel: Arc<QueueChannel>,
    registry: Arc<ChannelRegistry>,
    handler: Arc<dyn ConsumerHandler>,
    ack_mode: AckMode,
    failures: mpsc::Sender<ConsumerFailure>,
}

impl ConsumerLoop {
    async fn run(
        self,
        mut deliveries: DeliveryStream,
        mut cancel: watch::Receiver<bool>,
        state: watch::Sender<SubscriptionState>,
    ) {
        let final_state = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.changed() => break SubscriptionState::Cancelled,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.consume(&delivery).await,
                Some(Err(err)) => {
                    error!(
                        error = err.to_string(),
                        queue = self.queue.as_str(),
                        "consumer stream failure"
                    );
                    self.report(None, err);
                    break SubscriptionState::ChannelClosed;
                }
                None => {
                    warn!(queue = self.queue.as_str(), "consumer stream ended");
                    break SubscriptionState::ChannelClosed;
                }
            }
        };

        if final_state == SubscriptionState::Cancelled {
            if let Err(err) = self.channel.cancel(&self.consumer_tag).await {
                debug!(error = err.to_string(), "failure to cancel consumer");
            }
        }

        self.registry.release(self.channel.serial());
        self.channel.close().await;
        let _ = state.send(final_state);

        debug!(
            queue = self.queue.as_str(),
            consumer_tag = self.consumer_tag.as_str(),
            state = ?final_state,
            "consumer stopped"
        );
    }

    async fn consume(&self, delivery: &WireDelivery) {
        let tag = DeliveryTag {
            channel_serial: self.channel.serial(),
            tag: delivery.delivery_tag,
        };
        let msg = wire::from_wire(&self.queue, delivery, Some(tag));

        let tracer = global::tracer("rabbitmq-consumer");
        let ctx = otel::consumer_ctx(&delivery.properties, &tracer, &self.queue);
        let span = ctx.span();

        debug!(
            trace.id = traces::trace_id(&ctx),
            span.id = traces::span_id(&ctx),
            queue = self.queue.as_str(),
            delivery_tag = delivery.delivery_tag,
            "received message"
        );

        let result = AssertUnwindSafe(self.handler.exec(&ctx, &msg))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(MessagingError::ConsumerError(panic_message(panic))));

        match (result, self.ack_mode) {
            (Ok(()), AckMode::OnHandlerSuccess) => {
                if let Err(err) = self.channel.ack(tag.tag).await {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    self.report(Some(tag), err);
                } else {
                    span.set_status(Status::Ok);
                }
            }
            (Ok(()), AckMode::Manual) => span.set_status(Status::Ok),
            (Err(err), ack_mode) => {
                error!(
                    trace.id = traces::trace_id(&ctx),
                    span.id = traces::span_id(&ctx),
                    error = err.to_string(),
                    queue = self.queue.as_str(),
                    "failure to handle message"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });

                if ack_mode == AckMode::OnHandlerSuccess {
                    if let Err(nack_err) = self.channel.nack(tag.tag, false).await {
                        self.report(Some(tag), nack_err);
                    }
                }

                self.report(Some(tag), err);
            }
        }

        span.end();
    }

    fn report(&self, delivery_tag: Option<DeliveryTag>, error: MessagingError) {
        let failure = ConsumerFailure {
            queue: self.queue.clone(),
            delivery_tag,
            error,
        };

        if let Err(err) = self.failures.try_send(failure) {
            warn!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                "consumer failure dropped, nobody is reading them"
            );
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown reason".to_owned());

    format!("handler panicked - {}", reason)
}
