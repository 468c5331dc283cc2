use crate::{
    config::ConnectionParams,
    queue::{QueueDefinition, QueueInfo},
    transport::{AmqpChannel, AmqpConnection, AmqpTransport, DeliveryStream, WireDelivery},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    protocol::{basic::AMQPProperties, AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    Channel, Connection, ConnectionProperties, Error,
};
use messaging::errors::MessagingError;
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Transport backed by a real broker through lapin.
#[derive(Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Arc<LapinTransport> {
        Arc::new(LapinTransport)
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn AmqpConnection>, MessagingError> {
        debug!(uri = params.redacted_uri(), "connecting to rabbitmq");

        let conn = Connection::connect_uri(params.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    uri = params.redacted_uri(),
                    "failure to connect"
                );
                MessagingError::ConnectionError(err.to_string())
            })?;

        debug!(uri = params.redacted_uri(), "connected to rabbitmq");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

pub(crate) struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, MessagingError> {
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "failure to create the channel");
            classify(err, "")
        })?;

        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                MessagingError::ConnectionError(err.to_string())
            })
    }
}

pub(crate) struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| classify(err, ""))
    }

    async fn confirm_select(&self) -> Result<(), MessagingError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| classify(err, ""))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueInfo, MessagingError> {
        let mut args = FieldTable::default();
        if let Some(ttl) = def.ttl {
            args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl));
        }
        if let Some(max) = def.max_priority {
            args.insert("x-max-priority".into(), AMQPValue::LongInt(i32::from(max)));
        }

        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                args,
            )
            .await
            .map_err(|err| declare_error(err, &def.name))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_inspect(&self, name: &str) -> Result<QueueInfo, MessagingError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| declare_error(err, name))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(&self, name: &str) -> Result<u32, MessagingError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| classify(err, name))
    }

    async fn queue_purge(&self, name: &str) -> Result<u32, MessagingError> {
        self.channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(|err| classify(err, name))
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        properties: AMQPProperties,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| publish_error(err, routing_key))?;

        match confirm.await.map_err(|err| publish_error(err, routing_key))? {
            Confirmation::Nack(_) => Err(MessagingError::publish(
                routing_key,
                "broker refused the message",
            )),
            _ => Ok(()),
        }
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<WireDelivery>, MessagingError> {
        let msg = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|err| classify(err, queue))?;

        Ok(msg.map(|msg| wire_delivery(msg.delivery)))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError> {
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
            .map_err(|err| classify(err, queue))?;

        let queue = queue.to_owned();

        Ok(consumer
            .map(move |result| {
                result
                    .map(wire_delivery)
                    .map_err(|err| classify(err, &queue))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| classify(err, ""))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(ack_error)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(ack_error)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| classify(err, ""))
    }
}

fn wire_delivery(delivery: Delivery) -> WireDelivery {
    WireDelivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        routing_key: delivery.routing_key.as_str().to_owned(),
        properties: delivery.properties,
        body: delivery.data,
    }
}

/// Maps a lapin failure on `queue` to the messaging taxonomy.
fn classify(err: Error, queue: &str) -> MessagingError {
    match &err {
        Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                MessagingError::QueueNotFound(queue.to_owned())
            }
            AMQPErrorKind::Soft(_) => MessagingError::channel(queue, &err),
            AMQPErrorKind::Hard(_) => MessagingError::ConnectionError(err.to_string()),
        },
        Error::InvalidConnectionState(_) | Error::IOError(_) | Error::MissingHeartbeatError => {
            MessagingError::ConnectionError(err.to_string())
        }
        _ => MessagingError::channel(queue, &err),
    }
}

fn is_soft(err: &Error) -> bool {
    matches!(err, Error::ProtocolError(amqp) if matches!(amqp.kind(), AMQPErrorKind::Soft(_)))
}

/// A declare refused because the queue exists with other properties or
/// belongs to another connection.
fn declare_error(err: Error, queue: &str) -> MessagingError {
    match &err {
        Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                    | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED)
            ) =>
        {
            MessagingError::QueueConflict(queue.to_owned())
        }
        _ => classify(err, queue),
    }
}

fn publish_error(err: Error, queue: &str) -> MessagingError {
    if is_soft(&err) {
        return MessagingError::publish(queue, &err);
    }

    match classify(err, queue) {
        MessagingError::ChannelError { queue, reason } => MessagingError::publish(queue, reason),
        other => other,
    }
}

fn ack_error(err: Error) -> MessagingError {
    if is_soft(&err) {
        return MessagingError::ack("", &err);
    }

    match classify(err, "") {
        MessagingError::ChannelError { reason, .. } => MessagingError::ack("", reason),
        other => other,
    }
}
