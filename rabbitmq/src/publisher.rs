use crate::{connection::RabbitMQConnection, otel, wire};
use async_trait::async_trait;
use chrono::Utc;
use lapin::types::ShortString;
use messaging::{errors::MessagingError, message::Message, publisher::Publisher};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes through the default exchange, using the queue name as routing key.
pub struct RabbitMQPublisher {
    connection: Arc<RabbitMQConnection>,
}

impl RabbitMQPublisher {
    pub fn new(connection: Arc<RabbitMQConnection>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { connection })
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        queue: &str,
        msg: &Message,
    ) -> Result<(), MessagingError> {
        let registry = self.connection.registry().await?;

        let channel = registry.ensure_channel(queue).await.map_err(|err| match err {
            MessagingError::ChannelError { queue, reason } => {
                MessagingError::PublishError { queue, reason }
            }
            other => other,
        })?;

        let (mut props, body) = wire::to_wire_with(msg, &registry.settings().publish, |headers| {
            otel::inject(ctx, headers)
        });
        if msg.message_id.is_none() {
            props = props.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }
        if msg.timestamp.is_none() {
            props = props.with_timestamp(Utc::now().timestamp().max(0) as u64);
        }

        channel
            .publish(queue, props, body)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = queue,
                    "error publishing message"
                );
                err
            })?;

        debug!(
            trace.id = traces::trace_id(ctx),
            span.id = traces::span_id(ctx),
            queue = queue,
            "message published"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConnectionParams, ConnectorSettings},
        memory::InMemoryBroker,
        transport::{
            AmqpChannel, AmqpConnection, MockAmqpChannel, MockAmqpConnection, MockAmqpTransport,
        },
    };

    fn settings() -> ConnectorSettings {
        ConnectorSettings::new(ConnectionParams::new("localhost", 5672, "guest", "guest"))
    }

    async fn open(broker: &InMemoryBroker, settings: ConnectorSettings) -> Arc<RabbitMQConnection> {
        let conn = Arc::new(RabbitMQConnection::new(Arc::new(broker.clone()), settings));
        conn.open().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn should_declare_queue_and_publish() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker, settings()).await;
        let publisher = RabbitMQPublisher::new(conn.clone());

        publisher
            .publish(&Context::new(), "orders", &Message::new("orders", b"A"))
            .await
            .unwrap();

        assert_eq!(broker.ready_count("orders"), Some(1));
    }

    #[tokio::test]
    async fn should_assign_message_id_and_timestamp() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker, settings()).await;
        let publisher = RabbitMQPublisher::new(conn.clone());

        publisher
            .publish(&Context::new(), "orders", &Message::new("orders", b"A"))
            .await
            .unwrap();

        let registry = conn.registry().await.unwrap();
        let channel = registry.ensure_channel("orders").await.unwrap();
        let delivery = channel.get().await.unwrap().unwrap();

        assert!(delivery.properties.message_id().is_some());
        assert!(delivery.properties.timestamp().is_some());
    }

    #[tokio::test]
    async fn should_deliver_published_message_unchanged() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker, settings()).await;
        let publisher = RabbitMQPublisher::new(conn.clone());
        let msg = Message::new("orders", br#"{"id":1}"#)
            .with_metadata("tenant", "acme")
            .with_message_id("m-1")
            .with_correlation_id("c-1")
            .with_msg_type("order.created")
            .with_content_type("application/json")
            .with_timestamp(Utc::now())
            .with_priority(4)
            .with_group_id("g-1")
            .with_deduplication_id("d-1")
            .persistent(true);

        publisher
            .publish(&Context::new(), "orders", &msg)
            .await
            .unwrap();

        let registry = conn.registry().await.unwrap();
        let channel = registry.ensure_channel("orders").await.unwrap();
        let delivery = channel.get().await.unwrap().unwrap();

        assert_eq!(wire::from_wire("orders", &delivery, None), msg);
    }

    #[tokio::test]
    async fn should_fail_when_connection_is_not_open() {
        let conn = Arc::new(RabbitMQConnection::new(
            Arc::new(InMemoryBroker::new()),
            settings(),
        ));
        let publisher = RabbitMQPublisher::new(conn);

        let res = publisher
            .publish(&Context::new(), "orders", &Message::new("orders", b"A"))
            .await;

        assert!(matches!(res, Err(MessagingError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn should_fail_when_broker_nacks_with_confirms() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker, settings().confirms()).await;
        let publisher = RabbitMQPublisher::new(conn);
        broker.nack_publishes(true);

        let res = publisher
            .publish(&Context::new(), "orders", &Message::new("orders", b"A"))
            .await;

        assert!(matches!(
            res,
            Err(MessagingError::PublishError { queue, .. }) if queue == "orders"
        ));
        assert_eq!(broker.ready_count("orders"), Some(0));
    }

    #[tokio::test]
    async fn should_report_closed_channel_as_publish_error() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_connect().returning(|_| {
            let mut conn = MockAmqpConnection::new();
            conn.expect_is_connected().returning(|| true);
            conn.expect_create_channel().returning(|| {
                let mut channel = MockAmqpChannel::new();
                channel.expect_is_open().returning(|| true);
                channel.expect_queue_declare().returning(|def| {
                    Ok(crate::queue::QueueInfo {
                        name: def.name().to_owned(),
                        ..Default::default()
                    })
                });
                channel
                    .expect_basic_publish()
                    .returning(|_, _, _| Err(MessagingError::channel("", "channel is closed")));
                Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
            });
            Ok(Arc::new(conn) as Arc<dyn AmqpConnection>)
        });

        let conn = Arc::new(RabbitMQConnection::new(Arc::new(transport), settings()));
        conn.open().await.unwrap();
        let publisher = RabbitMQPublisher::new(conn);

        let res = publisher
            .publish(&Context::new(), "orders", &Message::new("orders", b"A"))
            .await;

        assert_eq!(
            res,
            Err(MessagingError::publish("orders", "channel is closed"))
        );
    }

    #[tokio::test]
    async fn should_serialize_publishes_on_one_channel() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker, settings()).await;
        let publisher = RabbitMQPublisher::new(conn);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let msg = Message::new("orders", i.to_string().as_bytes());
                    publisher.publish(&Context::new(), "orders", &msg).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.ready_count("orders"), Some(10));
    }
}
