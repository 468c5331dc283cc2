use crate::{
    config::ConnectionParams,
    queue::{QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::protocol::basic::AMQPProperties;
use messaging::errors::MessagingError;
use std::sync::Arc;

#[cfg(any(test, feature = "mocks"))]
use mockall::*;

/// One delivery as it arrived on a channel.
#[derive(Debug, Clone)]
pub struct WireDelivery {
    /// Only meaningful on the channel that received it.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub routing_key: String,
    pub properties: AMQPProperties,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<WireDelivery, MessagingError>>;

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn AmqpConnection>, MessagingError>;
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// A protocol channel. Soft errors (missing queue, conflicting declare, unknown
/// delivery tag) close the channel they happen on.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError>;

    async fn confirm_select(&self) -> Result<(), MessagingError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueInfo, MessagingError>;

    /// Passive declare, never creates nor mutates the queue.
    async fn queue_inspect(&self, name: &str) -> Result<QueueInfo, MessagingError>;

    async fn queue_delete(&self, name: &str) -> Result<u32, MessagingError>;

    async fn queue_purge(&self, name: &str) -> Result<u32, MessagingError>;

    /// Publishes through the default exchange and, on channels in confirm
    /// mode, waits for the broker ack.
    async fn basic_publish(
        &self,
        routing_key: &str,
        properties: AMQPProperties,
        body: &[u8],
    ) -> Result<(), MessagingError>;

    async fn basic_get(&self, queue: &str) -> Result<Option<WireDelivery>, MessagingError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}
