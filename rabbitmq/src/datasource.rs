use crate::{
    config::ConnectorSettings,
    connection::RabbitMQConnection,
    consumer::{RabbitMQConsumer, SubscribeOptions, Subscription},
    lapin_transport::LapinTransport,
    publisher::RabbitMQPublisher,
    queue::{QueueDefinition, QueueInfo},
    transport::AmqpTransport,
};
use async_trait::async_trait;
use configs::{Configs, DynamicConfigs};
use messaging::{
    datasource::{AppFilter, ConnectionState, DataSource, EntityInfo, OperationOutcome},
    errors::MessagingError,
    handler::ConsumerHandler,
    message::Message,
    publisher::Publisher,
};
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const NO_TRANSACTIONS: &str = "transactions are not supported by message queues";

/// Exposes the queues of one broker connection as entities.
pub struct RabbitMQDataSource {
    connection: Arc<RabbitMQConnection>,
    publisher: Arc<RabbitMQPublisher>,
    consumer: Arc<RabbitMQConsumer>,
}

impl RabbitMQDataSource {
    pub fn new(transport: Arc<dyn AmqpTransport>, settings: ConnectorSettings) -> Self {
        RabbitMQDataSource::with_connection(Arc::new(RabbitMQConnection::new(transport, settings)))
    }

    pub fn from_configs<T>(cfg: &Configs<T>) -> Result<Self, MessagingError>
    where
        T: DynamicConfigs,
    {
        Ok(RabbitMQDataSource::new(
            LapinTransport::new(),
            ConnectorSettings::from_configs(&cfg.rabbitmq)?,
        ))
    }

    fn with_connection(connection: Arc<RabbitMQConnection>) -> Self {
        RabbitMQDataSource {
            publisher: RabbitMQPublisher::new(connection.clone()),
            consumer: RabbitMQConsumer::new(connection.clone()),
            connection,
        }
    }

    pub fn connection(&self) -> Arc<RabbitMQConnection> {
        self.connection.clone()
    }

    pub fn publisher(&self) -> Arc<dyn Publisher> {
        self.publisher.clone()
    }

    pub fn consumer(&self) -> Arc<RabbitMQConsumer> {
        self.consumer.clone()
    }

    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        opts: SubscribeOptions,
    ) -> Result<Subscription, MessagingError> {
        self.consumer.subscribe(queue, handler, opts).await
    }

    pub async fn acknowledge(&self, msg: &Message) -> Result<(), MessagingError> {
        self.consumer.acknowledge(msg).await
    }

    pub async fn reject(&self, msg: &Message, requeue: bool) -> Result<(), MessagingError> {
        self.consumer.reject(msg, requeue).await
    }

    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<QueueInfo, MessagingError> {
        self.connection.registry().await?.declare_queue(def).await
    }

    /// Removes every ready message, returning how many were removed.
    pub async fn purge(&self, queue: &str) -> Result<u32, MessagingError> {
        self.connection.registry().await?.purge_queue(queue).await
    }

    pub async fn inspect(&self, queue: &str) -> Result<QueueInfo, MessagingError> {
        self.connection.registry().await?.inspect_queue(queue).await
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<u32, MessagingError> {
        self.connection.registry().await?.delete_queue(queue).await
    }

    async fn publish_json(&self, name: &str, payload: &Value) -> Result<(), MessagingError> {
        let msg = Message::json(name, payload)?;
        self.publisher.publish(&Context::current(), name, &msg).await
    }
}

#[async_trait]
impl DataSource for RabbitMQDataSource {
    async fn open_connection(&self) -> Result<ConnectionState, MessagingError> {
        self.connection.open().await
    }

    async fn close_connection(&self) -> Result<ConnectionState, MessagingError> {
        self.connection.close().await
    }

    async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Queues this data source declared or used, the broker offers no listing.
    async fn entities(&self) -> Result<Vec<String>, MessagingError> {
        self.connection.registry().await?.queue_names()
    }

    async fn entity_exists(&self, name: &str) -> Result<bool, MessagingError> {
        match self.inspect(name).await {
            Ok(_) => Ok(true),
            Err(MessagingError::QueueNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_entity(&self, name: &str) -> Result<EntityInfo, MessagingError> {
        let registry = self.connection.registry().await?;
        registry.ensure_channel(name).await?;

        Ok(registry.inspect_queue(name).await?.into())
    }

    async fn get_entity(
        &self,
        name: &str,
        filters: &[AppFilter],
    ) -> Result<Option<Message>, MessagingError> {
        if !filters.is_empty() {
            warn!(
                queue = name,
                filters = filters.len(),
                "filters are ignored when reading from a queue"
            );
        }

        self.consumer.peek(name).await
    }

    async fn insert_entity(&self, name: &str, payload: &Value) -> Result<(), MessagingError> {
        self.publish_json(name, payload).await
    }

    /// Queues have no update in place, the new version is published.
    async fn update_entity(
        &self,
        name: &str,
        payload: &Value,
        filters: &[AppFilter],
    ) -> Result<(), MessagingError> {
        if !filters.is_empty() {
            warn!(
                queue = name,
                filters = filters.len(),
                "filters are ignored when updating a queue"
            );
        }

        self.publish_json(name, payload).await
    }

    async fn delete_entity(
        &self,
        name: &str,
        _filters: &[AppFilter],
    ) -> Result<(), MessagingError> {
        Err(MessagingError::NotSupported(format!(
            "keyed delete on queue {}",
            name
        )))
    }

    async fn run_query(&self, _query: &str) -> Result<Vec<Message>, MessagingError> {
        Err(MessagingError::NotSupported("queries".to_owned()))
    }

    async fn begin_transaction(&self) -> OperationOutcome {
        debug!("begin transaction requested");
        OperationOutcome::warning(NO_TRANSACTIONS)
    }

    async fn commit(&self) -> OperationOutcome {
        debug!("commit requested");
        OperationOutcome::warning(NO_TRANSACTIONS)
    }

    async fn end_transaction(&self) -> OperationOutcome {
        OperationOutcome::warning(NO_TRANSACTIONS)
    }
}
