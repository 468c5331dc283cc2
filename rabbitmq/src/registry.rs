use crate::{
    config::ConnectorSettings,
    queue::{QueueDefinition, QueueInfo},
    transport::{AmqpChannel, AmqpConnection, DeliveryStream, WireDelivery},
};
use lapin::protocol::basic::AMQPProperties;
use messaging::errors::MessagingError;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

/// Process wide, so a delivery tag minted by a registry that was closed in the
/// meantime can never point at a channel of its successor.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

type Slot = Arc<OnceCell<Arc<QueueChannel>>>;

/// A protocol channel bound to one queue. Writes are serialized.
pub struct QueueChannel {
    serial: u64,
    queue: String,
    channel: Arc<dyn AmqpChannel>,
    writer: tokio::sync::Mutex<()>,
}

impl QueueChannel {
    fn new(queue: &str, channel: Arc<dyn AmqpChannel>) -> Self {
        QueueChannel {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            queue: queue.to_owned(),
            channel,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub(crate) async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .qos(prefetch_count)
            .await
            .map_err(|err| err.for_queue(&self.queue))
    }

    pub(crate) async fn publish(
        &self,
        routing_key: &str,
        properties: AMQPProperties,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .basic_publish(routing_key, properties, body)
            .await
            .map_err(|err| match err {
                MessagingError::ChannelError { queue, reason } => {
                    MessagingError::PublishError { queue, reason }
                }
                other => other,
            })
            .map_err(|err| err.for_queue(routing_key))
    }

    pub(crate) async fn get(&self) -> Result<Option<WireDelivery>, MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .basic_get(&self.queue)
            .await
            .map_err(|err| err.for_queue(&self.queue))
    }

    pub(crate) async fn consume(&self, consumer_tag: &str) -> Result<DeliveryStream, MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .basic_consume(&self.queue, consumer_tag)
            .await
            .map_err(|err| err.for_queue(&self.queue))
    }

    pub(crate) async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .basic_cancel(consumer_tag)
            .await
            .map_err(|err| err.for_queue(&self.queue))
    }

    pub(crate) async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .basic_ack(delivery_tag)
            .await
            .map_err(|err| as_ack_error(err, &self.queue))
    }

    pub(crate) async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let _writer = self.writer.lock().await;
        self.channel
            .basic_nack(delivery_tag, requeue)
            .await
            .map_err(|err| as_ack_error(err, &self.queue))
    }

    pub(crate) async fn close(&self) {
        let _writer = self.writer.lock().await;
        if let Err(err) = self.channel.close().await {
            debug!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                "failure to close channel"
            );
        }
    }
}

fn as_ack_error(err: MessagingError, queue: &str) -> MessagingError {
    match err {
        MessagingError::ChannelError { reason, .. } => MessagingError::ack(queue, reason),
        other => other.for_queue(queue),
    }
}

/// Keyed cache of one channel per queue, owned by an open connection.
///
/// Closing the registry closes every channel it handed out; handles kept
/// afterwards fail with a connection error.
pub struct ChannelRegistry {
    connection: Arc<dyn AmqpConnection>,
    settings: ConnectorSettings,
    slots: Mutex<HashMap<String, Slot>>,
    definitions: Mutex<HashMap<String, QueueDefinition>>,
    channels: Mutex<HashMap<u64, Arc<QueueChannel>>>,
    closed: AtomicBool,
}

impl ChannelRegistry {
    pub fn new(connection: Arc<dyn AmqpConnection>, settings: ConnectorSettings) -> Self {
        ChannelRegistry {
            connection,
            settings,
            slots: Mutex::new(HashMap::new()),
            definitions: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Returns the channel of `queue`, opening it and declaring the queue on
    /// first use. Concurrent callers for the same queue share one setup; a
    /// channel found closed is replaced.
    pub async fn ensure_channel(&self, queue: &str) -> Result<Arc<QueueChannel>, MessagingError> {
        loop {
            self.check_open()?;

            let slot = self.slot(queue)?;
            let mut fresh = false;
            let initialized = &mut fresh;

            let channel = slot
                .get_or_try_init(|| async move {
                    *initialized = true;
                    self.open_queue_channel(queue).await
                })
                .await?
                .clone();

            if fresh || channel.is_open() {
                return Ok(channel);
            }

            debug!(
                queue = queue,
                serial = channel.serial(),
                "evicting closed channel"
            );
            self.evict(queue, &slot)?;
        }
    }

    /// Declares `def` and remembers it, later ensures of the same queue
    /// declare it identically.
    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<QueueInfo, MessagingError> {
        let name = def.name.clone();

        let info = self
            .with_scratch_channel(&name, |channel| async move {
                channel.queue_declare(&def).await.map(|info| (info, def))
            })
            .await
            .map(|(info, def)| {
                if let Ok(mut definitions) = self.lock(&self.definitions) {
                    definitions.insert(info.name.clone(), def);
                }
                info
            })?;

        debug!(queue = info.name.as_str(), "queue declared");

        Ok(info)
    }

    /// Deletes the queue and returns how many ready messages it held.
    /// Fails with `QueueNotFound` when it does not exist.
    pub async fn delete_queue(&self, name: &str) -> Result<u32, MessagingError> {
        let deleted = self
            .with_scratch_channel(name, |channel| async move {
                channel.queue_inspect(name).await?;
                channel.queue_delete(name).await
            })
            .await?;

        self.lock(&self.definitions)?.remove(name);
        let slot = self.lock(&self.slots)?.remove(name);
        if let Some(channel) = slot.and_then(|slot| slot.get().cloned()) {
            self.release(channel.serial());
            channel.close().await;
        }

        debug!(queue = name, deleted = deleted, "queue deleted");

        Ok(deleted)
    }

    /// Removes every ready message. Fails with `QueueNotFound` when the queue
    /// does not exist.
    pub async fn purge_queue(&self, name: &str) -> Result<u32, MessagingError> {
        let purged = self
            .with_scratch_channel(name, |channel| async move {
                channel.queue_inspect(name).await?;
                channel.queue_purge(name).await
            })
            .await?;

        debug!(queue = name, purged = purged, "queue purged");

        Ok(purged)
    }

    /// Point in time counters, read with a passive declare.
    pub async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, MessagingError> {
        self.with_scratch_channel(name, |channel| async move {
            channel.queue_inspect(name).await
        })
        .await
    }

    /// Queues this registry declared, sorted by name.
    pub fn queue_names(&self) -> Result<Vec<String>, MessagingError> {
        let mut names: Vec<String> = self
            .lock(&self.slots)?
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();

        names.extend(self.lock(&self.definitions)?.keys().cloned());
        names.sort();
        names.dedup();

        Ok(names)
    }

    /// The open channel that minted `serial`, if any.
    pub fn channel(&self, serial: u64) -> Option<Arc<QueueChannel>> {
        self.lock(&self.channels)
            .ok()
            .and_then(|channels| channels.get(&serial).cloned())
            .filter(|channel| channel.is_open())
    }

    /// Opens a channel for `queue` that is not shared through the cache.
    pub(crate) async fn dedicated_channel(
        &self,
        queue: &str,
    ) -> Result<Arc<QueueChannel>, MessagingError> {
        self.check_open()?;

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| err.for_queue(queue))?;

        Ok(self.register(queue, channel))
    }

    pub(crate) fn release(&self, serial: u64) {
        if let Ok(mut channels) = self.lock(&self.channels) {
            channels.remove(&serial);
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut slots) = self.lock(&self.slots) {
            slots.clear();
        }

        let channels: Vec<Arc<QueueChannel>> = match self.lock(&self.channels) {
            Ok(mut channels) => channels.drain().map(|(_, channel)| channel).collect(),
            Err(_) => vec![],
        };

        for channel in channels {
            channel.close().await;
        }
    }

    fn check_open(&self) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::ConnectionError(
                "connection is closed".to_owned(),
            ));
        }

        if !self.connection.is_connected() {
            return Err(MessagingError::ConnectionError(
                "connection was lost".to_owned(),
            ));
        }

        Ok(())
    }

    fn slot(&self, queue: &str) -> Result<Slot, MessagingError> {
        Ok(self
            .lock(&self.slots)?
            .entry(queue.to_owned())
            .or_default()
            .clone())
    }

    fn evict(&self, queue: &str, stale: &Slot) -> Result<(), MessagingError> {
        let mut slots = self.lock(&self.slots)?;

        if matches!(slots.get(queue), Some(current) if Arc::ptr_eq(current, stale)) {
            slots.remove(queue);
        }
        drop(slots);

        if let Some(channel) = stale.get() {
            self.release(channel.serial());
        }

        Ok(())
    }

    fn definition(&self, queue: &str) -> Result<QueueDefinition, MessagingError> {
        Ok(self
            .lock(&self.definitions)?
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.settings.queue_definition(queue)))
    }

    fn register(&self, queue: &str, channel: Arc<dyn AmqpChannel>) -> Arc<QueueChannel> {
        let channel = Arc::new(QueueChannel::new(queue, channel));

        if let Ok(mut channels) = self.lock(&self.channels) {
            channels.insert(channel.serial(), channel.clone());
        }

        channel
    }

    async fn open_queue_channel(&self, queue: &str) -> Result<Arc<QueueChannel>, MessagingError> {
        let def = self.definition(queue)?;

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| err.for_queue(queue))?;

        let setup = async {
            if self.settings.publish.confirms {
                channel.confirm_select().await?;
            }
            channel.queue_declare(&def).await
        };

        if let Err(err) = setup.await {
            let err = err.for_queue(queue);
            error!(error = err.to_string(), queue = queue, "failure to setup channel");
            if let Err(close_err) = channel.close().await {
                debug!(error = close_err.to_string(), "failure to close channel");
            }
            return Err(err);
        }

        let channel = self.register(queue, channel);

        debug!(
            queue = queue,
            serial = channel.serial(),
            "channel opened and queue declared"
        );

        Ok(channel)
    }

    /// Runs `op` on a short-lived channel, soft errors close the channel they
    /// happen on and must not take a cached one down.
    async fn with_scratch_channel<T, F, Fut>(&self, queue: &str, op: F) -> Result<T, MessagingError>
    where
        F: FnOnce(Arc<dyn AmqpChannel>) -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        self.check_open()?;

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| err.for_queue(queue))?;

        let result = op(channel.clone()).await.map_err(|err| {
            let err = err.for_queue(queue);
            warn!(error = err.to_string(), queue = queue, "queue operation failed");
            err
        });

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failure to close scratch channel");
        }

        result
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, MessagingError> {
        mutex.lock().map_err(|_| {
            error!("registry lock poisoned");
            MessagingError::InternalError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionParams,
        memory::InMemoryBroker,
        transport::{AmqpTransport, MockAmqpChannel, MockAmqpConnection},
    };

    fn settings() -> ConnectorSettings {
        ConnectorSettings::new(ConnectionParams::new("localhost", 5672, "guest", "guest"))
    }

    async fn registry(broker: &InMemoryBroker) -> ChannelRegistry {
        let conn = broker.connect(&settings().params).await.unwrap();
        ChannelRegistry::new(conn, settings())
    }

    #[tokio::test]
    async fn should_reuse_channel_per_queue() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;

        let first = registry.ensure_channel("orders").await.unwrap();
        let second = registry.ensure_channel("orders").await.unwrap();
        let other = registry.ensure_channel("invoices").await.unwrap();

        assert_eq!(first.serial(), second.serial());
        assert_ne!(first.serial(), other.serial());
        assert_eq!(second.queue(), "orders");
        assert_eq!(
            registry.queue_names().unwrap(),
            vec!["invoices".to_owned(), "orders".to_owned()]
        );
    }

    #[tokio::test]
    async fn should_share_setup_between_concurrent_callers() {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(registry(&broker).await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.ensure_channel("orders").await })
            })
            .collect();

        let mut serials = vec![];
        for handle in handles {
            serials.push(handle.await.unwrap().unwrap().serial());
        }
        serials.dedup();

        assert_eq!(serials.len(), 1);
    }

    #[tokio::test]
    async fn should_replace_closed_channel() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;

        let first = registry.ensure_channel("orders").await.unwrap();
        first.close().await;

        let second = registry.ensure_channel("orders").await.unwrap();

        assert_ne!(first.serial(), second.serial());
        assert!(second.is_open());
        assert!(registry.channel(first.serial()).is_none());
        assert!(registry.channel(second.serial()).is_some());
    }

    #[tokio::test]
    async fn should_remember_explicit_declarations() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;

        registry
            .declare_queue(QueueDefinition::new("orders").durable())
            .await
            .unwrap();

        assert!(registry.ensure_channel("orders").await.is_ok());
    }

    #[tokio::test]
    async fn should_surface_conflicting_declare() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;
        registry.ensure_channel("orders").await.unwrap();

        let res = registry
            .declare_queue(QueueDefinition::new("orders").durable())
            .await;

        assert_eq!(res, Err(MessagingError::QueueConflict("orders".to_owned())));
        assert!(registry.ensure_channel("orders").await.unwrap().is_open());
    }

    #[tokio::test]
    async fn should_fail_lifecycle_operations_on_missing_queue() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;
        let missing = MessagingError::QueueNotFound("missing".to_owned());

        assert_eq!(registry.inspect_queue("missing").await, Err(missing.clone()));
        assert_eq!(registry.purge_queue("missing").await, Err(missing.clone()));
        assert_eq!(registry.delete_queue("missing").await, Err(missing));
    }

    #[tokio::test]
    async fn should_delete_queue_and_forget_its_channel() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;
        let channel = registry.ensure_channel("orders").await.unwrap();

        assert_eq!(registry.delete_queue("orders").await, Ok(0));

        assert!(registry.queue_names().unwrap().is_empty());
        assert!(registry.channel(channel.serial()).is_none());
        assert_eq!(broker.ready_count("orders"), None);
    }

    #[tokio::test]
    async fn should_reject_operations_after_close() {
        let broker = InMemoryBroker::new();
        let registry = registry(&broker).await;
        let channel = registry.ensure_channel("orders").await.unwrap();

        registry.close().await;

        assert!(!channel.is_open());
        assert!(matches!(
            registry.ensure_channel("orders").await,
            Err(MessagingError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn should_fail_when_connection_is_lost() {
        let mut conn = MockAmqpConnection::new();
        conn.expect_is_connected().returning(|| false);

        let registry = ChannelRegistry::new(Arc::new(conn), settings());

        assert!(matches!(
            registry.ensure_channel("orders").await,
            Err(MessagingError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn should_close_channel_when_declare_fails() {
        let mut conn = MockAmqpConnection::new();
        conn.expect_is_connected().returning(|| true);
        conn.expect_create_channel().times(1).returning(|| {
            let mut channel = MockAmqpChannel::new();
            channel
                .expect_queue_declare()
                .returning(|_| Err(MessagingError::QueueConflict(String::new())));
            channel.expect_close().times(1).returning(|| Ok(()));
            Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
        });

        let registry = ChannelRegistry::new(Arc::new(conn), settings());

        assert_eq!(
            registry.ensure_channel("orders").await.err(),
            Some(MessagingError::QueueConflict("orders".to_owned()))
        );
        assert!(registry.queue_names().unwrap().is_empty());
    }
}
