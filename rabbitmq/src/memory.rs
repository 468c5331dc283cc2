use crate::{
    config::ConnectionParams,
    queue::{QueueDefinition, QueueInfo},
    transport::{AmqpChannel, AmqpConnection, AmqpTransport, DeliveryStream, WireDelivery},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::protocol::basic::AMQPProperties;
use messaging::errors::MessagingError;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type DeliverySender = mpsc::UnboundedSender<Result<WireDelivery, MessagingError>>;

/// A broker living in the process memory, following AMQP 0-9-1 semantics
/// closely enough to exercise the connector without a running RabbitMQ:
///
/// * delivery tags are scoped to the channel that delivered the message;
/// * unacknowledged deliveries are requeued, flagged as redelivered, when their
///   channel or connection closes;
/// * soft errors (missing queue, conflicting declare, unknown delivery tag)
///   close the channel they happened on;
/// * exclusive queues belong to the declaring connection and die with it;
/// * messages published to a missing queue are dropped.
///
/// Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Refuses connections that do not present these credentials.
    pub fn with_credentials<U, P>(self, user: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        if let Ok(mut state) = self.state.lock() {
            state.credentials = Some((user.into(), password.into()));
        }
        self
    }

    /// While unavailable every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = !available;
        }
    }

    /// Makes the broker nack every publish done on a channel in confirm mode.
    pub fn nack_publishes(&self, nack: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.nack_publishes = nack;
        }
    }

    /// Simulates a network failure: every open connection is lost and active
    /// consumers receive a connection error.
    pub fn drop_connections(&self) {
        if let Ok(mut state) = self.state.lock() {
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, conn)| conn.open)
                .map(|(key, _)| *key)
                .collect();

            for key in open {
                state.close_connection(
                    key,
                    Some(MessagingError::ConnectionError(
                        "connection reset by peer".to_owned(),
                    )),
                );
            }
        }
    }

    /// Ready (not delivered) messages of `queue`, `None` when it does not exist.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.ready.len()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, MessagingError> {
        self.state.lock().map_err(|_| MessagingError::InternalError)
    }
}

#[async_trait]
impl AmqpTransport for InMemoryBroker {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn AmqpConnection>, MessagingError> {
        let mut state = self.lock()?;

        if state.unavailable {
            return Err(MessagingError::ConnectionError(
                "connection refused".to_owned(),
            ));
        }

        if let Some((user, password)) = &state.credentials {
            if *user != params.user || *password != params.password {
                return Err(MessagingError::ConnectionError(
                    "ACCESS_REFUSED - login was refused".to_owned(),
                ));
            }
        }

        state.next_connection += 1;
        let key = state.next_connection;
        state.connections.insert(
            key,
            ConnectionEntry {
                open: true,
                next_channel_id: 0,
            },
        );

        debug!(uri = params.redacted_uri(), "in-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            key,
        }))
    }
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    credentials: Option<(String, String)>,
    nack_publishes: bool,
    next_connection: u64,
    connections: HashMap<u64, ConnectionEntry>,
    next_channel: u64,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
}

struct ConnectionEntry {
    open: bool,
    next_channel_id: u16,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    prefetch: u16,
    confirm: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelEntry {
    fn has_capacity(&self, consumer_tag: &str) -> bool {
        if self.prefetch == 0 {
            return true;
        }

        let in_flight = self
            .unacked
            .values()
            .filter(|u| u.consumer_tag.as_deref() == Some(consumer_tag))
            .count();

        in_flight < usize::from(self.prefetch)
    }

    fn deliver(&mut self, queue: &str, consumer_tag: Option<&str>, msg: StoredMessage) -> WireDelivery {
        self.next_tag += 1;

        let delivery = WireDelivery {
            delivery_tag: self.next_tag,
            redelivered: msg.redelivered,
            routing_key: queue.to_owned(),
            properties: msg.properties.clone(),
            body: msg.body.clone(),
        };

        self.unacked.insert(
            self.next_tag,
            Unacked {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.map(str::to_owned),
                message: msg,
            },
        );

        delivery
    }
}

struct Unacked {
    queue: String,
    consumer_tag: Option<String>,
    message: StoredMessage,
}

#[derive(Clone)]
struct StoredMessage {
    properties: AMQPProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct QueueEntry {
    def: QueueDefinition,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: VecDeque<ConsumerEntry>,
    had_consumers: bool,
}

impl QueueEntry {
    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.def.name.clone(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn locked_for(&self, connection: u64) -> bool {
        matches!(self.owner, Some(owner) if owner != connection)
    }

    fn enqueue(&mut self, msg: StoredMessage) {
        let Some(max) = self.def.max_priority else {
            self.ready.push_back(msg);
            return;
        };

        let priority = |m: &StoredMessage| m.properties.priority().unwrap_or(0).min(max);
        let incoming = priority(&msg);

        match self.ready.iter().position(|m| priority(m) < incoming) {
            Some(index) => self.ready.insert(index, msg),
            None => self.ready.push_back(msg),
        }
    }
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    sender: DeliverySender,
}

impl BrokerState {
    fn ensure_open(&self, channel: u64) -> Result<u64, MessagingError> {
        let entry = self
            .channels
            .get(&channel)
            .ok_or_else(|| MessagingError::channel("", "channel is closed"))?;

        let connection_open = self
            .connections
            .get(&entry.connection)
            .map(|conn| conn.open)
            .unwrap_or(false);

        if !connection_open {
            return Err(MessagingError::ConnectionError(
                "connection is closed".to_owned(),
            ));
        }

        if !entry.open {
            return Err(MessagingError::channel("", "channel is closed"));
        }

        Ok(entry.connection)
    }

    /// Checks `queue` exists and is usable from `connection`, closing the
    /// channel otherwise.
    fn usable_queue(
        &mut self,
        channel: u64,
        connection: u64,
        queue: &str,
    ) -> Result<(), MessagingError> {
        match self.queues.get(queue).map(|q| q.locked_for(connection)) {
            None => Err(self.soft_error(channel, MessagingError::QueueNotFound(queue.to_owned()))),
            Some(true) => {
                Err(self.soft_error(channel, MessagingError::QueueConflict(queue.to_owned())))
            }
            Some(false) => Ok(()),
        }
    }

    fn soft_error(&mut self, channel: u64, err: MessagingError) -> MessagingError {
        debug!(error = err.to_string(), "closing in-memory channel after soft error");
        self.close_channel(channel, None);
        err
    }

    fn close_channel(&mut self, channel: u64, reason: Option<MessagingError>) {
        let unacked = match self.channels.get_mut(&channel) {
            Some(entry) if entry.open => {
                entry.open = false;
                std::mem::take(&mut entry.unacked)
            }
            _ => return,
        };

        let mut affected = self.remove_consumers(reason, |c| c.channel == channel);

        for (_, pending) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&pending.queue) {
                let mut message = pending.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                affected.push(pending.queue);
            }
        }

        affected.sort();
        affected.dedup();
        for queue in affected {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: u64, reason: Option<MessagingError>) {
        match self.connections.get_mut(&connection) {
            Some(entry) if entry.open => entry.open = false,
            _ => return,
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection)
            .map(|(key, _)| *key)
            .collect();

        for channel in channels {
            self.close_channel(channel, reason.clone());
        }

        self.queues
            .retain(|_, queue| queue.owner != Some(connection));
    }

    /// Removes the matching consumers and returns the queues they consumed.
    /// Auto-delete queues left without consumers are deleted.
    fn remove_consumers<F>(&mut self, reason: Option<MessagingError>, matches: F) -> Vec<String>
    where
        F: Fn(&ConsumerEntry) -> bool,
    {
        let mut affected = vec![];

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                if !matches(consumer) {
                    return true;
                }
                if let Some(err) = &reason {
                    let _ = consumer.sender.send(Err(err.clone()));
                }
                false
            });

            if queue.consumers.len() != before {
                affected.push(name.clone());
            }
        }

        self.queues.retain(|_, queue| {
            !(queue.def.auto_delete && queue.had_consumers && queue.consumers.is_empty())
        });

        affected.retain(|name| self.queues.contains_key(name));
        affected
    }

    /// Hands ready messages to consumers in round robin, honoring prefetch.
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;

        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        queue.consumers.retain(|consumer| !consumer.sender.is_closed());

        let mut idle = 0;
        while !queue.ready.is_empty() && idle < queue.consumers.len() {
            let Some(consumer) = queue.consumers.pop_front() else {
                break;
            };

            match channels.get_mut(&consumer.channel) {
                Some(channel) if channel.open && channel.has_capacity(&consumer.tag) => {
                    if let Some(msg) = queue.ready.pop_front() {
                        let delivery = channel.deliver(name, Some(&consumer.tag), msg);
                        let _ = consumer.sender.send(Ok(delivery));
                    }
                    idle = 0;
                }
                _ => idle += 1,
            }

            queue.consumers.push_back(consumer);
        }
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    key: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.broker
            .state
            .lock()
            .ok()
            .and_then(|state| state.connections.get(&self.key).map(|conn| conn.open))
            .unwrap_or(false)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, MessagingError> {
        let mut state = self.broker.lock()?;

        let id = match state.connections.get_mut(&self.key) {
            Some(conn) if conn.open => {
                conn.next_channel_id = conn.next_channel_id.wrapping_add(1).max(1);
                conn.next_channel_id
            }
            _ => {
                return Err(MessagingError::ConnectionError(
                    "connection is closed".to_owned(),
                ))
            }
        };

        state.next_channel += 1;
        let key = state.next_channel;
        state.channels.insert(
            key,
            ChannelEntry {
                connection: self.key,
                open: true,
                prefetch: 0,
                confirm: false,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            key,
            id,
        }))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.broker.lock()?.close_connection(self.key, None);
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    key: u64,
    id: u16,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .map(|state| state.ensure_open(self.key).is_ok())
            .unwrap_or(false)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), MessagingError> {
        let mut state = self.broker.lock()?;
        state.ensure_open(self.key)?;

        if let Some(channel) = state.channels.get_mut(&self.key) {
            channel.prefetch = prefetch_count;
        }

        let consumed: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.consumers.iter().any(|c| c.channel == self.key))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in consumed {
            state.dispatch(&queue);
        }

        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), MessagingError> {
        let mut state = self.broker.lock()?;
        state.ensure_open(self.key)?;

        if let Some(channel) = state.channels.get_mut(&self.key) {
            channel.confirm = true;
        }

        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueInfo, MessagingError> {
        let mut state = self.broker.lock()?;
        let connection = state.ensure_open(self.key)?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        let conflicting = state
            .queues
            .get(&name)
            .map(|q| q.locked_for(connection) || !q.def.is_compatible(def));

        match conflicting {
            Some(true) => {
                return Err(state.soft_error(self.key, MessagingError::QueueConflict(name)))
            }
            Some(false) => {}
            None => {
                let mut def = def.clone();
                def.name = name.clone();
                let owner = def.exclusive.then_some(connection);

                state.queues.insert(
                    name.clone(),
                    QueueEntry {
                        def,
                        owner,
                        ready: VecDeque::new(),
                        consumers: VecDeque::new(),
                        had_consumers: false,
                    },
                );
            }
        }

        state
            .queues
            .get(&name)
            .map(QueueEntry::info)
            .ok_or(MessagingError::InternalError)
    }

    async fn queue_inspect(&self, name: &str) -> Result<QueueInfo, MessagingError> {
        let mut state = self.broker.lock()?;
        let connection = state.ensure_open(self.key)?;
        state.usable_queue(self.key, connection, name)?;

        state
            .queues
            .get(name)
            .map(QueueEntry::info)
            .ok_or(MessagingError::InternalError)
    }

    async fn queue_delete(&self, name: &str) -> Result<u32, MessagingError> {
        let mut state = self.broker.lock()?;
        let connection = state.ensure_open(self.key)?;

        if !state.queues.contains_key(name) {
            return Ok(0);
        }
        state.usable_queue(self.key, connection, name)?;

        Ok(state
            .queues
            .remove(name)
            .map(|q| q.ready.len() as u32)
            .unwrap_or(0))
    }

    async fn queue_purge(&self, name: &str) -> Result<u32, MessagingError> {
        let mut state = self.broker.lock()?;
        let connection = state.ensure_open(self.key)?;
        state.usable_queue(self.key, connection, name)?;

        Ok(state
            .queues
            .get_mut(name)
            .map(|q| {
                let purged = q.ready.len() as u32;
                q.ready.clear();
                purged
            })
            .unwrap_or(0))
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        properties: AMQPProperties,
        body: &[u8],
    ) -> Result<(), MessagingError> {
        let mut state = self.broker.lock()?;
        state.ensure_open(self.key)?;

        let confirm = state
            .channels
            .get(&self.key)
            .map(|ch| ch.confirm)
            .unwrap_or(false);
        if confirm && state.nack_publishes {
            return Err(MessagingError::publish(
                routing_key,
                "broker refused the message",
            ));
        }

        let Some(queue) = state.queues.get_mut(routing_key) else {
            debug!(queue = routing_key, "dropping unroutable message");
            return Ok(());
        };

        queue.enqueue(StoredMessage {
            properties,
            body: body.to_vec(),
            redelivered: false,
        });
        state.dispatch(routing_key);

        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<WireDelivery>, MessagingError> {
        let mut state = self.broker.lock()?;
        let connection = state.ensure_open(self.key)?;
        state.usable_queue(self.key, connection, queue)?;

        let BrokerState {
            queues, channels, ..
        } = &mut *state;

        let msg = queues.get_mut(queue).and_then(|q| q.ready.pop_front());

        Ok(match (msg, channels.get_mut(&self.key)) {
            (Some(msg), Some(channel)) => Some(channel.deliver(queue, None, msg)),
            _ => None,
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError> {
        let mut state = self.broker.lock()?;
        let connection = state.ensure_open(self.key)?;
        state.usable_queue(self.key, connection, queue)?;

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        let duplicated = state.queues.values().any(|q| {
            q.consumers
                .iter()
                .any(|c| c.channel == self.key && c.tag == tag)
        });
        if duplicated {
            return Err(state.soft_error(
                self.key,
                MessagingError::channel(queue, format!("NOT_ALLOWED - duplicated consumer tag {}", tag)),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(entry) = state.queues.get_mut(queue) {
            entry.had_consumers = true;
            entry.consumers.push_back(ConsumerEntry {
                tag,
                channel: self.key,
                sender,
            });
        }
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let mut state = self.broker.lock()?;
        state.ensure_open(self.key)?;

        let key = self.key;
        state.remove_consumers(None, |c| c.channel == key && c.tag == consumer_tag);

        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let mut state = self.broker.lock()?;
        state.ensure_open(self.key)?;

        let acked = state
            .channels
            .get_mut(&self.key)
            .and_then(|ch| ch.unacked.remove(&delivery_tag));

        match acked {
            Some(pending) => {
                state.dispatch(&pending.queue);
                Ok(())
            }
            None => Err(state.soft_error(
                self.key,
                MessagingError::ack(
                    "",
                    format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
                ),
            )),
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let mut state = self.broker.lock()?;
        state.ensure_open(self.key)?;

        let nacked = state
            .channels
            .get_mut(&self.key)
            .and_then(|ch| ch.unacked.remove(&delivery_tag));

        let Some(pending) = nacked else {
            return Err(state.soft_error(
                self.key,
                MessagingError::ack(
                    "",
                    format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
                ),
            ));
        };

        if requeue {
            if let Some(queue) = state.queues.get_mut(&pending.queue) {
                let mut message = pending.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        state.dispatch(&pending.queue);

        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.broker.lock()?.close_channel(self.key, None);
        Ok(())
    }
}
