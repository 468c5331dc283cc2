use messaging::datasource::EntityInfo;

/// Declaration of a queue bound to the default exchange.
///
/// Defaults to a non durable, non exclusive, non auto-delete queue without
/// arguments; durability has to be requested explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_priority: Option<u8>,
}

impl QueueDefinition {
    pub fn new<T: Into<String>>(name: T) -> QueueDefinition {
        QueueDefinition {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            ttl: None,
            max_priority: None,
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Message TTL in milliseconds (`x-message-ttl`).
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Enables priority ordering up to `max` (`x-max-priority`).
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same properties, regardless of the name.
    pub(crate) fn is_compatible(&self, other: &QueueDefinition) -> bool {
        self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.auto_delete == other.auto_delete
            && self.ttl == other.ttl
            && self.max_priority == other.max_priority
    }
}

/// Result of a declare or a passive inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

impl From<QueueInfo> for EntityInfo {
    fn from(info: QueueInfo) -> Self {
        EntityInfo {
            name: info.name,
            message_count: info.message_count,
            consumer_count: info.consumer_count,
        }
    }
}
