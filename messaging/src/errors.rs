use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum MessagingError {
    #[error("internal error")]
    InternalError,

    #[error("connection failure - {0}")]
    ConnectionError(String),

    #[error("channel failure on queue `{queue}` - {reason}")]
    ChannelError { queue: String, reason: String },

    #[error("queue `{0}` was not found")]
    QueueNotFound(String),

    #[error("queue `{0}` already exists with incompatible properties")]
    QueueConflict(String),

    #[error("failure to publish to `{queue}` - {reason}")]
    PublishError { queue: String, reason: String },

    #[error("failure to ack message from `{queue}` - {reason}")]
    AckError { queue: String, reason: String },

    #[error("failure to serialize payload - {0}")]
    SerializationError(String),

    #[error("operation not supported - {0}")]
    NotSupported(String),

    #[error("failure to create the consumer - {0}")]
    CreatingConsumerError(String),

    #[error("failure to consume message - {0}")]
    ConsumerError(String),
}

impl MessagingError {
    /// Every subsequent operation fails until the connection is opened again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MessagingError::ConnectionError(_))
    }

    /// Retrying after re-ensuring the channel (or resubscribing) may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MessagingError::ChannelError { .. }
                | MessagingError::PublishError { .. }
                | MessagingError::AckError { .. }
                | MessagingError::CreatingConsumerError(_)
        )
    }

    pub fn channel<Q: Into<String>, R: ToString>(queue: Q, reason: R) -> Self {
        MessagingError::ChannelError {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub fn publish<Q: Into<String>, R: ToString>(queue: Q, reason: R) -> Self {
        MessagingError::PublishError {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub fn ack<Q: Into<String>, R: ToString>(queue: Q, reason: R) -> Self {
        MessagingError::AckError {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    /// Fills the queue of errors raised below the layer that knows it.
    pub fn for_queue(self, name: &str) -> Self {
        match self {
            MessagingError::ChannelError { queue, reason } if queue.is_empty() => {
                MessagingError::channel(name, reason)
            }
            MessagingError::PublishError { queue, reason } if queue.is_empty() => {
                MessagingError::publish(name, reason)
            }
            MessagingError::AckError { queue, reason } if queue.is_empty() => {
                MessagingError::ack(name, reason)
            }
            MessagingError::QueueNotFound(queue) if queue.is_empty() => {
                MessagingError::QueueNotFound(name.to_owned())
            }
            MessagingError::QueueConflict(queue) if queue.is_empty() => {
                MessagingError::QueueConflict(name.to_owned())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_errors() {
        assert!(MessagingError::ConnectionError("refused".to_owned()).is_fatal());
        assert!(!MessagingError::ConnectionError("refused".to_owned()).is_recoverable());
        assert!(MessagingError::channel("orders", "closed").is_recoverable());
        assert!(MessagingError::publish("orders", "closed").is_recoverable());
        assert!(!MessagingError::QueueNotFound("orders".to_owned()).is_recoverable());
        assert!(!MessagingError::NotSupported("commit".to_owned()).is_fatal());
    }

    #[test]
    fn should_fill_missing_queue_only() {
        let err = MessagingError::ack("", "unknown delivery tag").for_queue("orders");
        assert_eq!(err, MessagingError::ack("orders", "unknown delivery tag"));

        let err = MessagingError::channel("invoices", "closed").for_queue("orders");
        assert_eq!(err, MessagingError::channel("invoices", "closed"));

        let err = MessagingError::ConnectionError("reset".to_owned()).for_queue("orders");
        assert_eq!(err, MessagingError::ConnectionError("reset".to_owned()));
    }

    #[test]
    fn should_carry_queue_and_reason_in_message() {
        let err = MessagingError::ack("orders", "channel closed");

        assert_eq!(
            err.to_string(),
            "failure to ack message from `orders` - channel closed"
        );
    }
}
