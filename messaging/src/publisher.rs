use crate::{errors::MessagingError, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;

#[cfg(any(test, feature = "mocks"))]
use mockall::*;

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `msg` to `queue` through the default exchange.
    async fn publish(&self, ctx: &Context, queue: &str, msg: &Message)
        -> Result<(), MessagingError>;
}
