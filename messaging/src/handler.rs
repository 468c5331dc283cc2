use crate::{errors::MessagingError, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;

#[cfg(any(test, feature = "mocks"))]
use mockall::*;

/// Callback invoked for every delivery of a subscription.
///
/// Invocations for one queue are sequential, a slow handler holds back the
/// next delivery of the same queue only.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), MessagingError>;
}
